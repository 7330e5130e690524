//! Control messages sent by the foreground application.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::lifecycle::LifecycleManager;
use crate::cache::{run_blocking, CacheStorage};

/// Command envelope, e.g. `{"type":"CLEAR_CACHE"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  ClearCache,
  /// Any command this version does not know
  #[serde(other)]
  Unknown,
}

impl ControlMessage {
  /// Parse an envelope. Malformed envelopes are treated like unknown commands.
  pub fn parse(raw: &str) -> Self {
    serde_json::from_str(raw).unwrap_or_else(|e| {
      debug!("Unparseable control message: {}", e);
      ControlMessage::Unknown
    })
  }
}

/// Reply to `CLEAR_CACHE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheReply {
  pub success: bool,
}

/// Reply port handed over with a message.
pub type ReplyPort = oneshot::Sender<ClearCacheReply>;

pub struct ControlHandler<S: CacheStorage> {
  storage: Arc<S>,
  lifecycle: Arc<LifecycleManager<S>>,
}

impl<S: CacheStorage + 'static> ControlHandler<S> {
  pub fn new(storage: Arc<S>, lifecycle: Arc<LifecycleManager<S>>) -> Self {
    Self { storage, lifecycle }
  }

  pub async fn handle(
    &self,
    message: &ControlMessage,
    reply: Option<ReplyPort>,
  ) -> color_eyre::Result<()> {
    match message {
      ControlMessage::SkipWaiting => self.lifecycle.skip_waiting().await,
      ControlMessage::ClearCache => {
        let success = self.clear_cache().await;
        if let Some(port) = reply {
          // The caller may have stopped listening
          let _ = port.send(ClearCacheReply { success });
        }
        Ok(())
      }
      ControlMessage::Unknown => {
        debug!("Ignoring unknown control message");
        Ok(())
      }
    }
  }

  /// Delete the whole current generation. Only successful fetches repopulate it.
  async fn clear_cache(&self) -> bool {
    let generation = self.lifecycle.generation().to_string();
    let target = generation.clone();

    match run_blocking(&self.storage, move |s| s.delete_cache(&target)).await {
      Ok(existed) => {
        info!(generation = %generation, existed, "Cleared cache");
        true
      }
      Err(e) => {
        error!(generation = %generation, "Failed to clear cache: {}", e);
        false
      }
    }
  }
}
