//! Deferred data-sync dispatch.
//!
//! Retry and backoff belong to the host: a failed sync is reported as a
//! failure and the host redelivers the tag later.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The application's data-sync collaborator.
#[async_trait]
pub trait SyncTask: Send + Sync {
  /// Must be idempotent; the host may call it any number of times.
  async fn run_sync_task(&self, tag: &str) -> Result<()>;
}

/// Stands in until the application supplies a real sync implementation.
#[derive(Debug, Default)]
pub struct PlaceholderSync;

#[async_trait]
impl SyncTask for PlaceholderSync {
  async fn run_sync_task(&self, tag: &str) -> Result<()> {
    info!(tag, "Data sync requested; nothing to synchronize");
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed,
  /// Tag is not the reserved data-sync tag
  Ignored,
}

pub struct SyncCoordinator {
  tag: String,
  task: Arc<dyn SyncTask>,
}

impl SyncCoordinator {
  pub fn new(tag: String, task: Arc<dyn SyncTask>) -> Self {
    Self { tag, task }
  }

  /// Run the data-sync task for the reserved tag. Its failure is returned
  /// unchanged so the host can schedule a retry.
  pub async fn on_sync(&self, tag: &str) -> Result<SyncOutcome> {
    if tag != self.tag {
      debug!(tag, "Ignoring sync tag");
      return Ok(SyncOutcome::Ignored);
    }

    match self.task.run_sync_task(tag).await {
      Ok(()) => Ok(SyncOutcome::Completed),
      Err(e) => {
        warn!(tag, "Sync failed, leaving retry to host: {}", e);
        Err(e)
      }
    }
  }
}
