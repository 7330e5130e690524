//! The host platform the controller runs inside.
//!
//! The host owns everything the controller can only ask for: activation
//! precedence, control of open windows, and the notification tray.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// A notification ready to display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
  /// Opaque payload handed back on click
  pub data: serde_json::Value,
}

/// An open application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: u64,
  pub url: String,
  pub focused: bool,
}

#[async_trait]
pub trait Host: Send + Sync {
  /// Activate the installed generation without waiting for open contexts to close.
  async fn skip_waiting(&self) -> Result<()>;

  /// Route every open context through the active generation.
  async fn claim_clients(&self) -> Result<()>;

  /// Show a notification. A visible notification with the same tag is replaced.
  async fn show_notification(&self, notification: Notification) -> Result<()>;

  async fn close_notification(&self, tag: &str) -> Result<()>;

  /// Currently visible notifications.
  async fn notifications(&self) -> Result<Vec<Notification>>;

  async fn window_clients(&self) -> Result<Vec<WindowClient>>;

  async fn focus_window(&self, id: u64) -> Result<WindowClient>;

  async fn open_window(&self, url: &str) -> Result<WindowClient>;
}

#[derive(Debug, Default)]
struct HostState {
  skipped_waiting: bool,
  claimed: bool,
  notifications: Vec<Notification>,
  windows: Vec<WindowClient>,
  next_window_id: u64,
}

/// In-process host: keeps notifications and windows in memory.
#[derive(Debug, Default)]
pub struct LocalHost {
  state: Mutex<HostState>,
}

impl LocalHost {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start with an already open window.
  pub fn with_window(self, url: &str) -> Self {
    if let Ok(mut state) = self.state.lock() {
      push_window(&mut state, url, false);
    }
    self
  }

  pub fn skipped_waiting(&self) -> bool {
    self.lock().map(|s| s.skipped_waiting).unwrap_or(false)
  }

  pub fn claimed(&self) -> bool {
    self.lock().map(|s| s.claimed).unwrap_or(false)
  }

  fn lock(&self) -> Result<MutexGuard<'_, HostState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn push_window(state: &mut HostState, url: &str, focused: bool) -> WindowClient {
  state.next_window_id += 1;
  let window = WindowClient {
    id: state.next_window_id,
    url: url.to_string(),
    focused,
  };
  state.windows.push(window.clone());
  window
}

#[async_trait]
impl Host for LocalHost {
  async fn skip_waiting(&self) -> Result<()> {
    self.lock()?.skipped_waiting = true;
    Ok(())
  }

  async fn claim_clients(&self) -> Result<()> {
    self.lock()?.claimed = true;
    Ok(())
  }

  async fn show_notification(&self, notification: Notification) -> Result<()> {
    let mut state = self.lock()?;
    state.notifications.retain(|n| n.tag != notification.tag);
    state.notifications.push(notification);
    Ok(())
  }

  async fn close_notification(&self, tag: &str) -> Result<()> {
    self.lock()?.notifications.retain(|n| n.tag != tag);
    Ok(())
  }

  async fn notifications(&self) -> Result<Vec<Notification>> {
    Ok(self.lock()?.notifications.clone())
  }

  async fn window_clients(&self) -> Result<Vec<WindowClient>> {
    Ok(self.lock()?.windows.clone())
  }

  async fn focus_window(&self, id: u64) -> Result<WindowClient> {
    let mut state = self.lock()?;
    if !state.windows.iter().any(|w| w.id == id) {
      return Err(eyre!("No window with id {}", id));
    }

    for window in &mut state.windows {
      window.focused = window.id == id;
    }

    state
      .windows
      .iter()
      .find(|w| w.id == id)
      .cloned()
      .ok_or_else(|| eyre!("No window with id {}", id))
  }

  async fn open_window(&self, url: &str) -> Result<WindowClient> {
    let mut state = self.lock()?;
    for window in &mut state.windows {
      window.focused = false;
    }
    Ok(push_window(&mut state, url, true))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn notification(tag: &str, title: &str) -> Notification {
    Notification {
      title: title.to_string(),
      body: String::new(),
      icon: String::new(),
      badge: String::new(),
      tag: tag.to_string(),
      require_interaction: false,
      actions: Vec::new(),
      data: serde_json::Value::Null,
    }
  }

  #[tokio::test]
  async fn test_same_tag_replaces() {
    let host = LocalHost::new();
    host.show_notification(notification("t", "A")).await.unwrap();
    host.show_notification(notification("t", "B")).await.unwrap();
    host.show_notification(notification("other", "C")).await.unwrap();

    let shown = host.notifications().await.unwrap();
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].title, "B");
    assert_eq!(shown[1].title, "C");
  }

  #[tokio::test]
  async fn test_close_notification() {
    let host = LocalHost::new();
    host.show_notification(notification("t", "A")).await.unwrap();
    host.close_notification("t").await.unwrap();
    assert!(host.notifications().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_open_and_focus_windows() {
    let host = LocalHost::new().with_window("https://app.test/");
    let opened = host.open_window("https://app.test/reports").await.unwrap();
    assert_eq!(opened.id, 2);
    assert!(opened.focused);

    let focused = host.focus_window(1).await.unwrap();
    assert!(focused.focused);

    let windows = host.window_clients().await.unwrap();
    assert!(windows[0].focused);
    assert!(!windows[1].focused);

    assert!(host.focus_window(99).await.is_err());
  }
}
