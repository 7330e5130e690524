//! Push payload decoding and notification click routing.

use color_eyre::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationDefaults;
use crate::host::{Host, Notification, NotificationAction, WindowClient};

/// Inbound push payload. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  pub require_interaction: Option<bool>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  pub data: Option<serde_json::Value>,
}

impl PushPayload {
  /// Decode a payload; anything unreadable becomes an empty payload.
  pub fn decode(raw: Option<&[u8]>) -> Self {
    let Some(bytes) = raw.filter(|b| !b.is_empty()) else {
      return Self::default();
    };

    serde_json::from_slice(bytes).unwrap_or_else(|e| {
      warn!("Unreadable push payload, using defaults: {}", e);
      Self::default()
    })
  }

  /// Fill missing fields from the configured defaults.
  pub fn into_notification(self, defaults: &NotificationDefaults) -> Notification {
    Notification {
      title: self.title.unwrap_or_else(|| defaults.title.clone()),
      body: self.body.unwrap_or_else(|| defaults.body.clone()),
      icon: self.icon.unwrap_or_else(|| defaults.icon.clone()),
      badge: self.badge.unwrap_or_else(|| defaults.badge.clone()),
      tag: self.tag.unwrap_or_else(|| defaults.tag.clone()),
      require_interaction: self.require_interaction.unwrap_or(false),
      actions: self.actions,
      data: self.data.unwrap_or(serde_json::Value::Null),
    }
  }
}

pub struct PushDispatcher {
  defaults: NotificationDefaults,
  origin: Url,
  host: Arc<dyn Host>,
}

impl PushDispatcher {
  pub fn new(defaults: NotificationDefaults, origin: Url, host: Arc<dyn Host>) -> Self {
    Self {
      defaults,
      origin,
      host,
    }
  }

  /// Decode and display a push. Only a failing display fails the event.
  pub async fn on_push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    let notification = PushPayload::decode(payload).into_notification(&self.defaults);
    info!(tag = %notification.tag, title = %notification.title, "Showing notification");
    self.host.show_notification(notification.clone()).await?;
    Ok(notification)
  }

  /// Close the notification and bring the user to its target URL, reusing an
  /// open window on that URL when there is one.
  pub async fn on_click(&self, notification: &Notification) -> Result<WindowClient> {
    self.host.close_notification(&notification.tag).await?;

    let target = self.target_url(notification);
    let windows = self.host.window_clients().await?;

    if let Some(window) = windows.iter().find(|w| same_url(&w.url, &target)) {
      debug!(window = window.id, url = %target, "Focusing existing window");
      return self.host.focus_window(window.id).await;
    }

    info!(url = %target, "Opening window");
    self.host.open_window(target.as_str()).await
  }

  /// `data.url` resolved against the origin; the application root otherwise.
  fn target_url(&self, notification: &Notification) -> Url {
    let path = notification
      .data
      .get("url")
      .and_then(|v| v.as_str())
      .unwrap_or("/");

    self.origin.join(path).unwrap_or_else(|e| {
      warn!("Invalid notification URL {}: {}", path, e);
      self.origin.clone()
    })
  }
}

fn same_url(window_url: &str, target: &Url) -> bool {
  Url::parse(window_url)
    .map(|u| u == *target)
    .unwrap_or(false)
}
