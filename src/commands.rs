//! CLI commands: each one delivers events to a running dispatcher and
//! prints what the host observed.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::cache::{run_blocking, CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::event::{Event, EventSender};
use crate::host::{Host, LocalHost};
use crate::network::{Network, Request};
use crate::worker::control::ControlMessage;
use crate::worker::fetch::FetchOutcome;
use crate::worker::lifecycle::ActivationReport;

/// Everything a command needs.
pub struct Runtime {
  pub config: Config,
  pub storage: Arc<SqliteStorage>,
  pub network: Arc<dyn Network>,
  pub host: Arc<LocalHost>,
  pub events: EventSender,
}

pub async fn install(rt: &Runtime) -> Result<()> {
  rt.events.send(Event::Install).await?;
  println!(
    "Installed {} ({} resources)",
    rt.config.generation.cache_name(),
    rt.config.manifest.len()
  );
  Ok(())
}

pub async fn activate(rt: &Runtime) -> Result<()> {
  let report = rt.events.activate().await?;
  println!(
    "Activated {} (claimed open windows: {})",
    rt.config.generation.cache_name(),
    rt.host.claimed()
  );
  print!("{}", describe_report(&report));
  caches(&rt.config, &rt.storage).await
}

pub async fn upgrade(rt: &Runtime) -> Result<()> {
  let report = rt.events.upgrade().await?;
  println!("Upgraded to {}", rt.config.generation.cache_name());
  print!("{}", describe_report(&report));
  caches(&rt.config, &rt.storage).await
}

pub async fn fetch(
  rt: &Runtime,
  target: &str,
  navigate: bool,
  method: &str,
  headers: &[String],
) -> Result<()> {
  let url = rt.config.resolve(target)?;
  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  request = request.with_method(method);
  for raw in headers {
    let (name, value) = parse_header(raw)?;
    request = request.with_header(name, value);
  }

  let (tx, rx) = oneshot::channel();
  rt.events
    .send(Event::Fetch {
      request: request.clone(),
      respond_to: Some(tx),
    })
    .await?;
  let outcome = rx
    .await
    .map_err(|_| eyre!("Fetch handler did not respond"))?;

  println!("{}", describe_outcome(&outcome));

  // Not intercepted: the host performs the request on its own
  if matches!(outcome, FetchOutcome::PassThrough) && request.is_network_scheme() {
    let response = rt.network.fetch(&request).await?;
    println!(
      "status {} ({} bytes, {})",
      response.status,
      response.body.len(),
      response.header("content-type").unwrap_or("no content type")
    );
  }

  Ok(())
}

pub async fn message(rt: &Runtime, raw: &str) -> Result<()> {
  let message = ControlMessage::parse(raw);
  let (tx, rx) = oneshot::channel();

  rt.events
    .send(Event::Message {
      message: message.clone(),
      reply: Some(tx),
    })
    .await?;

  match message {
    ControlMessage::ClearCache => {
      let reply = rx
        .await
        .map_err(|_| eyre!("No reply to CLEAR_CACHE"))?;
      println!("{}", serde_json::to_string(&reply)?);
    }
    ControlMessage::SkipWaiting => {
      println!("skip waiting: {}", rt.host.skipped_waiting());
    }
    ControlMessage::Unknown => println!("ignored"),
  }

  Ok(())
}

pub async fn push(rt: &Runtime, payload: Option<&str>, click: bool) -> Result<()> {
  rt.events
    .send(Event::Push {
      payload: payload.map(|p| p.as_bytes().to_vec()),
    })
    .await?;

  let shown = rt.host.notifications().await?;
  for notification in &shown {
    println!("{}", serde_json::to_string_pretty(notification)?);
  }

  if click {
    if let Some(notification) = shown.last() {
      rt.events
        .send(Event::NotificationClick {
          notification: notification.clone(),
        })
        .await?;
      for window in rt.host.window_clients().await? {
        let marker = if window.focused { "*" } else { " " };
        println!("{} window {} {}", marker, window.id, window.url);
      }
    }
  }

  Ok(())
}

pub async fn sync(rt: &Runtime, tag: &str) -> Result<()> {
  rt.events
    .send(Event::Sync {
      tag: tag.to_string(),
    })
    .await?;
  println!("sync {} settled", tag);
  Ok(())
}

/// List every generation, marking the current one.
pub async fn caches(config: &Config, storage: &Arc<SqliteStorage>) -> Result<()> {
  let current = config.generation.cache_name();

  let listing = run_blocking(storage, |s| {
    s.cache_names()?
      .into_iter()
      .map(|name| {
        let count = s.entry_count(&name)?;
        Ok((name, count))
      })
      .collect::<Result<Vec<_>>>()
  })
  .await?;

  if listing.is_empty() {
    println!("No caches");
  }
  for (name, count) in listing {
    let marker = if name == current { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, count);
  }

  Ok(())
}

/// Split a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(&str, &str)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Invalid header '{}': empty name", raw));
  }
  Ok((name, value.trim()))
}

/// Deleted and failed generations, one per line.
pub fn describe_report(report: &ActivationReport) -> String {
  let mut out = String::new();
  for name in &report.deleted {
    out.push_str(&format!("deleted {}\n", name));
  }
  for (name, error) in &report.failed {
    out.push_str(&format!("failed to delete {}: {}\n", name, error));
  }
  out
}

/// One-line summary of a fetch outcome.
pub fn describe_outcome(outcome: &FetchOutcome) -> String {
  match outcome {
    FetchOutcome::PassThrough => "pass-through".to_string(),
    FetchOutcome::NetworkError => "network-error".to_string(),
    FetchOutcome::Respond(result) => {
      let mut line = format!(
        "{}: status {} ({} bytes)",
        result.source,
        result.data.status,
        result.data.body.len()
      );
      if let Some(cached_at) = result.cached_at {
        line.push_str(&format!(", cached {}", cached_at.format("%Y-%m-%d %H:%M:%S")));
      }
      line
    }
  }
}
