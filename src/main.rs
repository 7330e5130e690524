mod cache;
mod commands;
mod config;
mod event;
mod host;
mod network;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::SqliteStorage;
use event::Dispatcher;
use host::{Host, LocalHost};
use network::{HttpNetwork, Network};
use worker::sync::PlaceholderSync;
use worker::Controller;

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline resilience controller: network-first fetch with versioned cache fallback")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  /// Also write logs to this file
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the current generation from the manifest
  Install,
  /// Purge every other generation and claim open windows
  Activate,
  /// Install, then activate if the install succeeded
  Upgrade,
  /// Send a request through the fetch interceptor
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Extra request header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Deliver a control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// Deliver a push with an optional JSON payload
  Push {
    payload: Option<String>,
    /// Click the notification afterwards
    #[arg(long)]
    click: bool,
  },
  /// Deliver a background sync event
  Sync { tag: String },
  /// List cache generations
  Caches,
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(verbose: u8) -> &'static str {
  match verbose {
    0 => "offgrid=info",
    1 => "offgrid=debug",
    _ => "offgrid=trace",
  }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .with(file_layer)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let storage = Arc::new(SqliteStorage::open(&config.cache_path()?)?);

  if let Command::Caches = args.command {
    return commands::caches(&config, &storage).await;
  }

  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
  let host = Arc::new(LocalHost::new());

  let controller = Controller::new(
    &config,
    Arc::clone(&storage),
    Arc::clone(&network),
    Arc::clone(&host) as Arc<dyn Host>,
    Arc::new(PlaceholderSync),
  )?;
  let events = Arc::new(Dispatcher::for_controller(Arc::new(controller))).spawn();

  let rt = commands::Runtime {
    config,
    storage,
    network,
    host,
    events,
  };

  match args.command {
    Command::Install => commands::install(&rt).await,
    Command::Activate => commands::activate(&rt).await,
    Command::Upgrade => commands::upgrade(&rt).await,
    Command::Fetch {
      url,
      navigate,
      method,
      headers,
    } => commands::fetch(&rt, &url, navigate, &method, &headers).await,
    Command::Message { json } => commands::message(&rt, &json).await,
    Command::Push { payload, click } => commands::push(&rt, payload.as_deref(), click).await,
    Command::Sync { tag } => commands::sync(&rt, &tag).await,
    Command::Caches => commands::caches(&rt.config, &rt.storage).await,
  }
}
