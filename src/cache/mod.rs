//! Versioned cache store.
//!
//! A cache store is a set of named generations (`name@version`), each a
//! mapping from GET request identity to a captured response:
//! - Entries are written on install (bulk seed) and on every successful fetch
//! - Entries are only ever removed together with their whole generation
//! - Storage calls are blocking and run off the async executor

mod storage;
mod traits;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse, RequestKey};

/// Run a storage operation on the blocking pool.
pub async fn run_blocking<S, T, F>(storage: &Arc<S>, op: F) -> Result<T>
where
  S: CacheStorage + 'static,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
{
  let storage = Arc::clone(storage);
  tokio::task::spawn_blocking(move || op(&storage))
    .await
    .map_err(|e| eyre!("Cache task failed: {}", e))?
}
