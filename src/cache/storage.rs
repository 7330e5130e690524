//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};
use crate::network::Response;

/// Trait for cache storage backends.
///
/// Caches are addressed by generation name; entries inside a generation by
/// request identity. Entries are never expired individually, only together
/// with their generation.
pub trait CacheStorage: Send + Sync {
  /// Open a generation, creating it if absent.
  fn open_cache(&self, generation: &str) -> Result<()>;

  fn has_cache(&self, generation: &str) -> Result<bool>;

  /// Whether the generation was populated by a completed `seed`. A
  /// generation that only received opportunistic `put`s is not seeded.
  fn is_seeded(&self, generation: &str) -> Result<bool>;

  /// Names of every existing generation.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Store one entry, replacing any previous entry for the same identity.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Create the generation and store all entries, or store nothing.
  fn seed(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Delete a generation and all its entries. Returns whether it existed.
  fn delete_cache(&self, generation: &str) -> Result<bool>;

  fn entry_count(&self, generation: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    // Databases created before seeding was tracked
    let has_seeded_at: bool = conn
      .query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('caches') WHERE name = 'seeded_at'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to inspect cache schema: {}", e))?;
    if !has_seeded_at {
      conn
        .execute("ALTER TABLE caches ADD COLUMN seeded_at TEXT", [])
        .map_err(|e| eyre!("Failed to add seeded_at column: {}", e))?;
    }

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation (name@version)
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set only by a completed seed
    seeded_at TEXT
);

-- Captured GET responses
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash),
    FOREIGN KEY (cache_name) REFERENCES caches(name) ON DELETE CASCADE
);
"#;

fn ensure_cacheable(key: &RequestKey) -> Result<()> {
  if key.is_cacheable() {
    Ok(())
  } else {
    Err(eyre!("Refusing to cache non-GET request {}", key))
  }
}

fn insert_cache(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, datetime('now'))",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", generation, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.cache_hash(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, generation: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_cache(&conn, generation)
  }

  fn has_cache(&self, generation: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", generation, e))?;

    Ok(found.is_some())
  }

  fn is_seeded(&self, generation: &str) -> Result<bool> {
    let conn = self.lock()?;

    let seeded_at: Option<Option<String>> = conn
      .query_row(
        "SELECT seeded_at FROM caches WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", generation, e))?;

    Ok(matches!(seeded_at, Some(Some(_))))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    ensure_cacheable(key)?;
    let conn = self.lock()?;
    insert_cache(&conn, generation)?;
    insert_entry(&conn, generation, key, response)
  }

  fn seed(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    for (key, _) in entries {
      ensure_cacheable(key)?;
    }

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_cache(&tx, generation)?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }
    tx.execute(
      "UPDATE caches SET seeded_at = datetime('now') WHERE name = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to mark {} as seeded: {}", generation, e))?;

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
        params![generation, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          generation: generation.to_string(),
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_cache(&self, generation: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  const GEN: &str = "ops-dashboard@v1";

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("https://app.test/").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_then_lookup() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::new(200, "hello").with_header("Content-Type", "text/plain");

    storage.put(GEN, &key("/a"), &response).unwrap();

    let cached = storage.lookup(GEN, &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response, response);
    assert_eq!(cached.generation, GEN);
    assert!(storage.has_cache(GEN).unwrap());
  }

  #[test]
  fn test_lookup_is_scoped_to_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(GEN, &key("/a"), &Response::new(200, "a")).unwrap();

    assert!(storage.lookup("ops-dashboard@v2", &key("/a")).unwrap().is_none());
  }

  #[test]
  fn test_last_write_wins() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(GEN, &key("/a"), &Response::new(200, "first")).unwrap();
    storage.put(GEN, &key("/a"), &Response::new(200, "second")).unwrap();

    let cached = storage.lookup(GEN, &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"second");
    assert_eq!(storage.entry_count(GEN).unwrap(), 1);
  }

  #[test]
  fn test_non_get_rejected() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let post = RequestKey::new("POST", &Url::parse("https://app.test/api").unwrap());

    assert!(storage.put(GEN, &post, &Response::new(200, "")).is_err());
    assert!(!storage.has_cache(GEN).unwrap());
  }

  #[test]
  fn test_seed_is_all_or_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let post = RequestKey::new("POST", &Url::parse("https://app.test/api").unwrap());
    let entries = vec![
      (key("/"), Response::new(200, "shell")),
      (post, Response::new(200, "")),
    ];

    assert!(storage.seed(GEN, &entries).is_err());
    assert!(!storage.has_cache(GEN).unwrap());

    let entries = vec![
      (key("/"), Response::new(200, "shell")),
      (key("/offline.html"), Response::new(200, "offline")),
    ];
    storage.seed(GEN, &entries).unwrap();
    assert_eq!(storage.entry_count(GEN).unwrap(), 2);
  }

  #[test]
  fn test_only_seed_marks_generation_seeded() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(GEN, &key("/api/fleet"), &Response::new(200, "[]")).unwrap();
    storage.open_cache("ops-dashboard@v0").unwrap();

    assert!(storage.has_cache(GEN).unwrap());
    assert!(!storage.is_seeded(GEN).unwrap());
    assert!(!storage.is_seeded("ops-dashboard@v0").unwrap());
    assert!(!storage.is_seeded("ops-dashboard@v9").unwrap());

    storage
      .seed(GEN, &[(key("/offline.html"), Response::new(200, "offline"))])
      .unwrap();
    assert!(storage.is_seeded(GEN).unwrap());
    // Entries written before the seed are kept alongside it
    assert_eq!(storage.entry_count(GEN).unwrap(), 2);
  }

  #[test]
  fn test_failed_seed_does_not_mark_existing_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(GEN, &key("/api/fleet"), &Response::new(200, "[]")).unwrap();
    let post = RequestKey::new("POST", &Url::parse("https://app.test/api").unwrap());

    assert!(storage.seed(GEN, &[(post, Response::new(200, ""))]).is_err());
    assert!(!storage.is_seeded(GEN).unwrap());
  }

  #[test]
  fn test_delete_cache() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put(GEN, &key("/a"), &Response::new(200, "a")).unwrap();
    storage.open_cache("ops-dashboard@v0").unwrap();

    assert!(storage.delete_cache(GEN).unwrap());
    assert!(!storage.delete_cache(GEN).unwrap());
    assert!(storage.lookup(GEN, &key("/a")).unwrap().is_none());
    assert_eq!(storage.entry_count(GEN).unwrap(), 0);
    assert_eq!(storage.cache_names().unwrap(), vec!["ops-dashboard@v0"]);
  }

  #[test]
  fn test_open_on_disk() {
    let dir = std::env::temp_dir().join(format!("offgrid-test-{}", std::process::id()));
    let path = dir.join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put(GEN, &key("/a"), &Response::new(200, "a")).unwrap();
      storage
        .seed("ops-dashboard@v2", &[(key("/"), Response::new(200, "shell"))])
        .unwrap();
    }

    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.entry_count(GEN).unwrap(), 1);
    assert!(reopened.is_seeded("ops-dashboard@v2").unwrap());
    assert!(!reopened.is_seeded(GEN).unwrap());

    let _ = std::fs::remove_dir_all(&dir);
  }
}
