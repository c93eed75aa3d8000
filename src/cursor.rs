// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Progress cursor persistence.
//!
//! Stores, per name, the last successfully processed position:
//!
//! - group delivery: the last delivered [`ContentKey`] (keyed by group name)
//! - channel replication: the last replicated sequence (keyed by
//!   `replication/<channel>`)
//!
//! # Monotonic Advancement
//!
//! Cursors only move forward. `update_if_greater` is a no-op for a position
//! at or behind the stored one, and every [`CursorBackend`] repeats the
//! comparison on write so a stale flush can never rewind stored progress.
//!
//! # Backends
//!
//! - [`SqliteCursors`]: a file local to one node
//! - [`MemoryCursors`]: process memory, shared by stores in one process
//! - [`RedisCursors`](crate::redis_state::RedisCursors): shared by the cluster
//!
//! A node that gains leadership calls [`CursorStore::reload`] first, so it
//! starts from whatever the previous leader flushed.
//!
//! # Debounced Writes
//!
//! - `update_if_greater()` updates the in-memory cache and marks the cursor dirty
//! - `flush_dirty()` persists all dirty cursors in a batch
//! - The engine calls `flush_dirty()` periodically and on shutdown
//!
//! A crash between update and flush loses at most one flush interval of
//! progress. On restart those items are processed again (at-least-once).
//!
//! `delete()` waits for a flush in progress and bumps the name's generation,
//! so neither a late flush nor a late [`CursorStore::update_if_current`]
//! brings a deleted cursor back.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with bounded exponential backoff.
//! The cache is always updated first, so a failed disk write is retried on
//! the next flush.

use crate::config::CursorConfig;
use crate::content_key::ContentKey;
use crate::error::{BoxFuture, HubError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open a SQLite pool at `path` (`:memory:` for a private in-memory database).
pub(crate) async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    if path == MEMORY_PATH {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| HubError::Config(format!("Invalid SQLite path: {}", e)))?;
        // One long-lived connection: every connection would get its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        return Ok(pool);
    }

    let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| HubError::Config(format!("Invalid SQLite path: {}", e)))?
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .create_if_missing(true);
    if wal_mode {
        options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Durable home of the cursors.
///
/// Every node pointed at the same backend sees the same positions. Stores
/// are monotonic: `store_key` and `store_sequence` leave a stored position
/// at or ahead of the given one untouched.
pub trait CursorBackend: Send + Sync + 'static {
    fn load_keys(&self) -> BoxFuture<'_, HashMap<String, ContentKey>>;
    fn load_sequences(&self) -> BoxFuture<'_, HashMap<String, u64>>;
    fn load_key(&self, name: &str) -> BoxFuture<'_, Option<ContentKey>>;
    fn load_sequence(&self, name: &str) -> BoxFuture<'_, Option<u64>>;
    fn store_key(&self, name: &str, key: &ContentKey) -> BoxFuture<'_, ()>;
    fn store_sequence(&self, name: &str, sequence: u64) -> BoxFuture<'_, ()>;
    /// Remove both kinds of cursor stored under `name`.
    fn delete(&self, name: &str) -> BoxFuture<'_, ()>;

    fn checkpoint(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Cursors in a SQLite file, local to one node.
pub struct SqliteCursors {
    pool: SqlitePool,
    path: String,
}

impl SqliteCursors {
    pub async fn open(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Opening SQLite cursor backend");
        let pool = open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_cursors (
                name TEXT PRIMARY KEY,
                content_key TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sequence_cursors (
                name TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Pool shared with a SQLite registration store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl CursorBackend for SqliteCursors {
    fn load_keys(&self) -> BoxFuture<'_, HashMap<String, ContentKey>> {
        Box::pin(async move {
            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT name, content_key FROM key_cursors")
                    .fetch_all(&self.pool)
                    .await?;
            let mut keys = HashMap::with_capacity(rows.len());
            for (name, url) in rows {
                match ContentKey::from_url(&url) {
                    Some(key) => {
                        keys.insert(name, key);
                    }
                    None => warn!(name = %name, value = %url, "Ignoring unparseable key cursor"),
                }
            }
            Ok(keys)
        })
    }

    fn load_sequences(&self) -> BoxFuture<'_, HashMap<String, u64>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT name, sequence FROM sequence_cursors")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows
                .into_iter()
                .map(|(name, sequence)| (name, sequence.max(0) as u64))
                .collect())
        })
    }

    fn load_key(&self, name: &str) -> BoxFuture<'_, Option<ContentKey>> {
        let name = name.to_string();
        Box::pin(async move {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT content_key FROM key_cursors WHERE name = ?")
                    .bind(&name)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.and_then(|(url,)| ContentKey::from_url(&url)))
        })
    }

    fn load_sequence(&self, name: &str) -> BoxFuture<'_, Option<u64>> {
        let name = name.to_string();
        Box::pin(async move {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT sequence FROM sequence_cursors WHERE name = ?")
                    .bind(&name)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(sequence,)| sequence.max(0) as u64))
        })
    }

    fn store_key(&self, name: &str, key: &ContentKey) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        let url = key.to_url();
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            // Fixed-width time prefix: text order of the URL form is key order
            execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO key_cursors (name, content_key, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(name) DO UPDATE SET
                        content_key = excluded.content_key,
                        updated_at = excluded.updated_at
                    WHERE excluded.content_key > key_cursors.content_key
                    "#,
                )
                .bind(&name)
                .bind(&url)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
            Ok(())
        })
    }

    fn store_sequence(&self, name: &str, sequence: u64) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        let seq = i64::try_from(sequence).unwrap_or(i64::MAX);
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO sequence_cursors (name, sequence, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(name) DO UPDATE SET
                        sequence = excluded.sequence,
                        updated_at = excluded.updated_at
                    WHERE excluded.sequence > sequence_cursors.sequence
                    "#,
                )
                .bind(&name)
                .bind(seq)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
            Ok(())
        })
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("cursor_delete", || async {
                sqlx::query("DELETE FROM key_cursors WHERE name = ?")
                    .bind(&name)
                    .execute(pool)
                    .await?;
                sqlx::query("DELETE FROM sequence_cursors WHERE name = ?")
                    .bind(&name)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(())
        })
    }

    /// Force flush WAL to main database (for clean shutdown).
    fn checkpoint(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.path == MEMORY_PATH {
                return Ok(());
            }
            let pool = &self.pool;
            execute_with_retry("cursor_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(pool)
                    .await
            })
            .await?;
            debug!("WAL checkpoint complete");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}

/// Cursors held in process memory.
///
/// Several [`CursorStore`]s over one `MemoryCursors` behave like nodes
/// sharing a backend.
#[derive(Debug, Default)]
pub struct MemoryCursors {
    keys: Mutex<HashMap<String, ContentKey>>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl MemoryCursors {
    pub fn new() -> Self {
        Self::default()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CursorBackend for MemoryCursors {
    fn load_keys(&self) -> BoxFuture<'_, HashMap<String, ContentKey>> {
        let keys = locked(&self.keys).clone();
        Box::pin(async move { Ok(keys) })
    }

    fn load_sequences(&self) -> BoxFuture<'_, HashMap<String, u64>> {
        let sequences = locked(&self.sequences).clone();
        Box::pin(async move { Ok(sequences) })
    }

    fn load_key(&self, name: &str) -> BoxFuture<'_, Option<ContentKey>> {
        let key = locked(&self.keys).get(name).cloned();
        Box::pin(async move { Ok(key) })
    }

    fn load_sequence(&self, name: &str) -> BoxFuture<'_, Option<u64>> {
        let sequence = locked(&self.sequences).get(name).copied();
        Box::pin(async move { Ok(sequence) })
    }

    fn store_key(&self, name: &str, key: &ContentKey) -> BoxFuture<'_, ()> {
        {
            let mut keys = locked(&self.keys);
            if !matches!(keys.get(name), Some(current) if current >= key) {
                keys.insert(name.to_string(), key.clone());
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn store_sequence(&self, name: &str, sequence: u64) -> BoxFuture<'_, ()> {
        {
            let mut sequences = locked(&self.sequences);
            if !matches!(sequences.get(name), Some(&current) if current >= sequence) {
                sequences.insert(name.to_string(), sequence);
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, ()> {
        locked(&self.keys).remove(name);
        locked(&self.sequences).remove(name);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default)]
struct CursorCache {
    keys: HashMap<String, ContentKey>,
    sequences: HashMap<String, u64>,
    dirty_keys: HashSet<String>,
    dirty_sequences: HashSet<String>,
    /// Bumped by every delete of the name.
    generations: HashMap<String, u64>,
}

impl CursorCache {
    fn advance_key(&mut self, key: &ContentKey, name: &str) -> bool {
        if matches!(self.keys.get(name), Some(current) if current >= key) {
            return false;
        }
        self.keys.insert(name.to_string(), key.clone());
        self.dirty_keys.insert(name.to_string());
        debug!(name = %name, key = %key, "Cursor advanced (pending flush)");
        true
    }
}

/// Take the stored value for `name`, keeping local progress that is not
/// flushed yet if it is further ahead.
fn merge_stored<T: Ord>(
    values: &mut HashMap<String, T>,
    dirty: &HashSet<String>,
    name: &str,
    stored: Option<T>,
) {
    let local = values.remove(name);
    let merged = if dirty.contains(name) {
        local.max(stored)
    } else {
        stored
    };
    if let Some(value) = merged {
        values.insert(name.to_string(), value);
    }
}

/// Debounced, monotonic progress cursors over a [`CursorBackend`].
pub struct CursorStore {
    backend: Arc<dyn CursorBackend>,
    cache: RwLock<CursorCache>,
    /// Held across a flush's backend writes and across a delete.
    write_lock: tokio::sync::Mutex<()>,
}

impl CursorStore {
    /// Open the SQLite store at `config.sqlite_path`.
    pub async fn open(config: &CursorConfig) -> Result<Self> {
        Self::with_options(&config.sqlite_path, config.wal_mode).await
    }

    /// Open a file-backed store at `path` (WAL mode).
    pub async fn new(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::with_options(&path_str, true).await
    }

    /// Private in-memory store (tests, single-shot tools).
    pub async fn in_memory() -> Result<Self> {
        Self::with_options(MEMORY_PATH, false).await
    }

    async fn with_options(path: &str, wal_mode: bool) -> Result<Self> {
        let backend = SqliteCursors::open(path, wal_mode).await?;
        Self::with_backend(Arc::new(backend)).await
    }

    /// Wrap `backend`, loading every stored cursor into the cache.
    pub async fn with_backend(backend: Arc<dyn CursorBackend>) -> Result<Self> {
        let mut cache = CursorCache {
            keys: backend.load_keys().await?,
            sequences: backend.load_sequences().await?,
            ..Default::default()
        };

        let restored = cache.keys.len() + cache.sequences.len();
        if restored > 0 {
            info!(count = restored, "Restored cursors from previous run");
        }

        Ok(Self {
            backend,
            cache: RwLock::new(cache),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Stored key cursor for `name`.
    pub async fn get_key(&self, name: &str) -> Option<ContentKey> {
        self.cache.read().await.keys.get(name).cloned()
    }

    /// Stored key cursor for `name`, or `default` if there is none.
    pub async fn get(&self, name: &str, default: ContentKey) -> ContentKey {
        self.get_key(name).await.unwrap_or(default)
    }

    /// Advance the key cursor for `name` to `key` if it is ahead (debounced).
    ///
    /// Returns `true` if the cursor moved.
    pub async fn update_if_greater(&self, key: &ContentKey, name: &str) -> bool {
        self.cache.write().await.advance_key(key, name)
    }

    /// Current generation of `name`. Every [`delete`](Self::delete) bumps it.
    pub async fn generation(&self, name: &str) -> u64 {
        self.cache
            .read()
            .await
            .generations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// [`update_if_greater`](Self::update_if_greater), ignored if `name` was
    /// deleted after `generation` was read.
    pub async fn update_if_current(&self, key: &ContentKey, name: &str, generation: u64) -> bool {
        let mut cache = self.cache.write().await;
        if cache.generations.get(name).copied().unwrap_or(0) != generation {
            debug!(name = %name, key = %key, "Ignoring progress for a deleted cursor");
            return false;
        }
        cache.advance_key(key, name)
    }

    /// Stored sequence cursor for `name`.
    pub async fn get_sequence(&self, name: &str) -> Option<u64> {
        self.cache.read().await.sequences.get(name).copied()
    }

    /// Advance the sequence cursor for `name` if `sequence` is ahead (debounced).
    pub async fn update_sequence_if_greater(&self, name: &str, sequence: u64) -> bool {
        let mut cache = self.cache.write().await;
        if matches!(cache.sequences.get(name), Some(&current) if current >= sequence) {
            return false;
        }
        cache.sequences.insert(name.to_string(), sequence);
        cache.dirty_sequences.insert(name.to_string());
        debug!(name = %name, sequence, "Sequence cursor advanced (pending flush)");
        true
    }

    /// Re-read `name` from the backend, where another node may have moved it.
    ///
    /// Called when leadership is acquired, before the cursor is used.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let key = self.backend.load_key(name).await?;
        let sequence = self.backend.load_sequence(name).await?;

        let mut guard = self.cache.write().await;
        let cache = &mut *guard;
        merge_stored(&mut cache.keys, &cache.dirty_keys, name, key);
        merge_stored(&mut cache.sequences, &cache.dirty_sequences, name, sequence);
        debug!(
            name = %name,
            key = ?cache.keys.get(name),
            sequence = ?cache.sequences.get(name),
            "Reloaded cursor"
        );
        Ok(())
    }

    /// Flush all dirty cursors to the backend. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let _writing = self.write_lock.lock().await;

        let (keys, sequences): (Vec<(String, ContentKey)>, Vec<(String, u64)>) = {
            let mut cache = self.cache.write().await;
            let dirty_keys: Vec<String> = cache.dirty_keys.drain().collect();
            let dirty_seqs: Vec<String> = cache.dirty_sequences.drain().collect();
            (
                dirty_keys
                    .into_iter()
                    .filter_map(|n| cache.keys.get(&n).cloned().map(|k| (n, k)))
                    .collect(),
                dirty_seqs
                    .into_iter()
                    .filter_map(|n| cache.sequences.get(&n).map(|&s| (n, s)))
                    .collect(),
            )
        };

        if keys.is_empty() && sequences.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        let mut errors = 0;

        for (name, key) in &keys {
            match self.backend.store_key(name, key).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(name = %name, error = %e, "Failed to flush cursor");
                    self.cache.write().await.dirty_keys.insert(name.clone());
                }
            }
        }

        for (name, sequence) in &sequences {
            match self.backend.store_sequence(name, *sequence).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(name = %name, error = %e, "Failed to flush sequence cursor");
                    self.cache.write().await.dirty_sequences.insert(name.clone());
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
        }
        crate::metrics::record_cursor_flush(flushed, errors);

        if errors > 0 {
            return Err(HubError::Internal(format!("Failed to flush {} cursors", errors)));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        let cache = self.cache.read().await;
        !cache.dirty_keys.is_empty() || !cache.dirty_sequences.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        let cache = self.cache.read().await;
        cache.dirty_keys.len() + cache.dirty_sequences.len()
    }

    /// Delete every cursor stored under `name`.
    ///
    /// Waits for a flush in progress, so its writes cannot land afterwards.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _writing = self.write_lock.lock().await;
        {
            let mut cache = self.cache.write().await;
            cache.keys.remove(name);
            cache.sequences.remove(name);
            cache.dirty_keys.remove(name);
            cache.dirty_sequences.remove(name);
            *cache.generations.entry(name.to_string()).or_insert(0) += 1;
        }

        self.backend.delete(name).await?;
        info!(name = %name, "Deleted cursor");
        Ok(())
    }

    /// All key cursors (for status and debugging).
    pub async fn all_keys(&self) -> HashMap<String, ContentKey> {
        self.cache.read().await.keys.clone()
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.backend.checkpoint().await
    }

    /// Flush, checkpoint and close the backend.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty cursors on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint cursors on close");
        }
        if let Err(e) = self.backend.close().await {
            warn!(error = %e, "Failed to close cursor backend");
        }
        info!("Cursor store closed");
    }
}
