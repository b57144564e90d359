//! The transactional entity store.
//!
//! One SQLite handle shared behind a mutex; writes serialize through
//! the engine's transaction mechanism. The store refuses to serve if
//! the engine cannot enforce foreign keys, since every cascade
//! invariant depends on them.

pub mod schema;
pub mod version;

use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use trellis_api::{Error, Result};

use crate::config::StoreConfig;
use crate::time;
use version::VersionAlgorithm;

const FOREIGN_KEY_PROBE_ATTEMPTS: usize = 10;

/// Store-wide settings snapshot, shared with services through the
/// transaction context.
#[derive(Debug, Clone)]
pub(crate) struct StoreOptions {
    pub version_algorithm: VersionAlgorithm,
    pub soft_delete: bool,
    pub page_size: i64,
    pub localtime_timestamps: bool,
    pub slow_query_threshold: std::time::Duration,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    opts: StoreOptions,
}

impl Store {
    /// Opens (or creates) the store: enables and probes foreign keys,
    /// applies the configured pragmas, runs migrations.
    pub fn open(config: &StoreConfig) -> Result<Store> {
        let conn = if config.url == ":memory:" {
            Connection::open_in_memory().map_err(map_sqlite_err)?
        } else {
            Connection::open(&config.url).map_err(map_sqlite_err)?
        };

        configure(&conn, config)?;
        schema::migrate(&conn, config.always_migrate)?;

        Ok(Store {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                opts: StoreOptions {
                    version_algorithm: config.version_algorithm,
                    soft_delete: config.soft_delete,
                    page_size: config.page_size,
                    localtime_timestamps: config.localtime_timestamps,
                    slow_query_threshold: config.slow_query_threshold(),
                },
            }),
        })
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.inner.opts
    }

    pub fn soft_delete_enabled(&self) -> bool {
        self.inner.opts.soft_delete
    }

    /// Runs a read against the shared connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let conn = self.lock_conn();
        let result = f(&conn);
        self.warn_slow(started);
        result
    }

    /// Runs `f` inside one transaction. The transaction commits when
    /// `f` returns `Ok` and rolls back otherwise; nothing partial is
    /// ever visible.
    pub fn with_tx<T>(&self, f: impl FnOnce(&mut TxContext<'_>) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(map_sqlite_err)?;

        let mut ctx = TxContext {
            tx: &tx,
            opts: &self.inner.opts,
            tx_uuid: None,
            tx_len: 0,
            tx_index: 0,
            hard_delete: false,
        };

        match f(&mut ctx) {
            Ok(value) => {
                tx.commit().map_err(map_sqlite_err)?;
                self.warn_slow(started);
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back
                self.warn_slow(started);
                Err(e)
            }
        }
    }

    /// Engine-reported anomalies; empty on a healthy store.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("PRAGMA integrity_check")
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(map_sqlite_err)?;
            let mut anomalies = Vec::new();
            for row in rows {
                let line = row.map_err(map_sqlite_err)?;
                if line != "ok" {
                    anomalies.push(line);
                }
            }
            Ok(anomalies)
        })
    }

    pub fn foreign_keys_enabled(&self) -> Result<bool> {
        self.with_conn(|conn| check_foreign_keys(conn))
    }

    /// Database size in bytes.
    pub fn size(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .map_err(map_sqlite_err)
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn warn_slow(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.inner.opts.slow_query_threshold {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow store operation");
        }
    }
}

/// Per-transaction state: the live transaction handle plus the
/// grouping fields journalled with every event of a logical batch.
pub struct TxContext<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    pub(crate) opts: &'a StoreOptions,
    tx_uuid: Option<String>,
    tx_len: i64,
    tx_index: i64,
    hard_delete: bool,
}

impl<'a> TxContext<'a> {
    pub fn conn(&self) -> &Connection {
        self.tx
    }

    /// Marks the transaction as a batch: allocates the shared tx uuid
    /// (if not already allocated) and grows the expected row count.
    pub fn begin_batch(&mut self, tx_len: i64) {
        if self.tx_uuid.is_none() {
            self.tx_uuid = Some(Uuid::new_v4().to_string());
        }
        self.tx_len += tx_len;
    }

    pub fn grow_batch(&mut self, extra: i64) {
        self.tx_len += extra;
    }

    /// Adopts an externally allocated batch identity, as inbound sync
    /// does for a whole message.
    pub fn set_batch(&mut self, tx_uuid: String, tx_len: i64) {
        self.tx_uuid = Some(tx_uuid);
        self.tx_len = tx_len;
    }

    pub fn tx_uuid(&self) -> Option<&str> {
        self.tx_uuid.as_deref()
    }

    pub fn tx_len(&self) -> i64 {
        self.tx_len
    }

    pub fn tx_index(&self) -> i64 {
        self.tx_index
    }

    pub fn inc_tx_index(&mut self) {
        self.tx_index += 1;
    }

    /// Makes every delete in this transaction a hard delete even when
    /// soft delete is enabled store-wide. Inbound sync deletes use
    /// this.
    pub fn force_hard_delete(&mut self) {
        self.hard_delete = true;
    }

    /// Whether deletes physically remove rows in this transaction.
    pub fn hard_delete(&self) -> bool {
        self.hard_delete || !self.opts.soft_delete
    }

    /// Row timestamp source, honoring the localtime setting.
    pub fn now_ms(&self) -> i64 {
        if self.opts.localtime_timestamps {
            time::timestamp_local_ms()
        } else {
            time::timestamp_ms()
        }
    }
}

fn check_foreign_keys(conn: &Connection) -> Result<bool> {
    conn.query_row("PRAGMA foreign_keys", [], |row| row.get::<_, bool>(0))
        .map_err(map_sqlite_err)
}

fn configure(conn: &Connection, config: &StoreConfig) -> Result<()> {
    // Foreign keys first: nothing else matters if cascades don't work
    let mut enabled = false;
    for _ in 0..FOREIGN_KEY_PROBE_ATTEMPTS {
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(map_sqlite_err)?;
        if check_foreign_keys(conn)? {
            enabled = true;
            break;
        }
    }
    if !enabled {
        return Err(Error::ForeignKeysDisabled);
    }

    if config.wal_enabled {
        conn.query_row("PRAGMA journal_mode = 'WAL'", [], |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| Error::Store(format!("failed to set WAL mode: {e}")))?;
    }

    if config.mem_temp_store {
        conn.execute_batch("PRAGMA temp_store = 2")
            .map_err(map_sqlite_err)?;
    }

    if config.cache_size_bytes > 0 {
        // Negative cache_size means kibibytes
        let kib = -((config.cache_size_bytes / 1024) as i64);
        conn.execute_batch(&format!("PRAGMA cache_size = {kib}"))
            .map_err(map_sqlite_err)?;
    }

    if config.synchronous_full || config.wal_enabled {
        let mode = if config.synchronous_full { 2 } else { 1 };
        conn.execute_batch(&format!("PRAGMA synchronous = {mode}"))
            .map_err(map_sqlite_err)?;
    }

    if config.busy_timeout_ms > 0 {
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(map_sqlite_err)?;
    }

    tracing::debug!(
        url = %config.url,
        wal = config.wal_enabled,
        soft_delete = config.soft_delete,
        version_algorithm = %config.version_algorithm,
        "store opened"
    );

    Ok(())
}

/// Maps engine errors into the shared taxonomy. Uniqueness violations
/// are detected through the engine's message text and surfaced as
/// bad-request material rather than opaque store failures.
pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let text = message.unwrap_or_else(|| failure.to_string());
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                if text.contains("UNIQUE") {
                    Error::Uniqueness(text)
                } else if text.contains("FOREIGN KEY") {
                    Error::InvalidData(format!("foreign key constraint failed: {text}"))
                } else {
                    Error::InvalidData(text)
                }
            } else {
                Error::Store(text)
            }
        }
        other => Error::Store(other.to_string()),
    }
}

/// Resolves pagination inputs to `(limit, offset)`.
///
/// `0` selects the first page / the configured default size; negative
/// values are rejected.
pub(crate) fn page_bounds(page: i64, page_size: i64, default_size: i64) -> Result<(i64, i64)> {
    if page < 0 || page_size < 0 {
        return Err(Error::InvalidPagination { page, page_size });
    }
    let page = if page == 0 { 1 } else { page };
    let size = if page_size == 0 { default_size } else { page_size };
    Ok((size, (page - 1) * size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Store {
        let config = StoreConfig {
            url: ":memory:".into(),
            ..Default::default()
        };
        Store::open(&config).unwrap()
    }

    #[test]
    fn test_open_probes_foreign_keys() {
        let store = memory_store();
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_integrity_check_healthy() {
        let store = memory_store();
        assert!(store.integrity_check().unwrap().is_empty());
    }

    #[test]
    fn test_size_reports_pages() {
        let store = memory_store();
        assert!(store.size().unwrap() > 0);
    }

    #[test]
    fn test_open_on_disk_with_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            url: dir.path().join("trellis.db").to_string_lossy().into_owned(),
            wal_enabled: true,
            mem_temp_store: true,
            cache_size_bytes: 1 << 20,
            busy_timeout_ms: 1_000,
            ..Default::default()
        };

        let store = Store::open(&config).unwrap();
        assert!(store.foreign_keys_enabled().unwrap());
        drop(store);

        // Reopening over the same file is fine; migrations are
        // idempotent
        let store = Store::open(&config).unwrap();
        assert!(store.integrity_check().unwrap().is_empty());
    }

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(0, 0, 20).unwrap(), (20, 0));
        assert_eq!(page_bounds(1, 10, 20).unwrap(), (10, 0));
        assert_eq!(page_bounds(3, 10, 20).unwrap(), (10, 20));
        assert!(matches!(
            page_bounds(-1, 10, 20),
            Err(Error::InvalidPagination { .. })
        ));
        assert!(matches!(
            page_bounds(1, -10, 20),
            Err(Error::InvalidPagination { .. })
        ));
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let store = memory_store();
        let result: Result<()> = store.with_tx(|ctx| {
            ctx.conn()
                .execute(
                    "INSERT INTO items (id, name, type, created_at, modified_at,
                     created_by, modified_by, version)
                     VALUES ('I1', 'n', 't', 0, 0, 'TEST', 'TEST', 'v')",
                    [],
                )
                .map_err(map_sqlite_err)?;
            Err(Error::InvalidData("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
                    .map_err(map_sqlite_err)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_batch_context() {
        let store = memory_store();
        store
            .with_tx(|ctx| {
                assert_eq!(ctx.tx_uuid(), None);
                ctx.begin_batch(3);
                assert!(ctx.tx_uuid().is_some());
                assert_eq!(ctx.tx_len(), 3);
                let uuid = ctx.tx_uuid().unwrap().to_string();
                ctx.begin_batch(2);
                // Batch uuid is allocated once
                assert_eq!(ctx.tx_uuid().unwrap(), uuid);
                assert_eq!(ctx.tx_len(), 5);
                ctx.inc_tx_index();
                assert_eq!(ctx.tx_index(), 1);
                Ok(())
            })
            .unwrap();
    }
}
