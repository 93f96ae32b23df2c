//! Store backend: owns the SQLite connections, applies durability settings,
//! and provides the transactional unit-of-work every write path goes through.

use pagevault_core::{Error, Result, StoreConfig};
use rusqlite::Connection;
use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_BACKEND_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Transactions active on this thread, innermost last. A nested
    /// `with_transaction` on the same backend reuses the outer connection
    /// instead of opening a sub-transaction.
    static TX_STACK: RefCell<Vec<(usize, Rc<Connection>)>> = const { RefCell::new(Vec::new()) };
}

struct BackendInner {
    conns: Mutex<Vec<Connection>>,
    available: Condvar,
    lock_wait: Duration,
    checkouts: AtomicU64,
}

/// Bounded pool of SQLite connections over one database file.
#[derive(Clone)]
pub struct StoreBackend {
    id: usize,
    inner: Arc<BackendInner>,
}

impl StoreBackend {
    /// Open the database, apply the configured durability mode and lock-wait
    /// timeout, and bootstrap the schema.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if config.path.trim().is_empty() {
            return Err(Error::Config("store path must not be empty".to_string()));
        }
        if config.max_connections == 0 {
            return Err(Error::Config(
                "store maxConnections must be at least 1".to_string(),
            ));
        }

        let db_path = Path::new(&config.path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Connection(format!("Failed to create db directory: {}", e))
            })?;
        }

        let mut conns = Vec::with_capacity(config.max_connections);
        for _ in 0..config.max_connections {
            conns.push(open_connection(db_path, config)?);
        }

        if let Some(conn) = conns.first() {
            init_schema(conn)?;
        }

        debug!(
            path = %config.path,
            connections = config.max_connections,
            durable = config.durable_writes,
            "Store backend opened"
        );

        Ok(Self {
            id: NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(BackendInner {
                conns: Mutex::new(conns),
                available: Condvar::new(),
                lock_wait: config.lock_wait(),
                checkouts: AtomicU64::new(0),
            }),
        })
    }

    /// Number of connection checkouts performed so far. Cache tests use this
    /// to prove a hit never touched the database.
    pub fn checkout_count(&self) -> u64 {
        self.inner.checkouts.load(Ordering::Relaxed)
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`
    /// and on panic. Nested calls on the same thread join the outer
    /// transaction; commit happens only at the outermost frame.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let outer = TX_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|(id, _)| *id == self.id)
                .map(|(_, conn)| conn.clone())
        });
        if let Some(conn) = outer {
            return f(&conn);
        }

        let conn = Rc::new(self.checkout()?);
        if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE;") {
            self.checkin_rc(conn);
            return Err(Error::Storage(format!("Failed to begin transaction: {}", e)));
        }

        TX_STACK.with(|stack| stack.borrow_mut().push((self.id, conn.clone())));
        let outcome = catch_unwind(AssertUnwindSafe(|| f(&conn)));
        TX_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });

        let result = match outcome {
            Ok(Ok(value)) => match conn.execute_batch("COMMIT;") {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback(&conn);
                    Err(Error::Storage(format!("Failed to commit transaction: {}", e)))
                }
            },
            Ok(Err(e)) => {
                rollback(&conn);
                Err(e)
            }
            Err(panic) => {
                rollback(&conn);
                self.checkin_rc(conn);
                resume_unwind(panic);
            }
        };

        self.checkin_rc(conn);
        result
    }

    fn checkout(&self) -> Result<Connection> {
        let deadline = Instant::now() + self.inner.lock_wait;
        let mut pool = self
            .inner
            .conns
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))?;
        loop {
            if let Some(conn) = pool.pop() {
                self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::StorePoolExhausted(format!(
                    "no database connection freed within {:?}",
                    self.inner.lock_wait
                )));
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(pool, deadline - now)
                .map_err(|e| Error::Storage(format!("Lock error: {}", e)))?;
            pool = guard;
        }
    }

    fn checkin_rc(&self, conn: Rc<Connection>) {
        match Rc::try_unwrap(conn) {
            Ok(conn) => self.checkin(conn),
            // The Rc is only ever cloned into the thread-local stack, which
            // is popped before we get here.
            Err(_) => warn!("Transaction connection still referenced; dropping it"),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut pool) = self.inner.conns.lock() {
            pool.push(conn);
            self.inner.available.notify_one();
        }
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK;") {
        warn!(error = %e, "Rollback failed");
    }
}

fn open_connection(db_path: &Path, config: &StoreConfig) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Connection(format!("Failed to open store db: {}", e)))?;

    if let Some(key) = &config.encryption_key {
        // Only takes effect when the linked SQLite is a cipher build.
        let escaped = key.replace('\'', "''");
        let _ = conn.execute_batch(&format!("PRAGMA key = '{}';", escaped));
    }

    let journal_mode = if config.durable_writes { "WAL" } else { "DELETE" };
    conn.execute_batch(&format!("PRAGMA journal_mode={};", journal_mode))
        .map_err(|e| Error::Storage(format!("Failed to set journal mode: {}", e)))?;
    conn.busy_timeout(config.lock_wait())
        .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| Error::Storage(format!("Failed to enable foreign keys: {}", e)))?;

    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            hash TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            format TEXT NOT NULL,
            byte_size INTEGER NOT NULL DEFAULT 0,
            width INTEGER,
            height INTEGER,
            full_page INTEGER NOT NULL DEFAULT 0,
            quality INTEGER,
            tags TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            accessed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_artifacts_tenant ON artifacts(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_instance ON artifacts(instance_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_format ON artifacts(format);
        CREATE INDEX IF NOT EXISTS idx_artifacts_created ON artifacts(created_at);
        CREATE INDEX IF NOT EXISTS idx_artifacts_updated ON artifacts(updated_at);
        CREATE INDEX IF NOT EXISTS idx_artifacts_dedup ON artifacts(tenant_id, session_id, hash);

        CREATE TABLE IF NOT EXISTS audit_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            instance_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            tool_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            input_summary TEXT NOT NULL DEFAULT '',
            result_summary TEXT NOT NULL DEFAULT '',
            error TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_cursors (
            table_name TEXT PRIMARY KEY,
            last_pulled TEXT NOT NULL DEFAULT '',
            last_pushed TEXT NOT NULL DEFAULT ''
        );
        ",
    )
    .map_err(|e| Error::Storage(format!("Failed to init store schema: {}", e)))?;

    debug!("Store schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagevault_core::StoreConfig;
    use tempfile::TempDir;

    fn test_backend(max_connections: usize, lock_wait_ms: u64) -> (StoreBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: dir.path().join("store.db").display().to_string(),
            max_connections,
            lock_wait_ms,
            ..Default::default()
        };
        let backend = StoreBackend::open(&config).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_open_rejects_empty_path() {
        let config = StoreConfig {
            path: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StoreBackend::open(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_commit_and_rollback() {
        let (backend, _dir) = test_backend(2, 1000);

        backend
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (table_name) VALUES ('t1')",
                    [],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(())
            })
            .unwrap();

        let failed: Result<()> = backend.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (table_name) VALUES ('t2')",
                [],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            Err(Error::Storage("forced".to_string()))
        });
        assert!(failed.is_err());

        let count: i64 = backend
            .with_transaction(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_nested_transaction_reuses_outer() {
        let (backend, _dir) = test_backend(1, 200);

        // With a single connection, a true sub-transaction would deadlock on
        // checkout; joining the outer transaction must make this pass.
        backend
            .with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (table_name) VALUES ('outer')",
                    [],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                backend.with_transaction(|inner| {
                    inner
                        .execute(
                            "INSERT INTO sync_cursors (table_name) VALUES ('inner')",
                            [],
                        )
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    Ok(())
                })
            })
            .unwrap();

        let count: i64 = backend
            .with_transaction(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_rollback_on_panic() {
        let (backend, _dir) = test_backend(1, 200);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = backend.with_transaction(|conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (table_name) VALUES ('boom')",
                    [],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                panic!("mid-transaction panic");
            });
        }));
        assert!(result.is_err());

        // Connection was returned to the pool and the row rolled back.
        let count: i64 = backend
            .with_transaction(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_checkout_exhaustion_times_out() {
        let (backend, _dir) = test_backend(1, 100);

        let held = backend.checkout().unwrap();
        let start = Instant::now();
        let err = backend.checkout().unwrap_err();
        assert!(matches!(err, Error::StorePoolExhausted(_)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        backend.checkin(held);

        // Freed connection is usable again.
        backend.checkout().unwrap();
    }
}
