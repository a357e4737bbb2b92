//! Database connection management and transactional execution
//!
//! `Storage` owns the SQLite connection of the local mirror and is the sole
//! arbiter of transaction boundaries: every write made during a sync pass
//! goes through `run_in_transaction`, usually wrapped in `with_retry`.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use super::retry::RetryPolicy;
use crate::error::Result;
use crate::types::{RetryConfig, StorageConfig, StorageMode};

/// Storage engine wrapping the SQLite connection of the mirror
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl Storage {
    /// Open or create a database with the given configuration
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;

        run_migrations(&conn)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig::new(":memory:"))
    }

    /// Replace the retry policy applied by `with_retry`
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    /// Create a new connection with appropriate pragmas
    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        Self::configure_pragmas(&conn, config)?;

        Ok(conn)
    }

    /// Configure SQLite pragmas based on storage mode
    ///
    /// Local mode uses WAL so readers never block the sync writer; cloud-safe
    /// mode keeps a single file for folders synced by Dropbox and friends.
    fn configure_pragmas(conn: &Connection, config: &StorageConfig) -> Result<()> {
        match config.storage_mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA wal_autocheckpoint=1000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        Ok(())
    }

    /// Get a reference to the connection (for single-threaded use)
    pub fn connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute a function with the connection, outside any transaction
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute `work` inside a transaction.
    ///
    /// Commits when `work` succeeds; otherwise rolls back and returns the
    /// error `work` produced.
    pub fn run_in_transaction<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        match work(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, "Rollback failed");
                }
                tracing::debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
        }
    }

    /// Retry `operation` on transient contention, up to `max_attempts` calls
    pub async fn with_retry<F, T>(&self, max_attempts: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.retry
            .retry(max_attempts, || std::future::ready(operation()))
            .await
    }

    /// `with_retry(run_in_transaction(work))` with the configured attempt bound
    pub async fn transact_with_retry<F, T>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        let max_attempts = self.retry.config().max_attempts;
        self.with_retry(max_attempts, || self.run_in_transaction(&mut work))
            .await
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Get current storage mode
    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    /// Get database path
    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Checkpoint WAL file (for local mode)
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.storage_mode == StorageMode::Local {
            let conn = self.conn.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }

    /// Get configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            retry: self.retry.clone(),
        }
    }
}
