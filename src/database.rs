//! # Local Store Access
//!
//! Scoped, single-connection access to the local SQLite file. SQLite admits one writer at a
//! time and answers everyone else with "database is locked"; the [`Cursor`] turns that
//! rejection into a bounded wait-and-retry (see [`RetryPolicy`]) instead of an error.
//!
//! - Writers inside one process are serialised by a writer lock shared by every cursor of the
//!   same [`LocalStore`]. The lock is held for one write attempt only, never across a retry
//!   sleep.
//! - Writers in other processes are serialised by SQLite itself and show up as contention.
//! - Constraint violations and malformed values are rejected immediately
//!   ([`CoreError::StoreRejected`]); I/O and corruption are fatal ([`CoreError::StoreFatal`]).
//!   Neither is retried.

use crate::errors::CoreError;
use crate::metrics;
use crate::settings;
use futures::future::BoxFuture;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{Connection, Sqlite};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// How long to wait between attempts and how many attempts to make before giving up with
/// [`CoreError::StoreContention`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_settings(store: &settings::Store) -> Self {
        Self::new(store.lock_retry_delay(), store.lock_retry_max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&settings::Store::default())
    }
}

/// A value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Primary SQLite result code of a database error, if any.
fn primary_code(err: &sqlx::Error) -> Option<i64> {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .map(|c| c & 0xff),
        _ => None,
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, i.e. "somebody else holds the lock".
pub(crate) fn is_locked(err: &sqlx::Error) -> bool {
    if matches!(primary_code(err), Some(5) | Some(6)) {
        return true;
    }
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

/// Maps a non-contention failure into the core taxonomy.
pub(crate) fn classify(operation: &str, err: sqlx::Error) -> CoreError {
    let rejected_reason = match &err {
        sqlx::Error::Database(db) => {
            // SQLITE_ERROR, TOOBIG, CONSTRAINT, MISMATCH, RANGE
            let by_code = matches!(
                primary_code(&err),
                Some(1) | Some(18) | Some(19) | Some(20) | Some(25)
            );
            if by_code
                || db.is_unique_violation()
                || db.is_foreign_key_violation()
                || db.is_check_violation()
            {
                Some(db.message().to_string())
            } else {
                None
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => Some(err.to_string()),
        _ => None,
    };

    match rejected_reason {
        Some(reason) => CoreError::StoreRejected {
            operation: operation.to_string(),
            reason,
        },
        None => CoreError::StoreFatal {
            operation: operation.to_string(),
            source: err,
        },
    }
}

/// Runs `action` until it succeeds, fails with something other than lock contention, or the
/// policy's attempt budget is spent.
pub(crate) async fn retry_locked<T, A, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut action: A,
) -> Result<T, CoreError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let started = Instant::now();
    let attempts = AtomicU32::new(0);
    let strategy = FixedInterval::new(policy.delay).take(policy.max_attempts.saturating_sub(1) as usize);

    let result = RetryIf::spawn(
        strategy,
        || {
            attempts.fetch_add(1, Ordering::Relaxed);
            action()
        },
        |err: &sqlx::Error| {
            if !is_locked(err) {
                return false;
            }
            metrics::increment_store_lock_retry(operation);
            let waited = started.elapsed();
            if waited > Duration::from_secs(1) {
                warn!(operation, ?waited, "store still locked: {}", err);
            } else {
                debug!(operation, ?waited, "store locked: {}", err);
            }
            true
        },
    )
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(err) if is_locked(&err) => {
            metrics::increment_store_contention(operation);
            Err(CoreError::StoreContention {
                operation: operation.to_string(),
                attempts: attempts.load(Ordering::Relaxed),
            })
        }
        Err(err) => Err(classify(operation, err)),
    }
}

fn validate_identifier(name: &str) -> Result<(), CoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::StoreRejected {
            operation: "insert".to_string(),
            reason: format!("invalid identifier {:?}", name),
        })
    }
}

/// Handle to the local store file. Cheap to clone; clones share the writer lock.
#[derive(Clone)]
pub struct LocalStore {
    path: PathBuf,
    wal: bool,
    policy: RetryPolicy,
    schema: Arc<Vec<String>>,
    schema_ready: Arc<AtomicBool>,
    writer: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            wal: true,
            policy,
            schema: Arc::new(Vec::new()),
            schema_ready: Arc::new(AtomicBool::new(false)),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_settings(store: &settings::Store) -> Self {
        Self::new(store.resolved_path(), RetryPolicy::from_settings(store)).with_wal(store.wal)
    }

    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    /// Statements run once per store handle on first connect. They must be idempotent
    /// (`CREATE ... IF NOT EXISTS`).
    pub fn with_schema<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::make_mut(&mut self.schema).extend(statements.into_iter().map(Into::into));
        self.schema_ready = Arc::new(AtomicBool::new(false));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let journal = if self.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        // busy_timeout 0: contention must surface to retry_locked instead of blocking
        // inside the driver.
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO)
            .journal_mode(journal)
    }

    /// Opens a live cursor, creating the parent directory, the file and the schema if they
    /// are missing. The connection is closed when the cursor is closed or dropped.
    pub async fn connect(&self) -> Result<Cursor, CoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::StoreFatal {
                        operation: "create store directory".to_string(),
                        source: sqlx::Error::Io(e),
                    })?;
            }
        }

        let options = self.connect_options();
        let options = &options;
        let conn = retry_locked(&self.policy, "connect", move || {
            SqliteConnection::connect_with(options)
        })
        .await?;

        let cursor = Cursor {
            conn: Mutex::new(conn),
            policy: self.policy,
            writer: Arc::clone(&self.writer),
        };

        if !self.schema_ready.load(Ordering::Acquire) {
            for statement in self.schema.iter() {
                cursor.execute(statement, &[]).await?;
            }
            self.schema_ready.store(true, Ordering::Release);
            debug!(path = %self.path.display(), statements = self.schema.len(), "store schema ready");
        }

        Ok(cursor)
    }

    /// Runs `f` with a live cursor and closes the connection afterwards, whatever `f`
    /// returned. If the future is dropped mid-way the connection is closed on drop.
    pub async fn with_cursor<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: for<'c> FnOnce(&'c Cursor) -> BoxFuture<'c, Result<T, CoreError>>,
    {
        let cursor = self.connect().await?;
        let result = f(&cursor).await;
        cursor.close().await;
        result
    }
}

/// A live connection to the local store.
///
/// Every operation is subject to the store's [`RetryPolicy`]. The cursor may be shared by
/// concurrent tasks; operations on one cursor are serialised.
pub struct Cursor {
    conn: Mutex<SqliteConnection>,
    policy: RetryPolicy,
    writer: Arc<Mutex<()>>,
}

impl Cursor {
    /// Appends one row to `table`.
    pub async fn insert(&self, table: &str, values: &[(&str, SqlValue)]) -> Result<(), CoreError> {
        validate_identifier(table)?;
        if values.is_empty() {
            return Err(CoreError::StoreRejected {
                operation: format!("insert {}", table),
                reason: "no values".to_string(),
            });
        }
        for (column, _) in values {
            validate_identifier(column)?;
        }

        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );
        let args: Vec<SqlValue> = values.iter().map(|(_, v)| v.clone()).collect();

        self.write(&format!("insert {}", table), &sql, &args)
            .await
            .map(|_| ())
    }

    /// Runs a write statement (DDL, UPDATE, DELETE) and returns the affected row count.
    pub async fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, CoreError> {
        self.write("execute", sql, args).await
    }

    async fn write(&self, operation: &str, sql: &str, args: &[SqlValue]) -> Result<u64, CoreError> {
        let conn = &self.conn;
        let writer = &self.writer;
        let done = retry_locked(&self.policy, operation, move || async move {
            let _write_guard = writer.lock().await;
            let mut conn = conn.lock().await;
            bind_values(sqlx::query(sql), args).execute(&mut *conn).await
        })
        .await?;
        Ok(done.rows_affected())
    }

    /// Returns at most one row matching `query`, `None` when nothing matches.
    pub async fn fetchone(
        &self,
        query: &str,
        args: &[SqlValue],
    ) -> Result<Option<SqliteRow>, CoreError> {
        let conn = &self.conn;
        retry_locked(&self.policy, "fetchone", move || async move {
            let mut conn = conn.lock().await;
            bind_values(sqlx::query(query), args)
                .fetch_optional(&mut *conn)
                .await
        })
        .await
    }

    /// Returns every row matching `query`.
    pub async fn fetchall(&self, query: &str, args: &[SqlValue]) -> Result<Vec<SqliteRow>, CoreError> {
        let conn = &self.conn;
        retry_locked(&self.policy, "fetchall", move || async move {
            let mut conn = conn.lock().await;
            bind_values(sqlx::query(query), args).fetch_all(&mut *conn).await
        })
        .await
    }

    /// Closes the connection, logging rather than failing if the close itself errors.
    pub async fn close(self) {
        let conn = self.conn.into_inner();
        if let Err(e) = conn.close().await {
            debug!("error closing store connection: {}", e);
        }
    }
}
