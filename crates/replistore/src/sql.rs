//! Minimal SQL connection surface shared by drivers, the generic layer, and
//! the migration runner.
//!
//! Only the operations the bootstrap needs are modelled: a scalar query, and
//! a transaction that executes parameterised statements and commits. A
//! transaction that is dropped without [`SqlTransaction::commit`] rolls back.

use std::fmt;
use std::panic::AssertUnwindSafe;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, ffi, params_from_iter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;

/// SQLite virtual-machine steps between cancellation checks.
const PROGRESS_INTERVAL: i32 = 1_000;

/// Coarse classification of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlErrorCode {
    /// The store is busy arbitrating another writer; safe to retry.
    Busy,
    /// A uniqueness or primary key constraint was violated.
    Unique,
    /// Any other constraint violation.
    Constraint,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Anything not classified above.
    Other,
}

impl fmt::Display for SqlErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Busy => "busy",
            Self::Unique => "unique",
            Self::Constraint => "constraint",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        formatter.write_str(label)
    }
}

/// Failure reported by a SQL connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SqlError {
    code: SqlErrorCode,
    message: String,
}

impl SqlError {
    /// Builds an error with an explicit classification.
    #[must_use]
    pub fn new(code: SqlErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error returned when the cancellation token fires before or during work.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(SqlErrorCode::Cancelled, "operation cancelled")
    }

    /// Structured classification supplied by the driver.
    #[must_use]
    pub fn code(&self) -> SqlErrorCode {
        self.code
    }

    /// Driver-supplied description.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Returns `true` when the failure was caused by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == SqlErrorCode::Cancelled
    }
}

impl From<rusqlite::Error> for SqlError {
    fn from(error: rusqlite::Error) -> Self {
        let code = match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy => SqlErrorCode::Busy,
                ErrorCode::OperationInterrupted => SqlErrorCode::Cancelled,
                ErrorCode::ConstraintViolation
                    if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    SqlErrorCode::Unique
                }
                ErrorCode::ConstraintViolation => SqlErrorCode::Constraint,
                _ => SqlErrorCode::Other,
            },
            _ => SqlErrorCode::Other,
        };
        Self::new(code, error.to_string())
    }
}

/// Value bound to a statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl From<Option<Vec<u8>>> for SqlValue {
    fn from(value: Option<Vec<u8>>) -> Self {
        value.map_or(Self::Null, Self::Blob)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Self::Null => ValueRef::Null,
            Self::Integer(value) => ValueRef::Integer(*value),
            Self::Text(value) => ValueRef::Text(value.as_bytes()),
            Self::Blob(value) => ValueRef::Blob(value.as_slice()),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

/// Raw connection handed out by a [`Driver`].
pub trait SqlConnection: Send {
    /// Runs a query returning a single integer, such as `COUNT(*)`.
    fn query_scalar(&mut self, ctx: &CancellationToken, sql: &str) -> Result<i64, SqlError>;

    /// Opens a transaction bound to `ctx`.
    fn begin<'c>(
        &'c mut self,
        ctx: &CancellationToken,
    ) -> Result<Box<dyn SqlTransaction + 'c>, SqlError>;
}

/// Open transaction. Dropping it without committing rolls back.
pub trait SqlTransaction {
    /// Executes a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, SqlError>;

    /// Commits every statement executed so far.
    fn commit(self: Box<Self>) -> Result<(), SqlError>;
}

/// Makes SQLite abort in-flight statements once `ctx` is cancelled.
///
/// Replaces any handler installed earlier on the same connection.
pub(crate) fn interrupt_on_cancel(connection: &Connection, ctx: &CancellationToken) {
    let token = AssertUnwindSafe(ctx.clone());
    connection.progress_handler(PROGRESS_INTERVAL, Some(move || token.is_cancelled()));
}

/// [`SqlConnection`] backed by a local SQLite database.
#[derive(Debug)]
pub struct SqliteConnection {
    inner: Connection,
}

impl SqliteConnection {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &str) -> Result<Self, SqlError> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, SqlError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wraps an existing connection.
    #[must_use]
    pub fn from_connection(inner: Connection) -> Self {
        Self { inner }
    }

    /// Borrows the underlying connection, e.g. to create schema.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner
    }
}

impl SqlConnection for SqliteConnection {
    fn query_scalar(&mut self, ctx: &CancellationToken, sql: &str) -> Result<i64, SqlError> {
        if ctx.is_cancelled() {
            return Err(SqlError::cancelled());
        }
        interrupt_on_cancel(&self.inner, ctx);
        Ok(self.inner.query_row(sql, [], |row| row.get::<_, i64>(0))?)
    }

    fn begin<'c>(
        &'c mut self,
        ctx: &CancellationToken,
    ) -> Result<Box<dyn SqlTransaction + 'c>, SqlError> {
        if ctx.is_cancelled() {
            return Err(SqlError::cancelled());
        }
        interrupt_on_cancel(&self.inner, ctx);
        let transaction = self.inner.transaction()?;
        Ok(Box::new(SqliteTransaction {
            inner: transaction,
            ctx: ctx.clone(),
        }))
    }
}

struct SqliteTransaction<'c> {
    inner: rusqlite::Transaction<'c>,
    ctx: CancellationToken,
}

impl SqlTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize, SqlError> {
        if self.ctx.is_cancelled() {
            return Err(SqlError::cancelled());
        }
        Ok(self.inner.execute(sql, params_from_iter(params.iter()))?)
    }

    fn commit(self: Box<Self>) -> Result<(), SqlError> {
        if self.ctx.is_cancelled() {
            return Err(SqlError::cancelled());
        }
        Ok(self.inner.commit()?)
    }
}

/// Driver that treats the data source name as a local SQLite path.
///
/// Useful as a pre-registered driver for single-node deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn connect(
        &self,
        ctx: &CancellationToken,
        dsn: &str,
    ) -> Result<Box<dyn SqlConnection>, SqlError> {
        if ctx.is_cancelled() {
            return Err(SqlError::cancelled());
        }
        Ok(Box::new(SqliteConnection::open(dsn)?))
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn connection() -> SqliteConnection {
        let connection = SqliteConnection::open_in_memory().expect("open");
        connection
            .connection()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT UNIQUE)")
            .expect("schema");
        connection
    }

    fn count(connection: &mut SqliteConnection) -> i64 {
        connection
            .query_scalar(&CancellationToken::new(), "SELECT COUNT(*) FROM t")
            .expect("count")
    }

    #[rstest]
    fn dropped_transaction_rolls_back(mut connection: SqliteConnection) {
        let ctx = CancellationToken::new();
        {
            let mut tx = connection.begin(&ctx).expect("begin");
            tx.execute(
                "INSERT INTO t (id, name) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::Text("a".into())],
            )
            .expect("insert");
        }
        assert_eq!(count(&mut connection), 0);
    }

    #[rstest]
    fn committed_transaction_persists(mut connection: SqliteConnection) {
        let ctx = CancellationToken::new();
        let mut tx = connection.begin(&ctx).expect("begin");
        tx.execute(
            "INSERT INTO t (id, name) VALUES (?, ?)",
            &[SqlValue::Integer(1), SqlValue::Null],
        )
        .expect("insert");
        tx.commit().expect("commit");
        assert_eq!(count(&mut connection), 1);
    }

    #[rstest]
    fn unique_violation_is_classified(mut connection: SqliteConnection) {
        let ctx = CancellationToken::new();
        let mut tx = connection.begin(&ctx).expect("begin");
        let row = [SqlValue::Integer(1), SqlValue::Text("a".into())];
        tx.execute("INSERT INTO t (id, name) VALUES (?, ?)", &row)
            .expect("first insert");
        let error = tx
            .execute("INSERT INTO t (id, name) VALUES (?, ?)", &row)
            .expect_err("duplicate");
        assert_eq!(error.code(), SqlErrorCode::Unique);
        assert!(error.message().contains("UNIQUE constraint"), "{error}");
    }

    #[rstest]
    fn cancelled_token_refuses_work(mut connection: SqliteConnection) {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let error = connection
            .query_scalar(&ctx, "SELECT COUNT(*) FROM t")
            .expect_err("cancelled");
        assert!(error.is_cancelled());
        assert!(connection.begin(&ctx).is_err());
    }
}
