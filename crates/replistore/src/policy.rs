//! Runtime write policy installed on the assembled backend.
//!
//! The replicated engine reports contention as a busy error and uniqueness
//! violations with the SQLite wording. Busy errors are retried by the generic
//! layer; uniqueness violations become [`StoreError::KeyExists`].

use std::fmt;

use thiserror::Error;

use crate::sql::{SqlError, SqlErrorCode};

const UNIQUE_CONSTRAINT_MARKER: &str = "UNIQUE constraint";

/// Classification used by the retry and translation hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Contention; the operation may be retried.
    Busy,
    /// A uniqueness constraint rejected the write.
    UniqueViolation,
    /// Anything else.
    Other,
}

/// Classifies `error`, preferring the structured code over its message.
#[must_use]
pub fn classify(error: &SqlError) -> ErrorKind {
    match error.code() {
        SqlErrorCode::Busy => ErrorKind::Busy,
        SqlErrorCode::Unique => ErrorKind::UniqueViolation,
        _ if error.message().contains(UNIQUE_CONSTRAINT_MARKER) => ErrorKind::UniqueViolation,
        _ => ErrorKind::Other,
    }
}

/// Returns `true` only for busy errors.
#[must_use]
pub fn is_retryable(error: &SqlError) -> bool {
    classify(error) == ErrorKind::Busy
}

/// Error surfaced by the backend to the key-value server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key is already present.
    #[error("key exists")]
    KeyExists,
    /// Any other driver failure, unchanged.
    #[error(transparent)]
    Sql(#[from] SqlError),
}

/// Maps uniqueness violations to [`StoreError::KeyExists`].
#[must_use]
pub fn translate_error(error: SqlError) -> StoreError {
    match classify(&error) {
        ErrorKind::UniqueViolation => StoreError::KeyExists,
        ErrorKind::Busy | ErrorKind::Other => StoreError::Sql(error),
    }
}

/// Behaviour the generic layer applies to every write.
#[derive(Clone, Copy)]
pub struct WritePolicy {
    /// Serialise writes inside the process.
    pub lock_writes: bool,
    /// Decides whether a failed write is retried.
    pub retry: fn(&SqlError) -> bool,
    /// Maps driver errors to server errors.
    pub translate: fn(SqlError) -> StoreError,
}

impl WritePolicy {
    /// Policy for the replicated store: locked writes, busy retry, and
    /// uniqueness translation.
    #[must_use]
    pub fn replicated() -> Self {
        Self {
            lock_writes: true,
            retry: is_retryable,
            translate: translate_error,
        }
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::replicated()
    }
}

impl fmt::Debug for WritePolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WritePolicy")
            .field("lock_writes", &self.lock_writes)
            .finish_non_exhaustive()
    }
}
