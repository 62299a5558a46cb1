//! One-time import of history from the legacy single-node database.
//!
//! The import only runs against an empty destination and copies every row
//! of the `kine` table inside a single destination transaction. Either all
//! rows land or none do.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OpenFlags, Row};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use replistore_config::default_legacy_database;

use crate::sql::{SqlConnection, SqlError, SqlTransaction, SqlValue, interrupt_on_cancel};

const COUNT_ROWS: &str = "SELECT COUNT(*) FROM kine";

const SELECT_ROWS: &str = "SELECT id, name, created, deleted, create_revision, prev_revision, \
                           lease, value, old_value FROM kine";

const INSERT_ROW: &str = "INSERT INTO kine(id, name, created, deleted, create_revision, \
                          prev_revision, lease, value, old_value) \
                          values(?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// One entry of the version-history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRow {
    /// Revision number.
    pub id: i64,
    /// Key.
    pub name: String,
    /// Non-zero when this revision created the key.
    pub created: i64,
    /// Non-zero when this revision deleted the key.
    pub deleted: i64,
    /// Revision that created the key.
    pub create_revision: i64,
    /// Previous revision of the key.
    pub prev_revision: i64,
    /// Lease identifier.
    pub lease: i64,
    /// Value at this revision.
    pub value: Option<Vec<u8>>,
    /// Value at the previous revision.
    pub old_value: Option<Vec<u8>>,
}

impl VersionedRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created: row.get(2)?,
            deleted: row.get(3)?,
            create_revision: row.get(4)?,
            prev_revision: row.get(5)?,
            lease: row.get(6)?,
            value: row.get(7)?,
            old_value: row.get(8)?,
        })
    }

    fn into_params(self) -> [SqlValue; 9] {
        [
            SqlValue::Integer(self.id),
            SqlValue::Text(self.name),
            SqlValue::Integer(self.created),
            SqlValue::Integer(self.deleted),
            SqlValue::Integer(self.create_revision),
            SqlValue::Integer(self.prev_revision),
            SqlValue::Integer(self.lease),
            SqlValue::from(self.value),
            SqlValue::from(self.old_value),
        ]
    }
}

/// What [`Migrator::migrate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The destination already held rows; nothing was copied.
    AlreadyMigrated {
        /// Rows found in the destination.
        rows: i64,
    },
    /// No legacy database exists at the configured path.
    NoLegacyStore,
    /// The legacy database exists but could not be opened or queried.
    NoLegacyData,
    /// Rows were copied and committed.
    Migrated {
        /// Rows copied.
        rows: u64,
    },
}

/// Errors that abort the migration. The destination is left untouched.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Counting destination rows failed.
    #[error("failed to count existing rows: {source}")]
    Count {
        /// Driver failure.
        #[source]
        source: SqlError,
    },
    /// The destination transaction could not be opened.
    #[error("failed to begin migration transaction: {source}")]
    Begin {
        /// Driver failure.
        #[source]
        source: SqlError,
    },
    /// A legacy row could not be read.
    #[error("failed to read legacy row: {source}")]
    Read {
        /// Driver failure.
        #[source]
        source: SqlError,
    },
    /// A row could not be inserted into the destination.
    #[error("failed to insert row {id}: {source}")]
    Insert {
        /// Revision of the rejected row.
        id: i64,
        /// Driver failure.
        #[source]
        source: SqlError,
    },
    /// The transaction could not be committed.
    #[error("failed to commit migration: {source}")]
    Commit {
        /// Driver failure.
        #[source]
        source: SqlError,
    },
    /// The caller's cancellation token fired.
    #[error("migration cancelled")]
    Cancelled,
}

/// Copies the legacy version history into a freshly opened store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migrator {
    legacy_path: Utf8PathBuf,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(default_legacy_database())
    }
}

impl Migrator {
    /// Builds a migrator reading from `legacy_path`.
    #[must_use]
    pub fn new(legacy_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            legacy_path: legacy_path.into(),
        }
    }

    /// Path probed for the legacy database.
    #[must_use]
    pub fn legacy_path(&self) -> &Utf8Path {
        self.legacy_path.as_path()
    }

    /// Runs the import against `destination`.
    ///
    /// The row-count check assumes nothing else writes to the destination
    /// while the backend is starting.
    pub fn migrate(
        &self,
        ctx: &CancellationToken,
        destination: &mut dyn SqlConnection,
    ) -> Result<MigrationOutcome, MigrationError> {
        let existing = destination
            .query_scalar(ctx, COUNT_ROWS)
            .map_err(|source| wrap_failure(source, |inner| MigrationError::Count { source: inner }))?;
        if existing > 0 {
            tracing::debug!(
                target: "replistore::migrate",
                event = "migration_skipped",
                rows = existing,
                "destination already populated"
            );
            return Ok(MigrationOutcome::AlreadyMigrated { rows: existing });
        }

        if fs::metadata(self.legacy_path.as_std_path()).is_err() {
            return Ok(MigrationOutcome::NoLegacyStore);
        }

        let legacy = match open_legacy(self.legacy_path.as_path()) {
            Ok(connection) => connection,
            Err(error) => {
                report_unavailable(&self.legacy_path, &error);
                return Ok(MigrationOutcome::NoLegacyData);
            }
        };
        interrupt_on_cancel(&legacy, ctx);

        let mut statement = match legacy.prepare(SELECT_ROWS) {
            Ok(statement) => statement,
            Err(error) => {
                report_unavailable(&self.legacy_path, &error);
                return Ok(MigrationOutcome::NoLegacyData);
            }
        };
        let mut rows = match statement.query([]) {
            Ok(rows) => rows,
            Err(error) => {
                report_unavailable(&self.legacy_path, &error);
                return Ok(MigrationOutcome::NoLegacyData);
            }
        };

        let mut transaction = destination
            .begin(ctx)
            .map_err(|source| wrap_failure(source, |inner| MigrationError::Begin { source: inner }))?;

        let mut copied: u64 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let next = match rows.next() {
                Ok(Some(row)) => VersionedRow::from_row(row),
                Ok(None) => break,
                Err(error) => Err(error),
            };
            let row = next.map_err(|error| {
                wrap_failure(SqlError::from(error), |inner| MigrationError::Read {
                    source: inner,
                })
            })?;
            insert(transaction.as_mut(), row)?;
            copied += 1;
        }

        transaction
            .commit()
            .map_err(|source| wrap_failure(source, |inner| MigrationError::Commit { source: inner }))?;

        tracing::info!(
            target: "replistore::migrate",
            event = "migration_completed",
            path = %self.legacy_path,
            rows = copied,
            "migrated legacy data"
        );
        Ok(MigrationOutcome::Migrated { rows: copied })
    }
}

fn report_unavailable(path: &Utf8Path, error: &rusqlite::Error) {
    tracing::warn!(
        target: "replistore::migrate",
        event = "legacy_unavailable",
        path = %path,
        error = %error,
        "failed to find old data to migrate"
    );
}

fn open_legacy(path: &Utf8Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path.as_std_path(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

fn insert(
    transaction: &mut (dyn SqlTransaction + '_),
    row: VersionedRow,
) -> Result<(), MigrationError> {
    let id = row.id;
    transaction
        .execute(INSERT_ROW, &row.into_params())
        .map_err(|source| wrap_failure(source, |inner| MigrationError::Insert { id, source: inner }))?;
    Ok(())
}

fn wrap_failure(source: SqlError, wrap: impl FnOnce(SqlError) -> MigrationError) -> MigrationError {
    if source.is_cancelled() {
        MigrationError::Cancelled
    } else {
        wrap(source)
    }
}
