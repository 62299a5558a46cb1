//! Test world: a temporary directory holding the legacy and destination
//! databases, plus the recording collaborators the assembler is wired to.

use std::cell::RefCell;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rusqlite::Connection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use replistore_config::{ConnectionPoolConfig, TlsConfig};

use crate::assembler::{AssembleError, Assembled, Assembler};
use crate::driver::DriverRegistry;
use crate::migrate::{Migrator, VersionedRow};
use crate::sql::{SqlValue, SqliteDriver};

use super::KINE_SCHEMA;
use super::driver_builder::RecordingDriverBuilder;
use super::opener::{RecordingBackend, SchemaOpener};
use super::reporter::RecordingAssemblyReporter;

const INSERT_ROW: &str = "INSERT INTO kine(id, name, created, deleted, create_revision, \
                          prev_revision, lease, value, old_value) \
                          values(?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Builds a live revision of `name`.
#[must_use]
pub fn versioned_row(id: i64, name: &str) -> VersionedRow {
    VersionedRow {
        id,
        name: name.to_owned(),
        created: 1,
        deleted: 0,
        create_revision: id,
        prev_revision: 0,
        lease: 0,
        value: Some(format!("value-{id}").into_bytes()),
        old_value: None,
    }
}

fn insert_rows(connection: &Connection, rows: &[VersionedRow]) {
    for row in rows {
        let params = [
            SqlValue::Integer(row.id),
            SqlValue::Text(row.name.clone()),
            SqlValue::Integer(row.created),
            SqlValue::Integer(row.deleted),
            SqlValue::Integer(row.create_revision),
            SqlValue::Integer(row.prev_revision),
            SqlValue::Integer(row.lease),
            SqlValue::from(row.value.clone()),
            SqlValue::from(row.old_value.clone()),
        ];
        connection
            .execute(INSERT_ROW, rusqlite::params_from_iter(params.iter()))
            .expect("insert row");
    }
}

/// Scenario world shared across tests and BDD steps.
pub struct TestWorld {
    dir: TempDir,
    /// Registry the assembler registers drivers in.
    pub registry: Arc<DriverRegistry>,
    /// Driver builder double.
    pub builder: RecordingDriverBuilder,
    /// Generic-layer double.
    pub opener: SchemaOpener,
    /// Event recorder.
    pub reporter: Arc<RecordingAssemblyReporter>,
    /// Pre-registered driver to reuse instead of building one.
    pub driver_name: Option<String>,
    /// Pool limits handed to the opener.
    pub pool: ConnectionPoolConfig,
    result: Option<Result<Assembled<RecordingBackend>, AssembleError>>,
}

impl TestWorld {
    /// Builds a world with an empty temporary directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            registry: Arc::new(DriverRegistry::new()),
            builder: RecordingDriverBuilder::default(),
            opener: SchemaOpener::default(),
            reporter: Arc::new(RecordingAssemblyReporter::default()),
            driver_name: None,
            pool: ConnectionPoolConfig::default(),
            result: None,
        }
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().join(name)).expect("utf-8 temp path")
    }

    /// Location of the legacy single-node database.
    #[must_use]
    pub fn legacy_path(&self) -> Utf8PathBuf {
        self.path("state.db")
    }

    /// Location of the destination store.
    #[must_use]
    pub fn destination_path(&self) -> Utf8PathBuf {
        self.path("kine.db")
    }

    /// Location of the membership file.
    #[must_use]
    pub fn peer_file(&self) -> Utf8PathBuf {
        self.path("cluster.json")
    }

    /// Creates the legacy database holding `rows`.
    pub fn seed_legacy(&self, rows: &[VersionedRow]) {
        let connection = Connection::open(self.legacy_path()).expect("open legacy");
        connection.execute_batch(KINE_SCHEMA).expect("legacy schema");
        insert_rows(&connection, rows);
    }

    /// Creates the destination store holding `rows`.
    pub fn seed_destination(&self, rows: &[VersionedRow]) {
        let connection = Connection::open(self.destination_path()).expect("open destination");
        connection
            .execute_batch(KINE_SCHEMA)
            .expect("destination schema");
        insert_rows(&connection, rows);
    }

    /// Makes the destination reject rows named `poison`.
    pub fn poison_destination(&self) {
        let connection = Connection::open(self.destination_path()).expect("open destination");
        connection
            .execute_batch(KINE_SCHEMA)
            .expect("destination schema");
        connection
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON kine \
                 WHEN NEW.name = 'poison' BEGIN SELECT RAISE(ABORT, 'poisoned row'); END;",
            )
            .expect("poison trigger");
    }

    /// Registers a local SQLite driver as `name` and asks the assembler to
    /// reuse it.
    pub fn preregister_driver(&mut self, name: &str) {
        self.registry
            .register(name, Arc::new(SqliteDriver))
            .expect("pre-register driver");
        self.driver_name = Some(name.to_owned());
    }

    /// Assembler wired to this world's collaborators.
    #[must_use]
    pub fn assembler(&self) -> Assembler<SchemaOpener> {
        let assembler = Assembler::new(
            Arc::clone(&self.registry),
            Arc::new(self.builder.clone()),
            self.opener.clone(),
        )
        .with_migrator(Migrator::new(self.legacy_path()))
        .with_reporter(self.reporter.clone());
        match self.driver_name.as_deref() {
            Some(name) => assembler.with_driver_name(name),
            None => assembler,
        }
    }

    /// Data source name for the destination with `query` appended.
    #[must_use]
    pub fn dsn(&self, query: &str) -> String {
        if query.is_empty() {
            self.destination_path().into_string()
        } else {
            format!("{}?{query}", self.destination_path())
        }
    }

    /// Runs the assembler once with the given query extensions and TLS.
    pub fn assemble_with(&mut self, ctx: &CancellationToken, query: &str, tls: &TlsConfig) {
        let dsn = self.dsn(query);
        let result = self
            .assembler()
            .assemble(ctx, &dsn, tls, &self.pool);
        self.result = Some(result);
    }

    /// Runs the assembler with a live token, no extensions, and no TLS.
    pub fn assemble(&mut self) {
        self.assemble_with(&CancellationToken::new(), "", &TlsConfig::default());
    }

    /// Successful assembly, if the last run succeeded.
    #[must_use]
    pub fn assembled(&self) -> Option<&Assembled<RecordingBackend>> {
        self.result.as_ref().and_then(|result| result.as_ref().ok())
    }

    /// Error from the last run, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<&AssembleError> {
        self.result.as_ref().and_then(|result| result.as_ref().err())
    }

    /// Rows currently stored in the destination.
    #[must_use]
    pub fn destination_rows(&self) -> i64 {
        let connection = Connection::open(self.destination_path()).expect("open destination");
        connection
            .query_row("SELECT COUNT(*) FROM kine", [], |row| row.get(0))
            .expect("count destination rows")
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Default test world fixture.
#[must_use]
pub fn world() -> RefCell<TestWorld> {
    RefCell::new(TestWorld::new())
}
