//! Backend assembly: from a data source name to a ready, migrated store.
//!
//! [`Assembler::assemble`] runs a fixed sequence of stages. Each stage is
//! reported to the configured [`AssemblyReporter`] and any failure is
//! returned as an [`AssembleError`] naming the stage it came from. Nothing is
//! retried.
//!
//! 1. Parse the `peer`/`peer-file` extensions out of the data source name.
//! 2. Open the membership store and merge in the configured peers.
//! 3. Unless a pre-registered driver name was supplied, build the dialer and
//!    the replicated driver, then register it as `dqlite`.
//! 4. Open the generic SQL store through the [`SqlBackendOpener`].
//! 5. Import the legacy single-node history.
//! 6. Install the [`WritePolicy`] on the backend.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use replistore_config::{
    BackendConfig, ConnectionOptions, ConnectionPoolConfig, OptionsError, TlsConfig,
    default_driver_name,
};

use crate::dialer::{DialerError, dialer_for};
use crate::driver::{
    DriverBuilder, DriverError, DriverRegistry, DriverRequest, LogHook, install_driver,
    tracing_log_hook,
};
use crate::health::{AssemblyReporter, StructuredAssemblyReporter};
use crate::migrate::{MigrationError, MigrationOutcome, Migrator};
use crate::node_store::{NodeStoreError, add_peers, open_node_store};
use crate::policy::WritePolicy;
use crate::sql::SqlConnection;

/// Steps of the assembly sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Parsing the data source name.
    Options,
    /// Opening the membership store.
    NodeStore,
    /// Merging configured peers into the membership store.
    AddPeers,
    /// Building the peer dial function.
    Dialer,
    /// Building the replicated driver.
    Driver,
    /// Registering the driver by name.
    Register,
    /// Opening the generic SQL store.
    OpenStore,
    /// Importing legacy data.
    Migrate,
}

impl fmt::Display for Stage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Options => "options",
            Self::NodeStore => "node_store",
            Self::AddPeers => "add_peers",
            Self::Dialer => "dialer",
            Self::Driver => "driver",
            Self::Register => "register",
            Self::OpenStore => "open_store",
            Self::Migrate => "migrate",
        };
        formatter.write_str(label)
    }
}

/// Failure raised by a [`SqlBackendOpener`].
#[derive(Debug, Error)]
pub enum OpenError {
    /// The registry could not hand out a connection.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The generic layer rejected the store.
    #[error("{message}")]
    Backend {
        /// Description supplied by the opener.
        message: String,
        /// Optional underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl OpenError {
    /// Opener failure without an underlying source.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Errors surfaced by [`Assembler::assemble`], labelled by stage.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// The data source name carried malformed extensions.
    #[error("invalid backend options: {source}")]
    Options {
        /// Parser failure.
        #[source]
        source: OptionsError,
    },
    /// The membership store could not be opened.
    #[error("opening peer file: {source}")]
    NodeStore {
        /// Store failure.
        #[source]
        source: NodeStoreError,
    },
    /// Configured peers could not be merged.
    #[error("add peers: {source}")]
    AddPeers {
        /// Store failure.
        #[source]
        source: NodeStoreError,
    },
    /// The TLS dialer could not be built.
    #[error("failed to configure peer dialer: {source}")]
    Dialer {
        /// Dialer failure.
        #[source]
        source: DialerError,
    },
    /// The replicated driver could not be built.
    #[error("new replicated driver: {source}")]
    Driver {
        /// Builder failure.
        #[source]
        source: DriverError,
    },
    /// The driver name was already taken.
    #[error("failed to register driver: {source}")]
    Register {
        /// Registry failure.
        #[source]
        source: DriverError,
    },
    /// The generic store could not be opened.
    #[error("sql client: {source}")]
    OpenStore {
        /// Opener failure.
        #[source]
        source: OpenError,
    },
    /// The legacy import failed and was rolled back.
    #[error("failed to migrate legacy data: {source}")]
    Migrate {
        /// Migration failure.
        #[source]
        source: MigrationError,
    },
}

impl AssembleError {
    /// Stage that produced the error.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Options { .. } => Stage::Options,
            Self::NodeStore { .. } => Stage::NodeStore,
            Self::AddPeers { .. } => Stage::AddPeers,
            Self::Dialer { .. } => Stage::Dialer,
            Self::Driver { .. } => Stage::Driver,
            Self::Register { .. } => Stage::Register,
            Self::OpenStore { .. } => Stage::OpenStore,
            Self::Migrate { .. } => Stage::Migrate,
        }
    }
}

/// Backend handle plus a raw connection used for the legacy import.
pub struct OpenedStore<B> {
    /// Handle the key-value server will use.
    pub backend: B,
    /// Connection onto the same store, dropped after migration.
    pub connection: Box<dyn SqlConnection>,
}

impl<B: fmt::Debug> fmt::Debug for OpenedStore<B> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OpenedStore")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// Backend that accepts the runtime write policy.
pub trait PolicyTarget {
    /// Installs `policy` for all subsequent writes.
    fn apply_policy(&mut self, policy: WritePolicy);
}

/// Opens the generic SQL-to-key-value layer over a registered driver.
pub trait SqlBackendOpener {
    /// Backend type produced by the generic layer.
    type Backend: PolicyTarget;

    /// Opens the store at `dsn` through the driver registered as
    /// `driver_name`.
    fn open(
        &self,
        ctx: &CancellationToken,
        registry: &DriverRegistry,
        driver_name: &str,
        dsn: &str,
        pool: &ConnectionPoolConfig,
    ) -> Result<OpenedStore<Self::Backend>, OpenError>;
}

/// Facts about a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblySummary {
    /// Driver the store was opened through.
    pub driver_name: String,
    /// `true` when this assembly built and registered the driver.
    pub driver_built: bool,
    /// Peers newly added to the membership store.
    pub peers_added: usize,
    /// Result of the legacy import.
    pub migration: MigrationOutcome,
}

/// A backend ready to serve, with the facts of its assembly.
#[derive(Debug)]
pub struct Assembled<B> {
    backend: B,
    summary: AssemblySummary,
}

impl<B> Assembled<B> {
    /// Borrows the backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Facts recorded during assembly.
    #[must_use]
    pub const fn summary(&self) -> &AssemblySummary {
        &self.summary
    }

    /// Releases the backend.
    #[must_use]
    pub fn into_backend(self) -> B {
        self.backend
    }
}

/// Wires the collaborators together and runs the assembly sequence.
pub struct Assembler<O> {
    registry: Arc<DriverRegistry>,
    builder: Arc<dyn DriverBuilder>,
    opener: O,
    migrator: Migrator,
    reporter: Arc<dyn AssemblyReporter>,
    log: LogHook,
    driver_name: Option<String>,
}

impl<O> Assembler<O>
where
    O: SqlBackendOpener,
{
    /// Builds an assembler with the default migrator, reporter, and log hook.
    #[must_use]
    pub fn new(registry: Arc<DriverRegistry>, builder: Arc<dyn DriverBuilder>, opener: O) -> Self {
        Self {
            registry,
            builder,
            opener,
            migrator: Migrator::default(),
            reporter: Arc::new(StructuredAssemblyReporter::new()),
            log: tracing_log_hook(),
            driver_name: None,
        }
    }

    /// Reads legacy data through `migrator`.
    #[must_use]
    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Sends lifecycle events to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn AssemblyReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Routes driver log lines through `log`.
    #[must_use]
    pub fn with_log_hook(mut self, log: LogHook) -> Self {
        self.log = log;
        self
    }

    /// Reuses a driver already registered as `name` instead of building one.
    #[must_use]
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = Some(name.into());
        self
    }

    /// Registry drivers are registered in.
    #[must_use]
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Runs the full sequence for `dsn`.
    pub fn assemble(
        &self,
        ctx: &CancellationToken,
        dsn: &str,
        tls: &TlsConfig,
        pool: &ConnectionPoolConfig,
    ) -> Result<Assembled<O::Backend>, AssembleError> {
        self.reporter.assembly_starting();
        match self.run(ctx, dsn, tls, pool) {
            Ok(assembled) => {
                self.reporter.assembly_succeeded(&assembled.summary);
                Ok(assembled)
            }
            Err(error) => {
                self.reporter.assembly_failed(&error);
                Err(error)
            }
        }
    }

    fn run(
        &self,
        ctx: &CancellationToken,
        dsn: &str,
        tls: &TlsConfig,
        pool: &ConnectionPoolConfig,
    ) -> Result<Assembled<O::Backend>, AssembleError> {
        let options = self.stage(Stage::Options, || {
            ConnectionOptions::parse(dsn)
                .map(|parsed| match self.driver_name.as_deref() {
                    Some(name) => parsed.with_driver_name(name),
                    None => parsed,
                })
                .map_err(|source| AssembleError::Options { source })
        })?;

        let node_store = self.stage(Stage::NodeStore, || {
            open_node_store(&options).map_err(|source| AssembleError::NodeStore { source })
        })?;

        let peers_added = self.stage(Stage::AddPeers, || {
            add_peers(ctx, node_store.as_ref(), &options.peers)
                .map_err(|source| AssembleError::AddPeers { source })
        })?;

        let (driver_name, driver_built) = match options.driver_name.as_deref() {
            Some(name) => (name.to_owned(), false),
            None => {
                let name = default_driver_name().to_owned();
                let dial = self.stage(Stage::Dialer, || {
                    dialer_for(tls).map_err(|source| AssembleError::Dialer { source })
                })?;
                let request = DriverRequest {
                    node_store,
                    log: Arc::clone(&self.log),
                    context: ctx.clone(),
                    dial,
                };
                let driver = self.stage(Stage::Driver, || {
                    self.builder
                        .build(request)
                        .map_err(|source| AssembleError::Driver { source })
                })?;
                self.stage(Stage::Register, || {
                    install_driver(&self.registry, &name, driver)
                        .map_err(|source| AssembleError::Register { source })
                })?;
                (name, true)
            }
        };

        let opened = self.stage(Stage::OpenStore, || {
            self.opener
                .open(ctx, &self.registry, &driver_name, &options.dsn, pool)
                .map_err(|source| AssembleError::OpenStore { source })
        })?;
        let OpenedStore {
            mut backend,
            mut connection,
        } = opened;

        let migration = self.stage(Stage::Migrate, || {
            self.migrator
                .migrate(ctx, connection.as_mut())
                .map_err(|source| AssembleError::Migrate { source })
        })?;
        drop(connection);

        backend.apply_policy(WritePolicy::replicated());

        Ok(Assembled {
            backend,
            summary: AssemblySummary {
                driver_name,
                driver_built,
                peers_added,
                migration,
            },
        })
    }

    fn stage<T>(
        &self,
        stage: Stage,
        work: impl FnOnce() -> Result<T, AssembleError>,
    ) -> Result<T, AssembleError> {
        self.reporter.stage_starting(stage);
        let value = work()?;
        self.reporter.stage_completed(stage);
        Ok(value)
    }
}

impl<O: fmt::Debug> fmt::Debug for Assembler<O> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Assembler")
            .field("registry", &self.registry)
            .field("opener", &self.opener)
            .field("migrator", &self.migrator)
            .field("driver_name", &self.driver_name)
            .finish_non_exhaustive()
    }
}

/// Assembles a backend from a resolved [`BackendConfig`].
///
/// Uses the structured reporter, the `tracing` log hook, and a migrator
/// reading from [`BackendConfig::legacy_database`].
pub fn new_backend<O>(
    ctx: &CancellationToken,
    config: &BackendConfig,
    registry: Arc<DriverRegistry>,
    builder: Arc<dyn DriverBuilder>,
    opener: O,
) -> Result<Assembled<O::Backend>, AssembleError>
where
    O: SqlBackendOpener,
{
    Assembler::new(registry, builder, opener)
        .with_migrator(Migrator::new(config.legacy_database()))
        .assemble(ctx, &config.dsn, &config.tls, &config.pool)
}
