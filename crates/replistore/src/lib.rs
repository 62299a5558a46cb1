//! Bootstrap for a key-value backend stored in a replicated SQL engine.
//!
//! The crate turns a data source name into a ready backend. It reads the
//! `peer`/`peer-file` extensions, seeds the cluster membership store, builds
//! an optionally TLS-authenticated dial function for peers, and registers the
//! replicated driver once per [`DriverRegistry`]. It then opens the generic
//! SQL layer, imports the history of a legacy single-node database on first
//! start, and installs the write policy.
//!
//! The replicated engine and the generic SQL-to-key-value layer are supplied
//! by the embedder through the [`DriverBuilder`] and [`SqlBackendOpener`]
//! traits. [`SqliteDriver`] opens plain local SQLite files and is useful for
//! single-node deployments and tests.
//!
//! All operations are synchronous and take a [`CancellationToken`]; a
//! cancelled token aborts the current step with a cancellation error.

mod assembler;
mod dialer;
mod driver;
mod health;
mod migrate;
mod node_store;
mod policy;
mod sql;
pub mod telemetry;

pub use assembler::{
    AssembleError, Assembled, Assembler, AssemblySummary, OpenError, OpenedStore, PolicyTarget,
    SqlBackendOpener, Stage, new_backend,
};
pub use dialer::{DialFn, DialOption, DialerError, PeerStream, default_dial, dialer_for};
pub use driver::{
    Driver, DriverBuilder, DriverError, DriverRegistry, DriverRequest, LogHook, LogLevel,
    install_driver, register_driver, tracing_log_hook,
};
pub use health::{AssemblyReporter, StructuredAssemblyReporter};
pub use migrate::{MigrationError, MigrationOutcome, Migrator, VersionedRow};
pub use node_store::{
    FileNodeStore, InMemoryNodeStore, NodeStore, NodeStoreError, add_peers, open_node_store,
};
pub use policy::{ErrorKind, StoreError, WritePolicy, classify, is_retryable, translate_error};
pub use sql::{
    SqlConnection, SqlError, SqlErrorCode, SqlTransaction, SqlValue, SqliteConnection,
    SqliteDriver,
};
pub use telemetry::{TelemetryError, TelemetryHandle};

pub use replistore_config::{
    BackendConfig, ConnectionOptions, ConnectionPoolConfig, NodeInfo, OptionsError, TlsConfig,
};
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;
