//! Named database drivers and their one-time registration.
//!
//! A [`DriverRegistry`] maps driver names to [`Driver`] instances. Names are
//! write-once: the first registration wins and later attempts fail, so a
//! process that assembles several backends must either pick distinct names or
//! pass an already registered name through
//! [`ConnectionOptions::with_driver_name`](replistore_config::ConnectionOptions::with_driver_name).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::dialer::DialOption;
use crate::node_store::NodeStore;
use crate::sql::{SqlConnection, SqlError};

/// Opens raw connections for a data source name.
pub trait Driver: Send + Sync {
    /// Connects to `dsn`.
    fn connect(&self, ctx: &CancellationToken, dsn: &str)
    -> Result<Box<dyn SqlConnection>, SqlError>;
}

/// Severity attached to driver log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Routine operation.
    Info,
    /// Recoverable trouble.
    Warn,
    /// Failures.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        formatter.write_str(label)
    }
}

/// Callback the driver uses to emit log lines.
pub type LogHook = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Log hook that forwards driver output to `tracing`.
#[must_use]
pub fn tracing_log_hook() -> LogHook {
    Arc::new(|level: LogLevel, message: &str| match level {
        LogLevel::Debug => tracing::debug!(target: "replistore::driver", "{message}"),
        LogLevel::Info => tracing::info!(target: "replistore::driver", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "replistore::driver", "{message}"),
        LogLevel::Error => tracing::error!(target: "replistore::driver", "{message}"),
    })
}

/// Everything a [`DriverBuilder`] needs to construct the replicated driver.
#[derive(Clone)]
pub struct DriverRequest {
    /// Cluster membership consulted for peers and leader discovery.
    pub node_store: Arc<dyn NodeStore>,
    /// Sink for driver log lines.
    pub log: LogHook,
    /// Token bounding the driver's background work.
    pub context: CancellationToken,
    /// Connection function used to reach peers.
    pub dial: DialOption,
}

impl fmt::Debug for DriverRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DriverRequest")
            .field("context", &self.context)
            .field("dial", &self.dial)
            .finish_non_exhaustive()
    }
}

/// Constructs the replicated driver.
pub trait DriverBuilder: Send + Sync {
    /// Builds a driver bound to the supplied membership and dialer.
    fn build(&self, request: DriverRequest) -> Result<Arc<dyn Driver>, DriverError>;
}

/// Errors raised while building, registering, or using a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The builder rejected the request.
    #[error("failed to build driver: {message}")]
    Build {
        /// Description supplied by the builder.
        message: String,
        /// Optional underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// A driver is already registered under the name.
    #[error("driver '{name}' is already registered")]
    AlreadyRegistered {
        /// Contested name.
        name: String,
    },
    /// No driver is registered under the name.
    #[error("no driver registered as '{name}'")]
    Unknown {
        /// Requested name.
        name: String,
    },
    /// The driver failed to open a connection.
    #[error("driver '{name}' failed to connect: {source}")]
    Connect {
        /// Driver name.
        name: String,
        /// Driver-reported failure.
        #[source]
        source: SqlError,
    },
}

impl DriverError {
    /// Builder failure without an underlying source.
    #[must_use]
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
            source: None,
        }
    }

    /// Builder failure wrapping an underlying source.
    #[must_use]
    pub fn build_with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Build {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Write-once table of named drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` under `name`.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> Result<(), DriverError> {
        let mut drivers = self
            .drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if drivers.contains_key(name) {
            return Err(DriverError::AlreadyRegistered {
                name: name.to_owned(),
            });
        }
        drivers.insert(name.to_owned(), driver);
        Ok(())
    }

    /// Looks up the driver registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns `true` when `name` is taken.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Opens a connection to `dsn` through the driver registered as `name`.
    pub fn connect(
        &self,
        ctx: &CancellationToken,
        name: &str,
        dsn: &str,
    ) -> Result<Box<dyn SqlConnection>, DriverError> {
        let driver = self.get(name).ok_or_else(|| DriverError::Unknown {
            name: name.to_owned(),
        })?;
        driver
            .connect(ctx, dsn)
            .map_err(|source| DriverError::Connect {
                name: name.to_owned(),
                source,
            })
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drivers = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&str> = drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        formatter
            .debug_struct("DriverRegistry")
            .field("drivers", &names)
            .finish()
    }
}

/// Builds a driver from `request` and registers it under `name`.
///
/// The registry is not consulted first: a taken name surfaces as
/// [`DriverError::AlreadyRegistered`] after the builder has run.
pub fn register_driver(
    registry: &DriverRegistry,
    builder: &dyn DriverBuilder,
    name: &str,
    request: DriverRequest,
) -> Result<(), DriverError> {
    let driver = builder.build(request)?;
    install_driver(registry, name, driver)
}

/// Registers an already built `driver` under `name`.
pub fn install_driver(
    registry: &DriverRegistry,
    name: &str,
    driver: Arc<dyn Driver>,
) -> Result<(), DriverError> {
    registry.register(name, driver)?;
    tracing::info!(
        target: "replistore::driver",
        event = "driver_registered",
        driver = name,
        "driver registered"
    );
    Ok(())
}
