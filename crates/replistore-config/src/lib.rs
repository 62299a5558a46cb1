//! Shared configuration for the replicated key-value storage backend.
//!
//! The crate owns everything the backend needs to know before it touches the
//! network or the disk: the data source name and its `peer`/`peer-file`
//! extensions, the client certificate pair used to reach cluster peers, pool
//! limits for the generic SQL layer, the location of the legacy single-node
//! database, and logging preferences.
//!
//! [`BackendConfig`] can be built in code or read from a JSON document with
//! [`BackendConfig::from_json_file`]. Missing fields fall back to the values in
//! the defaults module.

mod defaults;
mod dsn;
mod logging;
mod pool;
mod tls;

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_DRIVER_NAME, DEFAULT_LEGACY_DATABASE, DEFAULT_LOG_FILTER, default_driver_name,
    default_legacy_database, default_log_filter, default_log_filter_string, default_log_format,
};
pub use dsn::{ConnectionOptions, NodeInfo, OptionsError};
pub use logging::{LogFormat, LogFormatParseError};
pub use pool::ConnectionPoolConfig;
pub use tls::TlsConfig;

/// Resolved configuration for one backend instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Data source name, including any `peer`/`peer-file` extensions.
    pub dsn: String,
    /// Client certificate pair for peer connections.
    pub tls: TlsConfig,
    /// Limits applied by the generic SQL layer.
    pub pool: ConnectionPoolConfig,
    /// Single-node database migrated into the replicated store on first start.
    pub legacy_database: Utf8PathBuf,
    /// `tracing` filter directive.
    pub log_filter: String,
    /// Log output encoding.
    pub log_format: LogFormat,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            tls: TlsConfig::default(),
            pool: ConnectionPoolConfig::default(),
            legacy_database: default_legacy_database(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl BackendConfig {
    /// Reads a configuration document, filling absent fields with defaults.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the configured log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Returns the configured log format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Returns the legacy database path probed during migration.
    #[must_use]
    pub fn legacy_database(&self) -> &Utf8Path {
        self.legacy_database.as_path()
    }
}

/// Errors raised while loading a [`BackendConfig`] document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read.
    #[error("failed to read configuration '{path}': {source}")]
    Read {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The document was not valid JSON for [`BackendConfig`].
    #[error("failed to parse configuration '{path}': {source}")]
    Parse {
        /// Document path.
        path: Utf8PathBuf,
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },
}
