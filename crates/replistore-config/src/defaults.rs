use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Driver name synthesised when the caller does not supply a pre-registered one.
pub const DEFAULT_DRIVER_NAME: &str = "dqlite";

/// Location of the single-node database that predates the replicated store.
pub const DEFAULT_LEGACY_DATABASE: &str = "./db/state.db";

/// Default log filter expression used when embedding the backend.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default log filter expression.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Path probed for legacy data when no override is configured.
pub fn default_legacy_database() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_LEGACY_DATABASE)
}

/// Driver name used by the assembler when none was pre-registered.
pub fn default_driver_name() -> &'static str {
    DEFAULT_DRIVER_NAME
}
