//! Log output for the backend's `tracing` events.
//!
//! Assembly, driver, and migration events are emitted under the
//! `replistore::*` targets whether or not a subscriber is listening. An
//! embedding process that has no subscriber of its own calls [`initialise`]
//! once at startup to send them to stderr in the configured [`LogFormat`].
//! [`subscriber_for`] builds the same subscriber over any writer.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};

use replistore_config::{BackendConfig, LogFormat, default_log_filter};

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Boxed subscriber as built by [`subscriber_for`].
pub type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Proof that the process-wide subscriber is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format chosen by the call that installed the subscriber.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter directives did not parse.
    #[error("invalid log filter '{directives}': {reason}")]
    Filter {
        /// Directives as configured.
        directives: String,
        /// Parser message.
        reason: String,
    },
    /// Another global subscriber was already installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the stderr subscriber described by `config` on first call.
///
/// Later calls install nothing and report the format of the first call.
pub fn initialise(config: &BackendConfig) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| {
            let subscriber = build(config, io::stderr, io::stderr().is_terminal())?;
            tracing::subscriber::set_global_default(subscriber)
                .map_err(TelemetryError::Subscriber)?;
            Ok(config.log_format())
        })
        .map(|format| TelemetryHandle { format: *format })
}

/// Builds the subscriber [`initialise`] would install, writing to `writer`
/// without colour codes.
pub fn subscriber_for<W>(
    config: &BackendConfig,
    writer: W,
) -> Result<BoxedSubscriber, TelemetryError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    build(config, writer, false)
}

fn build<W>(
    config: &BackendConfig,
    writer: W,
    ansi: bool,
) -> Result<BoxedSubscriber, TelemetryError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let builder = fmt::Subscriber::builder()
        .with_env_filter(log_filter(config)?)
        .with_target(true)
        .with_level(true)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    })
}

/// Blank directives fall back to the default filter.
fn log_filter(config: &BackendConfig) -> Result<EnvFilter, TelemetryError> {
    let configured = config.log_filter().trim();
    let directives = if configured.is_empty() {
        default_log_filter()
    } else {
        configured
    };
    EnvFilter::try_new(directives).map_err(|error| TelemetryError::Filter {
        directives: directives.to_owned(),
        reason: error.to_string(),
    })
}
