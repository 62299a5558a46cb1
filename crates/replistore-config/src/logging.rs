use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output encoding for backend log events.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, flattened for log shippers.
    #[default]
    Json,
    /// Single line text for interactive terminals.
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;
