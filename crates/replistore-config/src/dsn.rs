//! Connection-string extensions understood by the replicated backend.
//!
//! The backend accepts the same data source name as the underlying SQL store
//! plus two query keys of its own:
//!
//! - `peer=ID:IP:PORT`, repeatable, seeds the cluster membership;
//! - `peer-file=PATH` names the file that persists cluster membership.
//!
//! Both keys are consumed here. Every other key/value pair is handed to the
//! underlying store untouched.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::form_urlencoded;

const PEER_KEY: &str = "peer";
const PEER_FILE_KEY: &str = "peer-file";

/// Identity and network address of one member of the replicated cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct NodeInfo {
    /// Cluster-unique node identifier.
    #[serde(rename = "ID")]
    pub id: u64,
    /// `host:port` the node listens on.
    #[serde(rename = "Address")]
    pub address: String,
}

impl NodeInfo {
    /// Builds a descriptor from its parts.
    #[must_use]
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}@{}", self.id, self.address)
    }
}

/// Backend settings extracted from a data source name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Peers listed with `peer=` in the order they appeared.
    pub peers: Vec<NodeInfo>,
    /// Membership file named with `peer-file=`, if any.
    pub peer_file: Option<Utf8PathBuf>,
    /// Name of a driver the embedding application registered up front.
    ///
    /// Never populated from the query string.
    pub driver_name: Option<String>,
    /// Data source name with the recognised keys removed.
    pub dsn: String,
}

impl ConnectionOptions {
    /// Parses `input`, removing the backend's own query keys.
    ///
    /// A string without `?` is returned as-is with no peers. Unrecognised keys
    /// are re-encoded after the base; their relative order is kept but their
    /// percent-encoding may be normalised.
    pub fn parse(input: &str) -> Result<Self, OptionsError> {
        let Some((base, query)) = input.split_once('?') else {
            return Ok(Self {
                dsn: input.to_owned(),
                ..Self::default()
            });
        };

        validate_query(query)?;
        let mut options = Self::default();
        let mut passthrough: Vec<(String, String)> = Vec::new();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                PEER_KEY => options.peers.push(parse_peer(&value)?),
                PEER_FILE_KEY => {
                    // First occurrence wins; an empty value means "no file".
                    if options.peer_file.is_none() && !value.is_empty() {
                        options.peer_file = Some(Utf8PathBuf::from(value.as_ref()));
                    }
                }
                _ => passthrough.push((key.into_owned(), value.into_owned())),
            }
        }

        options.dsn = if passthrough.is_empty() {
            base.to_owned()
        } else {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&passthrough)
                .finish();
            format!("{base}?{encoded}")
        };

        Ok(options)
    }

    /// Marks the options as targeting a driver registered by the caller.
    #[must_use]
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = Some(name.into()).filter(|name: &String| !name.is_empty());
        self
    }

    /// Returns the membership file path, if one was configured.
    #[must_use]
    pub fn peer_file(&self) -> Option<&Utf8Path> {
        self.peer_file.as_deref()
    }
}

impl FromStr for ConnectionOptions {
    type Err = OptionsError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

/// Rejects what a strict form decoder would: stray `%` escapes and `;`
/// separators. `form_urlencoded` itself decodes both leniently.
fn validate_query(query: &str) -> Result<(), OptionsError> {
    if query.contains(';') {
        return Err(OptionsError::Query {
            reason: "invalid semicolon separator in query".to_owned(),
        });
    }
    let bytes = query.as_bytes();
    for (index, _) in query.match_indices('%') {
        let well_formed = bytes
            .get(index + 1..index + 3)
            .is_some_and(|digits| digits.iter().all(u8::is_ascii_hexdigit));
        if !well_formed {
            let escape = query
                .get(index..)
                .map(|rest| rest.chars().take(3).collect::<String>())
                .unwrap_or_default();
            return Err(OptionsError::Query {
                reason: format!("invalid URL escape \"{escape}\""),
            });
        }
    }
    Ok(())
}

fn parse_peer(value: &str) -> Result<NodeInfo, OptionsError> {
    let mut segments = value.splitn(3, ':');
    let (Some(id), Some(host), Some(port)) = (segments.next(), segments.next(), segments.next())
    else {
        return Err(OptionsError::PeerFormat {
            value: value.to_owned(),
        });
    };

    let parsed = id.parse::<u64>().map_err(|source| OptionsError::PeerId {
        id: id.to_owned(),
        source,
    })?;

    Ok(NodeInfo::new(parsed, format!("{host}:{port}")))
}

/// Errors raised while extracting backend options from a data source name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// A `peer` value did not have three colon-separated segments.
    #[error("must be ID:IP:PORT format got: {value}")]
    PeerFormat {
        /// The offending `peer` value.
        value: String,
    },
    /// The query string is not valid form encoding.
    #[error("invalid query: {reason}")]
    Query {
        /// What the decoder objected to.
        reason: String,
    },
    /// The identifier segment of a `peer` value was not an unsigned integer.
    #[error("failed to parse {id}: {source}")]
    PeerId {
        /// The offending identifier segment.
        id: String,
        /// Integer parse failure.
        #[source]
        source: ParseIntError,
    },
}
