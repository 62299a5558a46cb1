//! Cluster membership storage and the start-up peer merge.
//!
//! The replicated driver consults a [`NodeStore`] to find peers and the
//! current leader. Membership is seeded once at start-up from the `peer`
//! entries of the data source name; ongoing churn is the driver's business.

use std::fs;
use std::io::{self, Write as IoWrite};
use std::sync::{Arc, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use replistore_config::{ConnectionOptions, NodeInfo};

/// Source of truth for cluster membership.
pub trait NodeStore: Send + Sync {
    /// Returns the current members in insertion order.
    fn get(&self, ctx: &CancellationToken) -> Result<Vec<NodeInfo>, NodeStoreError>;

    /// Replaces the member list.
    fn set(&self, ctx: &CancellationToken, nodes: Vec<NodeInfo>) -> Result<(), NodeStoreError>;
}

/// Errors raised by [`NodeStore`] implementations.
#[derive(Debug, Error)]
pub enum NodeStoreError {
    /// The caller's cancellation token fired.
    #[error("node store operation cancelled")]
    Cancelled,
    /// The membership file could not be read.
    #[error("failed to read node store '{path}': {source}")]
    Read {
        /// Membership file path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The membership file did not contain a valid node list.
    #[error("failed to parse node store '{path}': {source}")]
    Parse {
        /// Membership file path.
        path: Utf8PathBuf,
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },
    /// The membership file could not be written.
    #[error("failed to write node store '{path}': {source}")]
    Write {
        /// Membership file path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The node list could not be serialised.
    #[error("failed to encode node list: {0}")]
    Encode(#[source] serde_json::Error),
}

fn ensure_active(ctx: &CancellationToken) -> Result<(), NodeStoreError> {
    if ctx.is_cancelled() {
        Err(NodeStoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Membership held only in process memory.
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<Vec<NodeInfo>>,
}

impl InMemoryNodeStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get(&self, ctx: &CancellationToken) -> Result<Vec<NodeInfo>, NodeStoreError> {
        ensure_active(ctx)?;
        Ok(self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set(&self, ctx: &CancellationToken, nodes: Vec<NodeInfo>) -> Result<(), NodeStoreError> {
        ensure_active(ctx)?;
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = nodes;
        Ok(())
    }
}

/// Membership persisted as a JSON document.
///
/// The file is created with an empty list when absent, loaded once on open,
/// and rewritten atomically on every [`NodeStore::set`].
#[derive(Debug)]
pub struct FileNodeStore {
    path: Utf8PathBuf,
    nodes: RwLock<Vec<NodeInfo>>,
}

impl FileNodeStore {
    /// Opens the store at `path`, creating it when missing.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, NodeStoreError> {
        let path = path.into();
        let nodes = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| NodeStoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                write_atomic(&path, &[])?;
                Vec::new()
            }
            Err(source) => return Err(NodeStoreError::Read { path, source }),
        };

        Ok(Self {
            path,
            nodes: RwLock::new(nodes),
        })
    }

    /// Location of the membership document.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        self.path.as_path()
    }
}

impl NodeStore for FileNodeStore {
    fn get(&self, ctx: &CancellationToken) -> Result<Vec<NodeInfo>, NodeStoreError> {
        ensure_active(ctx)?;
        Ok(self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set(&self, ctx: &CancellationToken, nodes: Vec<NodeInfo>) -> Result<(), NodeStoreError> {
        ensure_active(ctx)?;
        let mut guard = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.path, &nodes)?;
        *guard = nodes;
        Ok(())
    }
}

fn write_atomic(path: &Utf8Path, nodes: &[NodeInfo]) -> Result<(), NodeStoreError> {
    let encoded = serde_json::to_vec_pretty(nodes).map_err(NodeStoreError::Encode)?;
    let write_error = |source: io::Error| NodeStoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent).map_err(write_error)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(write_error)?;
    temp_file.write_all(&encoded).map_err(write_error)?;
    temp_file
        .persist(path)
        .map_err(|error| write_error(error.error))?;
    Ok(())
}

/// Opens the store named by `peer-file`, or an in-memory one otherwise.
pub fn open_node_store(options: &ConnectionOptions) -> Result<Arc<dyn NodeStore>, NodeStoreError> {
    match options.peer_file() {
        Some(path) => Ok(Arc::new(FileNodeStore::open(path)?)),
        None => Ok(Arc::new(InMemoryNodeStore::new())),
    }
}

/// Appends `candidates` whose address is not yet in `store`.
///
/// Addresses are the only identity compared: a candidate that reuses a known
/// address under a different id is dropped. Existing entries keep their order
/// and are never removed; survivors are written with a single
/// [`NodeStore::set`] and only when there is at least one. Returns how many
/// entries were added.
pub fn add_peers(
    ctx: &CancellationToken,
    store: &dyn NodeStore,
    candidates: &[NodeInfo],
) -> Result<usize, NodeStoreError> {
    let existing = store.get(ctx)?;

    let mut additions: Vec<NodeInfo> = Vec::new();
    for candidate in candidates {
        let known = existing
            .iter()
            .chain(additions.iter())
            .any(|node| node.address == candidate.address);
        if !known {
            additions.push(candidate.clone());
        }
    }

    if additions.is_empty() {
        return Ok(0);
    }

    let added = additions.len();
    let mut merged = existing;
    merged.extend(additions);
    store.set(ctx, merged)?;
    Ok(added)
}
