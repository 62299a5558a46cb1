use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Client certificate material used to authenticate to cluster peers.
///
/// Both paths must be set together; the assembler rejects a half-filled pair.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain. The same file seeds the peer trust store.
    pub cert_file: Option<Utf8PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<Utf8PathBuf>,
    /// Name verified against peer certificates instead of the dialled host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Builds a configuration with both halves of the key pair.
    #[must_use]
    pub fn with_key_pair(cert_file: impl Into<Utf8PathBuf>, key_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cert_file: Some(cert_file.into()),
            key_file: Some(key_file.into()),
            server_name: None,
        }
    }

    /// Certificate path, ignoring empty strings.
    #[must_use]
    pub fn cert_file(&self) -> Option<&Utf8Path> {
        non_empty(self.cert_file.as_deref())
    }

    /// Key path, ignoring empty strings.
    #[must_use]
    pub fn key_file(&self) -> Option<&Utf8Path> {
        non_empty(self.key_file.as_deref())
    }
}

fn non_empty(path: Option<&Utf8Path>) -> Option<&Utf8Path> {
    path.filter(|path| !path.as_str().is_empty())
}
