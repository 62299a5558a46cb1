use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection pool limits forwarded to the generic SQL layer.
///
/// Zero means "use the driver default" for every field.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Idle connections kept open.
    pub max_idle: u32,
    /// Upper bound on open connections.
    pub max_open: u32,
    /// Seconds before a connection is recycled.
    pub max_lifetime_secs: u64,
}

impl ConnectionPoolConfig {
    /// Lifetime as a [`Duration`], or `None` when unlimited.
    #[must_use]
    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_secs > 0).then(|| Duration::from_secs(self.max_lifetime_secs))
    }
}
