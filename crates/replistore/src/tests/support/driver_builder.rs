//! Test driver builder: records the requests it receives and supports
//! injected failures.

use std::sync::{Arc, Mutex};

use replistore_config::NodeInfo;

use crate::driver::{Driver, DriverBuilder, DriverError, DriverRequest};
use crate::sql::SqliteDriver;

/// What the builder saw in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Membership visible through the request's node store.
    pub peers: Vec<NodeInfo>,
    /// Whether the dial function wraps connections in TLS.
    pub tls: bool,
}

/// Builder that hands out [`SqliteDriver`] and records each request.
#[derive(Clone, Default)]
pub struct RecordingDriverBuilder {
    state: Arc<Mutex<BuilderState>>,
}

impl RecordingDriverBuilder {
    /// Makes every later build fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        let mut state = self.state.lock().expect("builder state mutex poisoned");
        state.failure = Some(message.into());
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        let state = self.state.lock().expect("builder state mutex poisoned");
        state.requests.clone()
    }
}

impl DriverBuilder for RecordingDriverBuilder {
    fn build(&self, request: DriverRequest) -> Result<Arc<dyn Driver>, DriverError> {
        let peers = request
            .node_store
            .get(&request.context)
            .map_err(|error| DriverError::build_with_source("node store unavailable", error))?;
        let failure = {
            let mut state = self.state.lock().expect("builder state mutex poisoned");
            state.requests.push(RecordedRequest {
                peers,
                tls: request.dial.is_tls(),
            });
            state.failure.clone()
        };
        if let Some(message) = failure {
            return Err(DriverError::build(message));
        }
        Ok(Arc::new(SqliteDriver))
    }
}

#[derive(Default)]
struct BuilderState {
    requests: Vec<RecordedRequest>,
    failure: Option<String>,
}
