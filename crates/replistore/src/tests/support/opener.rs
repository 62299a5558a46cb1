//! Stand-in for the generic SQL layer: opens the store through the registry
//! and records the policy it is given.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use replistore_config::ConnectionPoolConfig;

use crate::assembler::{OpenError, OpenedStore, PolicyTarget, SqlBackendOpener};
use crate::driver::DriverRegistry;
use crate::policy::WritePolicy;

use super::KINE_SCHEMA;

/// Backend handle produced by [`SchemaOpener`].
#[derive(Debug)]
pub struct RecordingBackend {
    /// Driver the store was opened through.
    pub driver_name: String,
    /// Data source name after option stripping.
    pub dsn: String,
    /// Pool limits passed by the assembler.
    pub pool: ConnectionPoolConfig,
    /// Policy installed by the assembler, if any.
    pub policy: Option<WritePolicy>,
}

impl PolicyTarget for RecordingBackend {
    fn apply_policy(&mut self, policy: WritePolicy) {
        self.policy = Some(policy);
    }
}

/// Opener that ensures the `kine` table exists, like the generic layer does.
#[derive(Debug, Clone, Default)]
pub struct SchemaOpener {
    failure: Arc<Mutex<Option<String>>>,
}

impl SchemaOpener {
    /// Makes every later open fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().expect("opener mutex poisoned") = Some(message.into());
    }
}

impl SqlBackendOpener for SchemaOpener {
    type Backend = RecordingBackend;

    fn open(
        &self,
        ctx: &CancellationToken,
        registry: &DriverRegistry,
        driver_name: &str,
        dsn: &str,
        pool: &ConnectionPoolConfig,
    ) -> Result<OpenedStore<Self::Backend>, OpenError> {
        if let Some(message) = self.failure.lock().expect("opener mutex poisoned").clone() {
            return Err(OpenError::backend(message));
        }

        let mut connection = registry.connect(ctx, driver_name, dsn)?;
        let mut schema = connection
            .begin(ctx)
            .map_err(|error| OpenError::backend(error.to_string()))?;
        schema
            .execute(KINE_SCHEMA, &[])
            .map_err(|error| OpenError::backend(error.to_string()))?;
        schema
            .commit()
            .map_err(|error| OpenError::backend(error.to_string()))?;

        Ok(OpenedStore {
            backend: RecordingBackend {
                driver_name: driver_name.to_owned(),
                dsn: dsn.to_owned(),
                pool: *pool,
                policy: None,
            },
            connection,
        })
    }
}
