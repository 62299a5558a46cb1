//! Structured reporting for backend assembly events.

use std::sync::Arc;

use crate::assembler::{AssembleError, AssemblySummary, Stage};

/// Observer notified as the assembler moves through its stages.
pub trait AssemblyReporter: Send + Sync {
    /// Invoked before options are parsed.
    fn assembly_starting(&self);

    /// Invoked before a stage runs.
    fn stage_starting(&self, stage: Stage);

    /// Invoked after a stage succeeds.
    fn stage_completed(&self, stage: Stage);

    /// Invoked once when assembly fails.
    fn assembly_failed(&self, error: &AssembleError);

    /// Invoked once when the backend is ready.
    fn assembly_succeeded(&self, summary: &AssemblySummary);
}

impl<T> AssemblyReporter for Arc<T>
where
    T: AssemblyReporter + ?Sized,
{
    fn assembly_starting(&self) {
        (**self).assembly_starting();
    }

    fn stage_starting(&self, stage: Stage) {
        (**self).stage_starting(stage);
    }

    fn stage_completed(&self, stage: Stage) {
        (**self).stage_completed(stage);
    }

    fn assembly_failed(&self, error: &AssembleError) {
        (**self).assembly_failed(error);
    }

    fn assembly_succeeded(&self, summary: &AssemblySummary) {
        (**self).assembly_succeeded(summary);
    }
}

/// Default reporter that records assembly events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredAssemblyReporter;

impl StructuredAssemblyReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AssemblyReporter for StructuredAssemblyReporter {
    fn assembly_starting(&self) {
        tracing::info!(
            target: "replistore::health",
            event = "assembly_starting",
            "assembling replicated backend"
        );
    }

    fn stage_starting(&self, stage: Stage) {
        tracing::debug!(
            target: "replistore::health",
            event = "stage_starting",
            stage = %stage,
            "starting stage"
        );
    }

    fn stage_completed(&self, stage: Stage) {
        tracing::debug!(
            target: "replistore::health",
            event = "stage_completed",
            stage = %stage,
            "stage completed"
        );
    }

    fn assembly_failed(&self, error: &AssembleError) {
        tracing::error!(
            target: "replistore::health",
            event = "assembly_failed",
            stage = %error.stage(),
            error = %error,
            "backend assembly failed"
        );
    }

    fn assembly_succeeded(&self, summary: &AssemblySummary) {
        tracing::info!(
            target: "replistore::health",
            event = "assembly_succeeded",
            driver = %summary.driver_name,
            driver_built = summary.driver_built,
            peers_added = summary.peers_added,
            migration = ?summary.migration,
            "replicated backend ready"
        );
    }
}
