//! Test double for [`AssemblyReporter`] that records events for assertions.

use std::sync::Mutex;

use crate::assembler::{AssembleError, AssemblySummary, Stage};
use crate::health::AssemblyReporter;

/// Assembly events tracked during tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyEvent {
    /// Assembly started.
    Starting,
    /// A stage began.
    StageStarting(Stage),
    /// A stage finished successfully.
    StageCompleted(Stage),
    /// Assembly failed in the given stage.
    Failed(Stage),
    /// Assembly finished.
    Succeeded(AssemblySummary),
}

/// Records assembly events in arrival order.
#[derive(Debug, Default)]
pub struct RecordingAssemblyReporter {
    events: Mutex<Vec<AssemblyEvent>>,
}

impl RecordingAssemblyReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<AssemblyEvent> {
        self.events
            .lock()
            .expect("assembly reporter mutex poisoned")
            .clone()
    }

    /// Stages that started, in order.
    #[must_use]
    pub fn started_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                AssemblyEvent::StageStarting(stage) => Some(stage),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: AssemblyEvent) {
        self.events
            .lock()
            .expect("assembly reporter mutex poisoned")
            .push(event);
    }
}

impl AssemblyReporter for RecordingAssemblyReporter {
    fn assembly_starting(&self) {
        self.record(AssemblyEvent::Starting);
    }

    fn stage_starting(&self, stage: Stage) {
        self.record(AssemblyEvent::StageStarting(stage));
    }

    fn stage_completed(&self, stage: Stage) {
        self.record(AssemblyEvent::StageCompleted(stage));
    }

    fn assembly_failed(&self, error: &AssembleError) {
        self.record(AssemblyEvent::Failed(error.stage()));
    }

    fn assembly_succeeded(&self, summary: &AssemblySummary) {
        self.record(AssemblyEvent::Succeeded(summary.clone()));
    }
}
