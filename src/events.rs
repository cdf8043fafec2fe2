//! Events emitted to the caller of a run

use crate::coverage::CoverageReport;
use crate::outcome::{RunSummary, TestState};
use crate::{EngineKind, Error};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub type EventSender = UnboundedSender<RunEvent>;
pub type EventReceiver = UnboundedReceiver<RunEvent>;

/// Everything a run reports upward
#[derive(Debug)]
pub enum RunEvent {
    /// Number of tests about to be scheduled
    Started { count: usize },
    /// One test changed state
    Progress(Progress),
    /// A failure, flushed as soon as it happens
    Error(FailureReport),
    /// Coverage processing state
    Coverage(CoverageEvent),
    /// Final counters
    Done(RunSummary),
}

/// A state change of one test
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Position of the test in the map
    pub id: usize,
    pub title: String,
    pub state: TestState,
    /// Set when an existing baseline was overwritten
    pub force: bool,
    /// Time since the test was dispatched; `None` while running
    pub elapsed: Option<Duration>,
}

/// Context for a failure
#[derive(Debug)]
pub struct FailureReport {
    /// `(id, title)` of the test, absent for run-level errors
    pub test: Option<(usize, String)>,
    pub engine: Option<EngineKind>,
    pub error: Error,
}

impl FailureReport {
    pub fn diff_png(&self) -> Option<&[u8]> {
        self.error.diff_png()
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.test, self.engine) {
            (Some((_, title)), Some(engine)) => write!(f, "[{}] {}: {}", engine, title, self.error),
            (Some((_, title)), None) => write!(f, "{}: {}", title, self.error),
            _ => write!(f, "{}", self.error),
        }
    }
}

#[derive(Debug)]
pub enum CoverageEvent {
    Running,
    Done(CoverageReport),
}

/// Send without caring whether the receiver is still listening.
pub(crate) fn emit(tx: &EventSender, event: RunEvent) {
    let _ = tx.send(event);
}
