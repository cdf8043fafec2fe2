//! Test lifecycle, per-engine outcome consolidation and run counters

use crate::events::Progress;
use crate::EngineKind;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

/// Lifecycle of one test
///
/// `Queued → Running → {Passed | Updated | Failed}`; `Skipped` is only
/// reachable from `Queued` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Queued,
    Running,
    Passed,
    Updated,
    Failed,
    Skipped,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestState::Passed | TestState::Updated | TestState::Failed | TestState::Skipped)
    }

    pub fn can_transition_to(&self, next: TestState) -> bool {
        match self {
            TestState::Queued => matches!(next, TestState::Running | TestState::Skipped),
            TestState::Running => matches!(next, TestState::Passed | TestState::Updated | TestState::Failed),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestState::Queued => "queued",
            TestState::Running => "running",
            TestState::Passed => "passed",
            TestState::Updated => "updated",
            TestState::Failed => "failed",
            TestState::Skipped => "skipped",
        }
    }
}

/// Terminal result of one (test × engine) execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    Passed,
    /// Baseline written; `forced` when an existing baseline was overwritten
    Updated { forced: bool },
    Failed,
}

/// Merge per-engine outcomes: any failure fails the test, otherwise any
/// update makes it updated, otherwise it passed. Returns the state and
/// whether any update was forced.
pub fn consolidate(outcomes: &[EngineOutcome]) -> (TestState, bool) {
    if outcomes.iter().any(|o| *o == EngineOutcome::Failed) {
        return (TestState::Failed, false);
    }
    let mut updated = false;
    let mut forced = false;
    for outcome in outcomes {
        if let EngineOutcome::Updated { forced: f } = outcome {
            updated = true;
            forced |= *f;
        }
    }
    if updated {
        (TestState::Updated, forced)
    } else {
        (TestState::Passed, false)
    }
}

/// Reducer for the engine outcomes of one dispatched test
#[derive(Debug)]
pub struct TestAggregate {
    pub id: usize,
    pub title: String,
    expected: usize,
    started: Instant,
    outcomes: Vec<(EngineKind, EngineOutcome)>,
    state: TestState,
}

impl TestAggregate {
    /// A test entering `Running`, expecting one outcome per engine.
    pub fn dispatch(id: usize, title: impl Into<String>, expected: usize) -> Self {
        Self {
            id,
            title: title.into(),
            expected,
            started: Instant::now(),
            outcomes: Vec::with_capacity(expected),
            state: TestState::Running,
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn running_event(&self) -> Progress {
        Progress {
            id: self.id,
            title: self.title.clone(),
            state: TestState::Running,
            force: false,
            elapsed: None,
        }
    }

    /// Record one engine's outcome; returns the consolidated event once every
    /// engine has reported. Later reports are ignored.
    pub fn record(&mut self, engine: EngineKind, outcome: EngineOutcome) -> Option<Progress> {
        if self.state.is_terminal() {
            return None;
        }
        self.outcomes.push((engine, outcome));
        if self.outcomes.len() < self.expected {
            return None;
        }

        let outcomes: Vec<EngineOutcome> = self.outcomes.iter().map(|(_, o)| *o).collect();
        let (state, force) = consolidate(&outcomes);
        debug_assert!(self.state.can_transition_to(state));
        self.state = state;
        Some(Progress {
            id: self.id,
            title: self.title.clone(),
            state,
            force,
            elapsed: Some(self.started.elapsed()),
        })
    }
}

/// Run-wide counters, computed after every test and repeat completed
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Updates that overwrote an existing baseline (subset of `updated`)
    pub forced: usize,
    /// Baselines on disk not referenced by this run (unfiltered runs only)
    pub unused_baselines: Vec<PathBuf>,
    /// Whether `unused_baselines` were deleted
    pub cleaned: bool,
}

impl RunSummary {
    /// Count one consolidated terminal state.
    pub fn record(&mut self, state: TestState, force: bool) {
        match state {
            TestState::Passed => self.passed += 1,
            TestState::Updated => {
                self.updated += 1;
                if force {
                    self.forced += 1;
                }
            }
            TestState::Failed => self.failed += 1,
            TestState::Skipped => self.skipped += 1,
            TestState::Queued | TestState::Running => return,
        }
        self.total += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn all_skipped(&self) -> bool {
        self.total > 0 && self.total == self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
