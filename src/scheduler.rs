//! Scheduler and aggregator
//!
//! [`Runner::run`] admits tests through a semaphore, fans each admitted test
//! out to every engine on blocking workers, and folds the per-engine
//! outcomes back into one progress event per test.

use crate::baseline::{BaselineLedger, ScreenshotIdentity};
use crate::coverage::{self, CoverageEntry, CoverageProcessor, CoverageReport};
use crate::diff;
use crate::driver::Driver;
use crate::events::{emit, CoverageEvent, EventSender, FailureReport, Progress, RunEvent};
use crate::map::{Test, TestMap};
use crate::outcome::{EngineOutcome, RunSummary, TestAggregate, TestState};
use crate::screenshot;
use crate::session::{Session, SessionConfig, SessionManager};
use crate::{EngineKind, Error, Result, RunOptions};
use futures::future::join_all;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

/// Per-test reducers keyed by test id, plus the run counters
#[derive(Debug, Default)]
pub struct Aggregator {
    tests: HashMap<usize, TestAggregate>,
    summary: RunSummary,
}

impl Aggregator {
    /// Count a test that never runs.
    pub fn skip(&mut self, id: usize, title: String) -> Progress {
        self.summary.record(TestState::Skipped, false);
        Progress { id, title, state: TestState::Skipped, force: false, elapsed: None }
    }

    /// Start tracking a test; returns its `Running` event.
    pub fn dispatch(&mut self, id: usize, title: String, engines: usize) -> Progress {
        let aggregate = TestAggregate::dispatch(id, title, engines);
        let event = aggregate.running_event();
        self.tests.insert(id, aggregate);
        event
    }

    /// Record one engine's outcome. Once every engine of the test has
    /// reported, the test is counted and its consolidated event returned.
    pub fn record(&mut self, id: usize, engine: EngineKind, outcome: EngineOutcome) -> Option<Progress> {
        let progress = self.tests.get_mut(&id)?.record(engine, outcome)?;
        self.tests.remove(&id);
        self.summary.record(progress.state, progress.force);
        Some(progress)
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn in_flight(&self) -> usize {
        self.tests.len()
    }
}

/// Run-scoped state shared by every execution
struct RunState {
    options: RunOptions,
    config: Arc<SessionConfig>,
    ledger: BaselineLedger,
    sessions: SessionManager,
    aggregator: Mutex<Aggregator>,
    coverage: Mutex<Vec<CoverageEntry>>,
    tx: EventSender,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Entry point for running a test map
pub struct Runner {
    options: RunOptions,
    driver: Arc<dyn Driver>,
    coverage: Option<Arc<dyn CoverageProcessor>>,
}

impl Runner {
    pub fn new(options: RunOptions, driver: Arc<dyn Driver>) -> Self {
        Self { options, driver, coverage: None }
    }

    /// Processor that turns raw coverage into a report.
    pub fn with_coverage(mut self, processor: Arc<dyn CoverageProcessor>) -> Self {
        self.coverage = Some(processor);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every test of `map`, reporting through `tx`.
    ///
    /// Test-level failures are reported as events and counted; only
    /// configuration and startup errors end the run early with `Err`.
    pub async fn run(&self, map: &TestMap, tx: EventSender) -> Result<RunSummary> {
        let mut options = self.options.clone();
        if let Err(e) = options.validate() {
            return Err(run_failure(&tx, e));
        }

        let mut aggregator = Aggregator::default();
        let mut runnable: Vec<(usize, &Test)> = Vec::new();
        for (id, test) in map.iter().enumerate() {
            if test.is_runnable() && test.is_targeted(options.target.as_deref()) {
                runnable.push((id, test));
            } else {
                let event = aggregator.skip(id, test.display_name(&options.base_url));
                emit(&tx, RunEvent::Progress(event));
            }
        }

        if runnable.is_empty() {
            let summary = aggregator.summary().clone();
            info!("Nothing to run ({} skipped)", summary.skipped);
            emit(&tx, RunEvent::Done(summary.clone()));
            return Ok(summary);
        }

        let ledger = BaselineLedger::scan(&options.screenshots_dir).map_err(|e| run_failure(&tx, e))?;

        let driver = self.driver.clone();
        let engines = options.engines.clone();
        let sessions = tokio::task::spawn_blocking(move || SessionManager::start(driver.as_ref(), &engines))
            .await
            .map_err(|e| Error::Other(format!("browser launch task failed: {}", e)))
            .and_then(|r| r)
            .map_err(|e| run_failure(&tx, e))?;

        emit(&tx, RunEvent::Started { count: runnable.len() });

        let state = Arc::new(RunState {
            config: Arc::new(SessionConfig::from(&options)),
            options,
            ledger,
            sessions,
            aggregator: Mutex::new(aggregator),
            coverage: Mutex::new(Vec::new()),
            tx: tx.clone(),
        });

        let limiter = Semaphore::new(state.options.parallel);
        for round in 0..state.options.repeat {
            if state.options.repeat > 1 {
                info!("Run {} of {}", round + 1, state.options.repeat);
            }
            join_all(runnable.iter().map(|(id, test)| {
                let state = state.clone();
                let limiter = &limiter;
                async move {
                    let Ok(_permit) = limiter.acquire().await else {
                        return;
                    };
                    run_test(state, *id, test).await;
                }
            }))
            .await;
        }

        let closing = state.clone();
        match tokio::task::spawn_blocking(move || closing.sessions.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Browser shutdown failed: {}", e),
            Err(e) => warn!("Browser shutdown task failed: {}", e),
        }

        if state.options.coverage {
            self.process_coverage(&state);
        }

        let mut summary = lock(&state.aggregator).summary().clone();
        if state.options.target.is_none() {
            summary.unused_baselines = state.ledger.unused();
            if state.options.clean {
                match state.ledger.clean() {
                    Ok(removed) => {
                        info!("Removed {} unused baseline(s)", removed.len());
                        summary.cleaned = true;
                    }
                    Err(e) => emit(&tx, RunEvent::Error(FailureReport { test: None, engine: None, error: e })),
                }
            }
        }

        info!(
            "{} passed, {} updated, {} failed, {} skipped",
            summary.passed, summary.updated, summary.failed, summary.skipped
        );
        emit(&tx, RunEvent::Done(summary.clone()));
        Ok(summary)
    }

    fn process_coverage(&self, state: &RunState) {
        let tx = &state.tx;
        emit(tx, RunEvent::Coverage(CoverageEvent::Running));

        let entries = std::mem::take(&mut *lock(&state.coverage));
        let dir = &state.options.coverage_dir;
        let result = coverage::prepare_output_dir(dir).and_then(|()| match &self.coverage {
            Some(processor) => processor.process(&entries, dir, &state.options.coverage_exclude),
            None => write_raw_coverage(&entries, dir),
        });

        match result {
            Ok(report) => emit(tx, RunEvent::Coverage(CoverageEvent::Done(report))),
            Err(error) => emit(tx, RunEvent::Error(FailureReport { test: None, engine: None, error })),
        }
    }
}

/// Without a processor the raw entries are kept for later processing.
fn write_raw_coverage(entries: &[CoverageEntry], dir: &Path) -> Result<CoverageReport> {
    warn!("No coverage processor configured; writing {} raw entries", entries.len());
    std::fs::write(dir.join("raw.json"), serde_json::to_vec(entries)?)?;
    Ok(CoverageReport::default())
}

/// Report a run-level error and turn it into the configuration error the
/// run returns.
fn run_failure(tx: &EventSender, error: Error) -> Error {
    let message = match &error {
        Error::Configuration(m) => m.clone(),
        other => other.to_string(),
    };
    emit(tx, RunEvent::Error(FailureReport { test: None, engine: None, error }));
    Error::Configuration(message)
}

/// Run one test on every engine and release its consolidated event.
async fn run_test(state: Arc<RunState>, id: usize, test: &Test) {
    let title = test.display_name(&state.options.base_url);
    let identity = ScreenshotIdentity::for_test(test, state.options.title_based_screenshots);
    let engines = state.sessions.engines();

    let running = lock(&state.aggregator).dispatch(id, title.clone(), engines.len());
    emit(&state.tx, RunEvent::Progress(running));

    join_all(engines.into_iter().map(|engine| {
        let state = state.clone();
        let test = test.clone();
        let identity = identity.clone();
        let title = title.clone();
        async move {
            let worker = state.clone();
            let result = tokio::task::spawn_blocking(move || execute(&worker, engine, &test, &identity))
                .await
                .unwrap_or_else(|e| Err(Error::Other(format!("execution aborted: {}", e))));

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) => {
                    emit(
                        &state.tx,
                        RunEvent::Error(FailureReport { test: Some((id, title)), engine: Some(engine), error }),
                    );
                    EngineOutcome::Failed
                }
            };

            let consolidated = lock(&state.aggregator).record(id, engine, outcome);
            if let Some(progress) = consolidated {
                emit(&state.tx, RunEvent::Progress(progress));
            }
        }
    }))
    .await;
}

/// One (test × engine) execution, run on a blocking worker.
fn execute(state: &RunState, engine: EngineKind, test: &Test, identity: &ScreenshotIdentity) -> Result<EngineOutcome> {
    let process = state
        .sessions
        .process(engine)
        .ok_or_else(|| Error::Driver(format!("{} is not running", engine)))?;

    let baseline = state.ledger.path_for(identity, engine);
    state.ledger.mark_used(&baseline);

    let mut session = Session::open(process, state.config.clone())?;
    for step in &test.steps {
        session.run_step(step)?;
    }
    let outcome = settle(&session, &baseline, &state.options)?;

    let entries = session.close()?;
    if !entries.is_empty() {
        lock(&state.coverage).extend(entries);
    }
    Ok(outcome)
}

/// Compare against the baseline, or write it.
fn settle(session: &Session, baseline: &Path, options: &RunOptions) -> Result<EngineOutcome> {
    if !baseline.exists() {
        screenshot::save_png(&session.capture()?, baseline)?;
        info!("Captured new baseline {}", baseline.display());
        return Ok(EngineOutcome::Updated { forced: false });
    }

    if options.update && options.target.is_some() {
        screenshot::save_png(&session.capture()?, baseline)?;
        info!("Re-captured baseline {}", baseline.display());
        return Ok(EngineOutcome::Updated { forced: true });
    }

    let current = session.capture()?;
    let reference = screenshot::load_png(baseline)?;
    let result = diff::compare(&reference, &current, options.tolerance, options.antialiasing_tolerance)?;
    if result.same {
        return Ok(EngineOutcome::Passed);
    }

    let differences = result.differences.unwrap_or_default();
    if options.update {
        screenshot::save_png(&current, baseline)?;
        info!("Updated {} ({} differences)", baseline.display(), differences);
        return Ok(EngineOutcome::Updated { forced: true });
    }

    let diff_png = match &result.diff_image {
        Some(image) => screenshot::encode_png(image)?,
        None => Vec::new(),
    };
    Err(Error::Mismatch { differences, diff_png })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_counts_a_test_once() {
        let mut agg = Aggregator::default();
        let running = agg.dispatch(0, "Menu".into(), 3);
        assert_eq!(running.state, TestState::Running);
        assert_eq!(agg.in_flight(), 1);

        assert!(agg.record(0, EngineKind::Chromium, EngineOutcome::Passed).is_none());
        assert!(agg.record(0, EngineKind::Firefox, EngineOutcome::Updated { forced: false }).is_none());
        let done = agg.record(0, EngineKind::Webkit, EngineOutcome::Failed).unwrap();
        assert_eq!(done.state, TestState::Failed);
        assert_eq!(agg.in_flight(), 0);

        let s = agg.summary();
        assert_eq!((s.total, s.failed, s.passed, s.updated), (1, 1, 0, 0));
    }

    #[test]
    fn aggregator_ignores_unknown_tests() {
        let mut agg = Aggregator::default();
        assert!(agg.record(9, EngineKind::Chromium, EngineOutcome::Passed).is_none());
        assert!(agg.summary().is_empty());
    }

    #[test]
    fn repeats_accumulate_but_skips_do_not() {
        let mut agg = Aggregator::default();
        agg.skip(1, "empty".into());
        for _ in 0..2 {
            agg.dispatch(0, "t".into(), 1);
            agg.record(0, EngineKind::Chromium, EngineOutcome::Updated { forced: true });
        }
        let s = agg.summary();
        assert_eq!((s.total, s.updated, s.forced, s.skipped), (3, 2, 2, 1));
    }

    #[test]
    fn run_failures_become_configuration_errors() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err = run_failure(&tx, Error::Driver("no chrome".into()));
        assert!(err.is_fatal_to_run());
        match rx.try_recv().unwrap() {
            RunEvent::Error(report) => {
                assert!(report.test.is_none());
                assert!(matches!(report.error, Error::Driver(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
