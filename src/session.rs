//! Browser session management
//!
//! [`SessionManager`] owns one process per engine for the duration of a run.
//! A [`Session`] is one (test × engine) execution: a fresh, deterministic
//! browsing context plus the interpreter's [`ExecutionContext`].

use crate::coverage::CoverageEntry;
use crate::driver::{BrowserProcess, ContextOptions, Driver, Page};
use crate::interpreter::{self, ExecutionContext, StepEffect, StepOptions};
use crate::step::{ColorScheme, Step, ViewportDescriptor};
use crate::{EngineKind, Error, Result, RunOptions, Viewport};
use image::RgbaImage;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LOCALE: &str = "en-US";
pub const TIMEZONE: &str = "America/Los_Angeles";

/// Headers sent with every request to neutralize IP- and language-based UI
/// variance
pub const EXTRA_HEADERS: [(&str, &str); 2] = [("X-Forwarded-For", "8.8.8.8"), ("Accept-Language", "en-US,en;q=0.5")];

/// Options for a fresh context with every determinism measure applied.
pub fn context_options(viewport: Viewport, touch: bool, timeout: Duration) -> ContextOptions {
    ContextOptions {
        viewport,
        touch,
        locale: LOCALE.to_string(),
        timezone: TIMEZONE.to_string(),
        color_scheme: ColorScheme::Light,
        extra_headers: EXTRA_HEADERS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
        timeout,
    }
}

/// One long-lived browser process per engine
pub struct SessionManager {
    processes: Vec<Arc<dyn BrowserProcess>>,
    closed: AtomicBool,
}

impl SessionManager {
    /// Launch every engine. If one fails, the ones already running are shut
    /// down before the error is returned.
    pub fn start(driver: &dyn Driver, engines: &[EngineKind]) -> Result<Self> {
        let mut processes: Vec<Arc<dyn BrowserProcess>> = Vec::with_capacity(engines.len());
        for engine in engines {
            match driver.launch(*engine) {
                Ok(process) => {
                    info!("Launched {}", engine);
                    processes.push(process);
                }
                Err(e) => {
                    for process in &processes {
                        if let Err(close_err) = process.close() {
                            warn!("Failed to close {}: {}", process.engine(), close_err);
                        }
                    }
                    return Err(Error::Driver(format!("unable to launch {}: {}", engine, e)));
                }
            }
        }
        Ok(Self {
            processes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn process(&self, engine: EngineKind) -> Option<Arc<dyn BrowserProcess>> {
        self.processes.iter().find(|p| p.engine() == engine).cloned()
    }

    pub fn engines(&self) -> Vec<EngineKind> {
        self.processes.iter().map(|p| p.engine()).collect()
    }

    /// Close every process. Only the first call does anything.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_err = None;
        for process in &self.processes {
            match process.close() {
                Ok(()) => info!("Closed {}", process.engine()),
                Err(e) => {
                    warn!("Failed to close {}: {}", process.engine(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Fixed-interval retry bounded by an overall deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

    pub fn new(deadline: Duration) -> Self {
        Self {
            delay: Self::DEFAULT_DELAY,
            deadline,
        }
    }

    /// Navigate to `url` with `attempt` until it succeeds or the deadline
    /// passes; the last failure is reported as a navigation error.
    pub fn navigate<F>(&self, url: &str, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match attempt() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if started.elapsed() + self.delay > self.deadline {
                        return Err(Error::Navigation {
                            url: url.to_string(),
                            attempts,
                            message: e.to_string(),
                        });
                    }
                    debug!("Navigation to {} failed (attempt {}): {}", url, attempts, e);
                    std::thread::sleep(self.delay);
                }
            }
        }
    }
}

/// How a viewport descriptor is applied to a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportTransition {
    Unchanged,
    /// Resize the live context
    Resize(Viewport),
    /// Touch capability changed: dispose of the context and open a new one
    Recreate { viewport: Viewport, touch: bool },
}

impl ViewportTransition {
    pub fn between(ctx: &ExecutionContext, descriptor: &ViewportDescriptor) -> Self {
        let viewport = descriptor.size();
        if descriptor.touch != ctx.touch {
            ViewportTransition::Recreate { viewport, touch: descriptor.touch }
        } else if viewport != ctx.viewport {
            ViewportTransition::Resize(viewport)
        } else {
            ViewportTransition::Unchanged
        }
    }
}

/// Run-wide settings every session shares
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub viewport: Viewport,
    pub step_timeout: Duration,
    pub coverage: bool,
    pub page_error_ignore: Vec<String>,
    pub retry: RetryPolicy,
}

impl From<&RunOptions> for SessionConfig {
    fn from(opts: &RunOptions) -> Self {
        Self {
            base_url: opts.base_url.clone(),
            viewport: opts.viewport,
            step_timeout: opts.step_timeout(),
            coverage: opts.coverage,
            page_error_ignore: opts.page_error_ignore.clone(),
            retry: RetryPolicy::new(opts.step_timeout()),
        }
    }
}

impl SessionConfig {
    pub fn is_ignored(&self, message: &str) -> bool {
        self.page_error_ignore.iter().any(|pattern| message.contains(pattern.as_str()))
    }

    fn step_options(&self) -> StepOptions {
        StepOptions {
            base_url: self.base_url.clone(),
            step_timeout: self.step_timeout,
        }
    }
}

/// One (test × engine) execution
pub struct Session {
    process: Arc<dyn BrowserProcess>,
    config: Arc<SessionConfig>,
    page: Option<Box<dyn Page>>,
    ctx: ExecutionContext,
    coverage: Vec<CoverageEntry>,
}

impl Session {
    /// Open a fresh context and navigate to the base URL.
    pub fn open(process: Arc<dyn BrowserProcess>, config: Arc<SessionConfig>) -> Result<Self> {
        let ctx = ExecutionContext::new(config.viewport);
        let mut session = Self {
            process,
            config,
            page: None,
            ctx,
            coverage: Vec::new(),
        };
        session.open_context()?;
        Ok(session)
    }

    pub fn engine(&self) -> EngineKind {
        self.process.engine()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn page(&self) -> Result<&dyn Page> {
        self.page
            .as_deref()
            .ok_or_else(|| Error::SessionCrash("the page is no longer available".into()))
    }

    /// Replace the current context (if any) with a new one built from the
    /// execution context's viewport and touch mode.
    fn open_context(&mut self) -> Result<()> {
        self.dispose_page()?;

        let options = context_options(self.ctx.viewport, self.ctx.touch, self.config.step_timeout);
        let page = self.process.new_page(&options)?;
        if self.config.coverage && !page.start_coverage()? {
            debug!("{} does not collect coverage", self.engine());
        }
        let page = self.page.insert(page);

        let url = self.config.base_url.clone();
        let timeout = self.config.step_timeout;
        self.config.retry.navigate(&url, || page.goto(&url, timeout))
    }

    fn dispose_page(&mut self) -> Result<()> {
        if let Some(page) = self.page.take() {
            if self.config.coverage {
                self.coverage.extend(page.stop_coverage()?);
            }
            page.close()?;
        }
        Ok(())
    }

    /// Run one step, apply its effect and surface any page failure.
    pub fn run_step(&mut self, step: &Step) -> Result<()> {
        let effect = interpreter::run_step(self.page()?, &self.ctx, step, &self.config.step_options())?;
        match effect {
            StepEffect::None => {}
            StepEffect::Selector(selector) => self.ctx.selector = Some(selector),
            StepEffect::Viewport(descriptor) => self.apply_viewport(&descriptor)?,
        }
        self.check_failures()
    }

    pub fn apply_viewport(&mut self, descriptor: &ViewportDescriptor) -> Result<()> {
        self.ctx.full_page = descriptor.full_page;
        match ViewportTransition::between(&self.ctx, descriptor) {
            ViewportTransition::Unchanged => Ok(()),
            ViewportTransition::Resize(viewport) => {
                self.page()?.set_viewport(viewport)?;
                self.ctx.viewport = viewport;
                Ok(())
            }
            ViewportTransition::Recreate { viewport, touch } => {
                debug!("Recreating {} context (touch: {})", self.engine(), touch);
                self.ctx.viewport = viewport;
                self.ctx.touch = touch;
                self.open_context()
            }
        }
    }

    /// Drain failures recorded by the page hooks. Ignore-listed ones are
    /// logged; the first other one becomes the error.
    pub fn check_failures(&self) -> Result<()> {
        let page = self.page()?;
        while let Some(failure) = page.take_failure() {
            if self.config.is_ignored(failure.message()) {
                warn!("Ignoring page error on {}: {}", self.engine(), failure.message());
                continue;
            }
            return Err(failure.into_error());
        }
        Ok(())
    }

    /// Screenshot of the viewport, or of the whole page in full-page mode.
    pub fn capture(&self) -> Result<RgbaImage> {
        self.check_failures()?;
        crate::screenshot::capture(self.page()?, self.ctx.full_page)
    }

    /// Close the context and return the coverage it collected.
    pub fn close(mut self) -> Result<Vec<CoverageEntry>> {
        self.dispose_page()?;
        Ok(std::mem::take(&mut self.coverage))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close() {
                warn!("Failed to close {} page: {}", self.process.engine(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::{Action, ScriptedDriver};
    use crate::driver::PageFailure;

    fn config(step_timeout: Duration) -> Arc<SessionConfig> {
        let opts = RunOptions {
            base_url: "http://app".into(),
            viewport: Viewport { width: 100, height: 80 },
            step_timeout_ms: step_timeout.as_millis() as u64,
            ..Default::default()
        };
        let mut config = SessionConfig::from(&opts);
        config.retry.delay = Duration::from_millis(10);
        Arc::new(config)
    }

    #[test]
    fn transition_is_a_function_of_changed_fields() {
        let ctx = ExecutionContext::new(Viewport { width: 100, height: 80 });
        let same = ViewportDescriptor { width: 100, height: 80, touch: false, full_page: true };
        assert_eq!(ViewportTransition::between(&ctx, &same), ViewportTransition::Unchanged);

        let resize = ViewportDescriptor { width: 50, ..same };
        assert_eq!(
            ViewportTransition::between(&ctx, &resize),
            ViewportTransition::Resize(Viewport { width: 50, height: 80 })
        );

        let touch = ViewportDescriptor { touch: true, ..same };
        assert_eq!(
            ViewportTransition::between(&ctx, &touch),
            ViewportTransition::Recreate { viewport: Viewport { width: 100, height: 80 }, touch: true }
        );
    }

    #[test]
    fn retry_gives_up_after_the_deadline() {
        let policy = RetryPolicy { delay: Duration::from_millis(5), deadline: Duration::from_millis(30) };
        let mut calls = 0;
        let err = policy
            .navigate("http://app", || {
                calls += 1;
                Err(Error::Driver("refused".into()))
            })
            .unwrap_err();
        match err {
            Error::Navigation { attempts, message, .. } => {
                assert_eq!(attempts, calls);
                assert!(attempts > 1);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn retry_succeeds_once_the_server_answers() {
        let policy = RetryPolicy { delay: Duration::from_millis(1), deadline: Duration::from_secs(5) };
        let mut calls = 0;
        policy
            .navigate("http://app", || {
                calls += 1;
                if calls < 3 {
                    Err(Error::Driver("refused".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn contexts_are_deterministic() {
        let opts = context_options(Viewport::default(), false, Duration::from_secs(1));
        assert_eq!(opts.locale, "en-US");
        assert_eq!(opts.timezone, "America/Los_Angeles");
        assert_eq!(opts.color_scheme, ColorScheme::Light);
        assert_eq!(opts.extra_headers["X-Forwarded-For"], "8.8.8.8");
        assert_eq!(opts.extra_headers["Accept-Language"], "en-US,en;q=0.5");
    }

    #[test]
    fn manager_cleans_up_after_a_failed_launch() {
        let driver = ScriptedDriver::new().with_unavailable_engine(EngineKind::Webkit);
        let err = SessionManager::start(&driver, &[EngineKind::Chromium, EngineKind::Firefox, EngineKind::Webkit]);
        assert!(err.is_err());
        assert_eq!(driver.closed(), vec![EngineKind::Chromium, EngineKind::Firefox]);
    }

    #[test]
    fn manager_shuts_down_once() {
        let driver = ScriptedDriver::new();
        let manager = SessionManager::start(&driver, &[EngineKind::Chromium]).unwrap();
        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        drop(manager);
        assert_eq!(driver.closed(), vec![EngineKind::Chromium]);
    }

    #[test]
    fn touch_change_recreates_the_context() {
        let driver = ScriptedDriver::new();
        let manager = SessionManager::start(&driver, &[EngineKind::Chromium]).unwrap();
        let process = manager.process(EngineKind::Chromium).unwrap();
        let mut session = Session::open(process, config(Duration::from_secs(1))).unwrap();

        session.run_step(&Step::Viewport("60x40".into())).unwrap();
        assert_eq!(session.context().viewport, Viewport { width: 60, height: 40 });
        session.run_step(&Step::Viewport("60x40t".into())).unwrap();
        assert!(session.context().touch);
        assert_eq!(driver.open_pages(), 1);
        session.close().unwrap();
        assert_eq!(driver.open_pages(), 0);

        let contexts: Vec<_> = driver
            .actions()
            .into_iter()
            .filter_map(|(_, a)| match a {
                Action::NewContext(o) => Some((o.viewport, o.touch)),
                _ => None,
            })
            .collect();
        assert_eq!(
            contexts,
            vec![
                (Viewport { width: 100, height: 80 }, false),
                (Viewport { width: 60, height: 40 }, true),
            ]
        );
    }

    #[test]
    fn ignore_listed_failures_are_swallowed() {
        let driver = ScriptedDriver::new()
            .with_page_failure(PageFailure::RequestFailed("GET /a net::ERR_ABORTED".into()))
            .with_page_failure(PageFailure::Script("TypeError: x is undefined".into()));
        let manager = SessionManager::start(&driver, &[EngineKind::Chromium]).unwrap();
        let session = Session::open(manager.process(EngineKind::Chromium).unwrap(), config(Duration::from_secs(1)))
            .unwrap();
        assert!(matches!(session.check_failures(), Err(Error::PageScript(_))));
        session.check_failures().unwrap();
    }

    #[test]
    fn navigation_failures_are_retried_until_the_deadline() {
        let driver = ScriptedDriver::new().with_navigation_failures(100);
        let manager = SessionManager::start(&driver, &[EngineKind::Firefox]).unwrap();
        let err = Session::open(manager.process(EngineKind::Firefox).unwrap(), config(Duration::from_millis(50)))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Navigation { .. }));
        assert!(driver.navigation_attempts() > 1);
        assert_eq!(driver.open_pages(), 0);
    }
}
