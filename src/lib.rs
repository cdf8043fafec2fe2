//! Visual-regression test runner
//!
//! Drives one or more browser engines through declarative test maps, captures
//! screenshots, compares them against stored baselines within a perceptual
//! tolerance, and reports pass/fail/update outcomes as a typed event stream.
//!
//! # Features
//!
//! - **Pluggable backends**: browser engines sit behind the [`driver::Driver`]
//!   seam; the CDP backend (feature `cdp`) drives headless Chrome and the
//!   [`driver::scripted`] backend renders deterministic synthetic pages.
//! - **Bounded concurrency**: tests are admitted through a global limiter and
//!   fanned out across every configured engine in parallel.
//! - **Perceptual diffs**: CIEDE2000 colour distance with anti-aliasing and
//!   caret tolerance, plus a composite diagnostic image on mismatch.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use visreg::{driver::scripted::ScriptedDriver, RunOptions, Runner, TestMap};
//!
//! # async fn demo() -> visreg::Result<()> {
//! let options = RunOptions {
//!     base_url: "http://localhost:8080".to_string(),
//!     ..Default::default()
//! };
//! let map = TestMap::load("visreg.map.json")?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let runner = Runner::new(options, Arc::new(ScriptedDriver::default()));
//! let summary = runner.run(&map, tx).await?;
//! while let Ok(event) = rx.try_recv() {
//!     println!("{:?}", event);
//! }
//! println!("{} passed, {} failed", summary.passed, summary.failed);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod baseline;
pub mod coverage;
pub mod diff;
pub mod driver;
pub mod events;
pub mod interpreter;
pub mod map;
pub mod outcome;
pub mod scheduler;
pub mod screenshot;
pub mod session;
pub mod step;

pub use events::RunEvent;
pub use map::{Test, TestMap};
pub use outcome::{RunSummary, TestState};
pub use scheduler::Runner;
pub use step::Step;

/// Page-error substrings that are known-benign navigation noise
pub const DEFAULT_PAGE_ERROR_IGNORE: [&str; 4] = [
    "net::ERR_ABORTED",
    "NS_BINDING_ABORTED",
    "access control checks",
    "Load request cancelled",
];

/// Options for one invocation of the runner
///
/// The struct deserializes from the JSON config file (camelCase keys, with
/// aliases for the historical key names); command-line flags are applied on
/// top by the binary. Defaults are the ones used when a key is missing:
///
/// ```
/// let opts = visreg::RunOptions::default();
/// assert_eq!(opts.parallel, 3);
/// assert_eq!(opts.viewport.width, 1366);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunOptions {
    /// Base URL of the application under test
    #[serde(alias = "url")]
    pub base_url: String,
    /// Default viewport for every new context
    pub viewport: Viewport,
    /// Engines every test runs on
    #[serde(alias = "targets")]
    pub engines: Vec<EngineKind>,
    /// Maximum number of tests in flight
    #[serde(alias = "parallelTests")]
    pub parallel: usize,
    /// Per-step timeout in milliseconds (also the navigation retry deadline)
    #[serde(alias = "defaultTimeout")]
    pub step_timeout_ms: u64,
    /// CIEDE2000 tolerance for a pixel to count as unchanged
    pub tolerance: f64,
    /// Brightness tolerance used by anti-aliasing detection
    pub antialiasing_tolerance: f64,
    /// Directory holding `{identity}.{engine}.png` baselines
    pub screenshots_dir: PathBuf,
    /// Key baselines by sanitized title instead of step hash
    pub title_based_screenshots: bool,
    /// Overwrite mismatching baselines instead of failing
    pub update: bool,
    /// Only run tests with these titles
    pub target: Option<Vec<String>>,
    /// Delete unused baselines after an unfiltered run
    pub clean: bool,
    /// Run the whole map this many times
    pub repeat: usize,
    /// Page-error substrings that are logged and ignored
    pub page_error_ignore: Vec<String>,
    /// Collect code coverage on engines that support it
    pub coverage: bool,
    /// Output directory handed to the coverage processor
    pub coverage_dir: PathBuf,
    /// Glob patterns excluded from coverage
    pub coverage_exclude: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            viewport: Viewport::default(),
            engines: vec![EngineKind::Chromium],
            parallel: 3,
            step_timeout_ms: 25_000,
            tolerance: 2.5,
            antialiasing_tolerance: 3.5,
            screenshots_dir: PathBuf::from("__visreg__"),
            title_based_screenshots: false,
            update: false,
            target: None,
            clean: false,
            repeat: 1,
            page_error_ignore: DEFAULT_PAGE_ERROR_IGNORE.iter().map(|s| s.to_string()).collect(),
            coverage: false,
            coverage_dir: PathBuf::from("__coverage__"),
            coverage_exclude: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Load options from a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("unable to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Check the options and normalize the engine list to canonical order.
    pub fn validate(&mut self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Configuration("a base URL is required".into()));
        }
        self.base_url = self.base_url.trim_end_matches('/').to_string();

        let mut engines: Vec<EngineKind> = EngineKind::ALL
            .iter()
            .copied()
            .filter(|e| self.engines.contains(e))
            .collect();
        engines.dedup();
        if engines.is_empty() {
            return Err(Error::Configuration(
                "at least one engine is required (chromium, firefox, webkit)".into(),
            ));
        }
        self.engines = engines;

        if self.parallel == 0 {
            return Err(Error::Configuration("parallel must be at least 1".into()));
        }
        if self.repeat == 0 {
            return Err(Error::Configuration("repeat must be at least 1".into()));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::Configuration(format!("invalid tolerance {}", self.tolerance)));
        }
        if !self.antialiasing_tolerance.is_finite() || self.antialiasing_tolerance < 0.0 {
            return Err(Error::Configuration(format!(
                "invalid antialiasing tolerance {}",
                self.antialiasing_tolerance
            )));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::Configuration("viewport dimensions must be non-zero".into()));
        }
        if let Some(target) = &self.target {
            if target.is_empty() {
                self.target = None;
            }
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// A browser rendering backend a test can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chromium,
    Firefox,
    Webkit,
}

impl EngineKind {
    /// Every engine, in canonical order
    pub const ALL: [EngineKind; 3] = [EngineKind::Chromium, EngineKind::Firefox, EngineKind::Webkit];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Chromium => "chromium",
            EngineKind::Firefox => "firefox",
            EngineKind::Webkit => "webkit",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chromium" => Ok(EngineKind::Chromium),
            "firefox" => Ok(EngineKind::Firefox),
            "webkit" => Ok(EngineKind::Webkit),
            other => Err(Error::Configuration(format!("unknown engine `{}`", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = RunOptions::default();
        assert_eq!(opts.viewport.width, 1366);
        assert_eq!(opts.viewport.height, 768);
        assert_eq!(opts.step_timeout(), Duration::from_secs(25));
        assert_eq!(opts.repeat, 1);
        assert_eq!(opts.page_error_ignore.len(), 4);
    }

    #[test]
    fn test_config_aliases() {
        let json = r#"{
            "url": "http://localhost:8080/",
            "targets": ["webkit", "chromium", "webkit"],
            "parallelTests": 5,
            "defaultTimeout": 1000,
            "titleBasedScreenshots": true,
            "viewport": { "width": 800, "height": 600 }
        }"#;
        let mut opts: RunOptions = serde_json::from_str(json).unwrap();
        opts.validate().unwrap();
        assert_eq!(opts.base_url, "http://localhost:8080");
        assert_eq!(opts.engines, vec![EngineKind::Chromium, EngineKind::Webkit]);
        assert_eq!(opts.parallel, 5);
        assert_eq!(opts.step_timeout_ms, 1000);
        assert!(opts.title_based_screenshots);
        assert_eq!(opts.viewport, Viewport { width: 800, height: 600 });
        assert_eq!(opts.tolerance, 2.5);
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let mut missing_url = RunOptions::default();
        assert!(matches!(missing_url.validate(), Err(Error::Configuration(_))));

        let mut no_engines = RunOptions { base_url: "http://x".into(), engines: vec![], ..Default::default() };
        assert!(no_engines.validate().is_err());

        let mut zero_parallel = RunOptions { base_url: "http://x".into(), parallel: 0, ..Default::default() };
        assert!(zero_parallel.validate().is_err());

        let mut empty_target = RunOptions {
            base_url: "http://x".into(),
            target: Some(vec![]),
            ..Default::default()
        };
        empty_target.validate().unwrap();
        assert!(empty_target.target.is_none());
    }

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("WebKit".parse::<EngineKind>().unwrap(), EngineKind::Webkit);
        assert!("opera".parse::<EngineKind>().is_err());
        assert_eq!(EngineKind::Firefox.to_string(), "firefox");
    }
}
