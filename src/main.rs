//! `visreg` command-line runner
//!
//! Reads a JSON config and a test map, runs them and logs every event.
//! Exits non-zero when any test failed.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use visreg::baseline::sanitize_filename;
use visreg::events::{CoverageEvent, FailureReport, Progress};
use visreg::map::parse_target_list;
use visreg::{EngineKind, RunEvent, RunOptions, Runner, TestMap, TestState};

/// Visual-regression tests across browser engines
#[derive(Parser, Debug)]
#[command(name = "visreg")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "visreg.config.json")]
    config: PathBuf,

    /// Test map file
    #[arg(short, long, default_value = "visreg.map.json")]
    map: PathBuf,

    /// Only run these titles (comma-separated, `\,` for a literal comma)
    #[arg(short, long)]
    target: Option<String>,

    /// Overwrite mismatching baselines
    #[arg(short, long)]
    update: bool,

    /// Delete baselines no test used
    #[arg(long)]
    clean: bool,

    /// Tests in flight; 0 uses the number of CPUs
    #[arg(short, long)]
    parallel: Option<usize>,

    #[arg(long)]
    repeat: Option<usize>,

    /// Collect code coverage
    #[arg(long)]
    coverage: bool,

    #[arg(long)]
    chromium: bool,

    #[arg(long)]
    firefox: bool,

    #[arg(long)]
    webkit: bool,

    /// List the tests that would run and exit
    #[arg(long)]
    print: bool,
}

impl Args {
    fn apply(&self, options: &mut RunOptions) {
        if let Some(target) = &self.target {
            options.target = Some(parse_target_list(target));
        }
        options.update |= self.update;
        options.clean |= self.clean;
        options.coverage |= self.coverage;
        if let Some(parallel) = self.parallel {
            options.parallel = if parallel == 0 { num_cpus::get() } else { parallel };
        }
        if let Some(repeat) = self.repeat {
            options.repeat = repeat;
        }

        let engines: Vec<EngineKind> = [
            (self.chromium, EngineKind::Chromium),
            (self.firefox, EngineKind::Firefox),
            (self.webkit, EngineKind::Webkit),
        ]
        .into_iter()
        .filter_map(|(on, engine)| on.then_some(engine))
        .collect();
        if !engines.is_empty() {
            options.engines = engines;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut options = if args.config.exists() {
        RunOptions::from_file(&args.config)?
    } else {
        warn!("{} not found, using defaults", args.config.display());
        RunOptions::default()
    };
    args.apply(&mut options);

    let map = TestMap::load(&args.map).with_context(|| format!("loading {}", args.map.display()))?;

    if args.print {
        for test in map.iter().filter(|t| t.is_runnable() && t.is_targeted(options.target.as_deref())) {
            println!("{}", test.display_name(&options.base_url));
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;

    let summary = runtime.block_on(async {
        let runner = Runner::new(options.clone(), driver()?);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let diff_dir = options.screenshots_dir.join("__diff__");
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                report(event, &diff_dir);
            }
        });

        let summary = runner.run(&map, tx).await;
        let _ = printer.await;
        summary.map_err(anyhow::Error::from)
    })?;

    if summary.has_failures() {
        bail!("{} test(s) failed", summary.failed);
    }
    Ok(())
}

#[cfg(feature = "cdp")]
fn driver() -> Result<Arc<dyn visreg::driver::Driver>> {
    Ok(Arc::new(visreg::driver::cdp::CdpDriver::default()))
}

#[cfg(not(feature = "cdp"))]
fn driver() -> Result<Arc<dyn visreg::driver::Driver>> {
    bail!("no browser backend compiled in; rebuild with `--features cdp`")
}

fn report(event: RunEvent, diff_dir: &Path) {
    match event {
        RunEvent::Started { count } => info!("Running {} test(s)", count),
        RunEvent::Progress(progress) => report_progress(&progress),
        RunEvent::Error(failure) => report_failure(&failure, diff_dir),
        RunEvent::Coverage(CoverageEvent::Running) => info!("Processing coverage"),
        RunEvent::Coverage(CoverageEvent::Done(report)) => {
            info!("Coverage {:.2}% over {} file(s)", report.overall_pct, report.files.len())
        }
        RunEvent::Done(summary) => {
            info!(
                "Done: {} passed, {} updated ({} forced), {} failed, {} skipped",
                summary.passed, summary.updated, summary.forced, summary.failed, summary.skipped
            );
            for path in &summary.unused_baselines {
                if summary.cleaned {
                    info!("Removed unused baseline {}", path.display());
                } else {
                    warn!("Unused baseline {}", path.display());
                }
            }
        }
    }
}

fn report_progress(progress: &Progress) {
    let elapsed = progress.elapsed.map(|d| format!(" ({:.1}s)", d.as_secs_f64())).unwrap_or_default();
    match progress.state {
        TestState::Running => info!("… {}", progress.title),
        TestState::Updated if progress.force => info!("updated (forced) {}{}", progress.title, elapsed),
        state => info!("{} {}{}", state.as_str(), progress.title, elapsed),
    }
}

fn report_failure(failure: &FailureReport, diff_dir: &Path) {
    error!("{}", failure);
    let (Some(png), Some((_, title)), Some(engine)) = (failure.diff_png(), &failure.test, failure.engine) else {
        return;
    };
    let path = diff_dir.join(format!("{}.{}.png", sanitize_filename(title), engine));
    let written = std::fs::create_dir_all(diff_dir).and_then(|()| std::fs::write(&path, png));
    match written {
        Ok(()) => info!("Diff written to {}", path.display()),
        Err(e) => warn!("Could not write {}: {}", path.display(), e),
    }
}
