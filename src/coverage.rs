//! Code-coverage collaborator seam
//!
//! Pages collect raw per-script coverage; turning it into a report (source
//! maps, per-file line lists) is the job of an external [`CoverageProcessor`].

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Raw coverage for one script, as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageEntry {
    pub url: String,
    pub script_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub functions: Vec<FunctionCoverage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCoverage {
    pub function_name: String,
    pub is_block_coverage: bool,
    pub ranges: Vec<CoverageRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRange {
    pub count: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Processed coverage returned to the caller
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub overall_pct: f64,
    pub files: Vec<FileCoverage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    pub name: String,
    pub coverage: f64,
    pub uncovered_lines: Vec<u32>,
}

/// Turns raw entries into a report written under `output_dir`
pub trait CoverageProcessor: Send + Sync {
    fn process(&self, entries: &[CoverageEntry], output_dir: &Path, exclude: &[String]) -> Result<CoverageReport>;
}

impl<F> CoverageProcessor for F
where
    F: Fn(&[CoverageEntry], &Path, &[String]) -> Result<CoverageReport> + Send + Sync,
{
    fn process(&self, entries: &[CoverageEntry], output_dir: &Path, exclude: &[String]) -> Result<CoverageReport> {
        self(entries, output_dir, exclude)
    }
}

/// Empty `dir`, creating it if needed.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}
