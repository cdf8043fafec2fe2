//! Tests and test maps

use crate::step::Step;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A titled sequence of steps
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Test {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Test {
    pub fn new(title: impl Into<String>, steps: Vec<Step>) -> Self {
        Self { title: Some(title.into()), steps }
    }

    /// Title if present and non-empty
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref().filter(|t| !t.is_empty())
    }

    /// A test with no steps is skipped rather than executed.
    pub fn is_runnable(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Name used in reports: the title, or a rendering of the steps.
    pub fn display_name(&self, base_url: &str) -> String {
        match self.title() {
            Some(t) => t.to_string(),
            None => render_steps(&self.steps, Some(base_url)),
        }
    }

    /// Whether the test passes an optional title filter.
    pub fn is_targeted(&self, target: Option<&[String]>) -> bool {
        match target {
            None => true,
            Some(titles) => self.title().is_some_and(|t| titles.iter().any(|x| x == t)),
        }
    }
}

/// Render steps for humans. Root-relative `goto` paths are shown against
/// `base_url` when one is given.
pub fn render_steps(steps: &[Step], base_url: Option<&str>) -> String {
    steps
        .iter()
        .map(|step| match (step, base_url) {
            (Step::Goto(path), Some(base)) if path.starts_with('/') => format!("go to {}{}", base, path),
            _ => step.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" → ")
}

/// An ordered collection of tests, stored on disk as `{"data": [...]}`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestMap {
    #[serde(rename = "data")]
    pub tests: Vec<Test>,
}

impl TestMap {
    pub fn new(tests: Vec<Test>) -> Self {
        Self { tests }
    }

    /// Load a map file; any failure is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Unable to load map file {}: {}", path.display(), e)))?;
        Self::from_json(&text).map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Test> {
        self.tests.iter()
    }
}

/// Split a comma-separated title list where `\,` escapes a literal comma.
pub fn parse_target_list(input: &str) -> Vec<String> {
    let mut titles = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => titles.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    titles.push(current);
    titles
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
