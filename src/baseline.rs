//! Baseline identities and the per-run ledger of baseline files

use crate::map::Test;
use crate::step::Step;
use crate::{EngineKind, Result};
use log::info;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Content key naming a test's baseline images
///
/// Step-hash identities are order-sensitive: identical steps always share a
/// baseline and any step change yields a new one. Title identities survive
/// step edits but must be unique across the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScreenshotIdentity(String);

impl ScreenshotIdentity {
    /// Hex SHA-256 of the canonical JSON of `steps`.
    pub fn from_steps(steps: &[Step]) -> Self {
        let canonical = serde_json::to_string(steps).unwrap_or_default();
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Title-based when requested and the title sanitizes to something
    /// usable, step-hash otherwise.
    pub fn for_test(test: &Test, title_based: bool) -> Self {
        if title_based {
            if let Some(name) = test.title().map(sanitize_filename).filter(|s| !s.is_empty()) {
                return Self(name);
            }
        }
        Self::from_steps(&test.steps)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{identity}.{engine}.png`
    pub fn file_name(&self, engine: EngineKind) -> String {
        format!("{}.{}.png", self.0, engine)
    }
}

const RESERVED_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8", "com9", "lpt1",
    "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Strip characters and names that are not portable in file names.
pub fn sanitize_filename(input: &str) -> String {
    let mut out: String = input
        .chars()
        .filter(|c| !matches!(c, '/' | '?' | '<' | '>' | '\\' | ':' | '*' | '|' | '"'))
        .filter(|c| !c.is_control())
        .collect();

    if out.chars().all(|c| c == '.') {
        return String::new();
    }
    let stem = out.split('.').next().unwrap_or("").to_ascii_lowercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return String::new();
    }

    let trimmed_len = out.trim_end_matches(['.', ' ']).len();
    out.truncate(trimmed_len);

    if out.len() > 255 {
        let mut cut = 255;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// Tracks which baseline files on disk were referenced during one run
///
/// Scoped to a single run invocation; shared between concurrent executions
/// behind a mutex.
#[derive(Debug)]
pub struct BaselineLedger {
    dir: PathBuf,
    // path -> still unused
    seen: Mutex<BTreeMap<PathBuf, bool>>,
}

impl BaselineLedger {
    /// Ensure `dir` exists and record every `.png` already in it.
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut seen = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "png") {
                seen.insert(path, true);
            }
        }
        Ok(Self { dir, seen: Mutex::new(seen) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &ScreenshotIdentity, engine: EngineKind) -> PathBuf {
        self.dir.join(identity.file_name(engine))
    }

    /// Mark a baseline as referenced by an executed test.
    pub fn mark_used(&self, path: &Path) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(path.to_path_buf(), false);
    }

    /// Baselines present at scan time that nothing referenced, sorted.
    pub fn unused(&self) -> Vec<PathBuf> {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.iter().filter(|(_, unused)| **unused).map(|(p, _)| p.clone()).collect()
    }

    /// Delete every unused baseline and return the removed paths.
    pub fn clean(&self) -> Result<Vec<PathBuf>> {
        let unused = self.unused();
        for path in &unused {
            match std::fs::remove_file(path) {
                Ok(()) => info!("Deleted unused baseline {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        for path in &unused {
            seen.remove(path);
        }
        Ok(unused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ClickButton, Wait};

    fn steps() -> Vec<Step> {
        vec![Step::Wait(Wait::Selector("#a".into())), Step::Click(ClickButton::Left)]
    }

    #[test]
    fn step_hash_is_stable_and_order_sensitive() {
        let a = ScreenshotIdentity::from_steps(&steps());
        let b = ScreenshotIdentity::from_steps(&steps());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let mut reversed = steps();
        reversed.reverse();
        assert_ne!(a, ScreenshotIdentity::from_steps(&reversed));
    }

    #[test]
    fn title_identity_ignores_step_edits() {
        let t1 = Test::new("Login / Dark", steps());
        let t2 = Test::new("Login / Dark", vec![Step::Hover]);
        let a = ScreenshotIdentity::for_test(&t1, true);
        assert_eq!(a, ScreenshotIdentity::for_test(&t2, true));
        assert_eq!(a.as_str(), "Login  Dark");
        assert_eq!(a.file_name(EngineKind::Webkit), "Login  Dark.webkit.png");
        assert_ne!(a, ScreenshotIdentity::for_test(&t1, false));
    }

    #[test]
    fn untitled_tests_fall_back_to_hash() {
        let t = Test { title: None, steps: steps() };
        assert_eq!(ScreenshotIdentity::for_test(&t, true), ScreenshotIdentity::from_steps(&steps()));
        let reserved = Test::new("CON", steps());
        assert_eq!(ScreenshotIdentity::for_test(&reserved, true).as_str().len(), 64);
    }

    #[test]
    fn sanitize_strips_unportable_names() {
        assert_eq!(sanitize_filename("a<b>c:d"), "abcd");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename("lpt1.txt"), "");
        assert_eq!(sanitize_filename("name. . "), "name");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 255);
    }

    #[test]
    fn ledger_tracks_unused_baselines() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.chromium.png", "b.chromium.png", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let ledger = BaselineLedger::scan(dir.path()).unwrap();
        ledger.mark_used(&dir.path().join("a.chromium.png"));
        ledger.mark_used(&dir.path().join("new.chromium.png"));
        assert_eq!(ledger.unused(), vec![dir.path().join("b.chromium.png")]);

        let removed = ledger.clean().unwrap();
        assert_eq!(removed, vec![dir.path().join("b.chromium.png")]);
        assert!(!dir.path().join("b.chromium.png").exists());
        assert!(dir.path().join("a.chromium.png").exists());
        assert!(ledger.unused().is_empty());
    }
}
