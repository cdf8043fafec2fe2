//! Error types for the visual-regression runner

use thiserror::Error;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running visual tests
///
/// Every test-level variant is caught at the boundary of a single
/// (test × engine) execution and reported through the event stream; only
/// `Configuration` aborts a whole run.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid options or an unreadable/missing test map
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Navigation did not succeed before its deadline
    #[error("Failed to load {url} after {attempts} attempt(s): {message}")]
    Navigation {
        url: String,
        attempts: u32,
        message: String,
    },

    /// A wait-for-selector step did not resolve in time
    #[error("Timed out after {timeout_ms}ms waiting for selector `{selector}`")]
    SelectorTimeout { selector: String, timeout_ms: u64 },

    /// A step that needs exactly one element matched none
    #[error("`{action}` requires an element but `{selector}` matched nothing")]
    MissingElement { action: &'static str, selector: String },

    /// The browser page or engine crashed
    #[error("Page crashed: {0}")]
    SessionCrash(String),

    /// An uncaught exception was thrown by the page
    #[error("Page error: {0}")]
    PageScript(String),

    /// A sub-resource request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Baseline and current screenshot dimensions differ
    #[error("Screenshots have different sizes ({}x{}) ({}x{})", baseline.0, baseline.1, current.0, current.1)]
    SizeMismatch {
        baseline: (u32, u32),
        current: (u32, u32),
    },

    /// The screenshot differs from its baseline; carries the PNG diff image
    #[error("Found {differences} difference(s)")]
    Mismatch { differences: u64, diff_png: Vec<u8> },

    /// A step could not be decoded or its literal is malformed
    #[error("Invalid step: {0}")]
    InvalidStep(String),

    /// Backend-specific failure
    #[error("Driver error: {0}")]
    Driver(String),

    /// Image decoding or encoding failed
    #[error("Image error: {0}")]
    Image(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error aborts the whole run rather than a single test.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    /// The encoded diff image carried by a mismatch, if any.
    pub fn diff_png(&self) -> Option<&[u8]> {
        match self {
            Error::Mismatch { diff_png, .. } => Some(diff_png),
            _ => None,
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Driver(err.to_string())
    }
}
