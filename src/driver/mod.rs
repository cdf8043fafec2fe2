//! Browser backend seam
//!
//! A [`Driver`] launches one long-lived [`BrowserProcess`] per engine; a
//! process hands out isolated [`Page`]s, each living in its own browsing
//! context (cookies, storage, viewport). All calls are blocking: the
//! scheduler runs every (test × engine) execution on a blocking worker, so
//! backends are free to wrap synchronous protocol clients.
//!
//! Elements are addressed as `(selector, index)` pairs rather than handles so
//! that operations on "every matched element" stay backend-neutral.

use crate::coverage::CoverageEntry;
use crate::step::ColorScheme;
use crate::{EngineKind, Result, Viewport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "cdp")]
pub mod cdp;

pub mod scripted;

/// Launches browser engine processes
pub trait Driver: Send + Sync {
    /// Start the engine's browser process.
    fn launch(&self, engine: EngineKind) -> Result<Arc<dyn BrowserProcess>>;
}

/// A running browser engine process
pub trait BrowserProcess: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Open a page in a fresh, isolated browsing context.
    fn new_page(&self, options: &ContextOptions) -> Result<Box<dyn Page>>;

    /// Shut the process down. Called exactly once per run.
    fn close(&self) -> Result<()>;
}

/// Settings applied to a freshly created browsing context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub viewport: Viewport,
    pub touch: bool,
    pub locale: String,
    pub timezone: String,
    pub color_scheme: ColorScheme,
    pub extra_headers: HashMap<String, String>,
    /// Default timeout for element and navigation operations
    pub timeout: Duration,
}

/// Mouse buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Axis-aligned element box in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// In-page measurements used by full-page capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageMetrics {
    /// Document height in CSS pixels
    pub page_height: f64,
    /// Viewport height in CSS pixels
    pub viewport_height: f64,
    /// Viewport width in CSS pixels
    pub viewport_width: f64,
    pub device_pixel_ratio: f64,
}

/// A failure observed by session-level event hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFailure {
    Crashed(String),
    Script(String),
    RequestFailed(String),
}

impl PageFailure {
    pub fn message(&self) -> &str {
        match self {
            PageFailure::Crashed(m) | PageFailure::Script(m) | PageFailure::RequestFailed(m) => m,
        }
    }

    pub fn into_error(self) -> crate::Error {
        match self {
            PageFailure::Crashed(m) => crate::Error::SessionCrash(m),
            PageFailure::Script(m) => crate::Error::PageScript(m),
            PageFailure::RequestFailed(m) => crate::Error::RequestFailed(m),
        }
    }
}

/// One page in an isolated browsing context
pub trait Page: Send {
    /// Navigate and wait for the load to settle.
    fn goto(&self, url: &str, timeout: Duration) -> Result<()>;
    fn go_back(&self, timeout: Duration) -> Result<()>;
    fn go_forward(&self, timeout: Duration) -> Result<()>;

    fn viewport(&self) -> Viewport;
    /// Resize the live context in place.
    fn set_viewport(&self, viewport: Viewport) -> Result<()>;
    fn emulate_color_scheme(&self, scheme: ColorScheme) -> Result<()>;

    /// Block until `selector` matches, or fail with `SelectorTimeout`.
    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;
    /// Number of elements currently matching `selector`.
    fn count(&self, selector: &str) -> Result<usize>;
    fn element_box(&self, selector: &str, index: usize) -> Result<Option<ElementBox>>;

    fn click(&self, selector: &str, index: usize, button: MouseButton) -> Result<()>;
    fn tap(&self, selector: &str, index: usize) -> Result<()>;
    fn hover(&self, selector: &str, index: usize) -> Result<()>;
    fn focus(&self, selector: &str, index: usize) -> Result<()>;
    fn blur(&self, selector: &str, index: usize) -> Result<()>;
    /// Current `value` of a form element (empty for others).
    fn input_value(&self, selector: &str, index: usize) -> Result<String>;

    fn mouse_move(&self, x: f64, y: f64) -> Result<()>;
    fn mouse_down(&self, button: MouseButton) -> Result<()>;
    fn mouse_up(&self, button: MouseButton) -> Result<()>;

    fn key_down(&self, key: &str) -> Result<()>;
    fn key_up(&self, key: &str) -> Result<()>;
    fn press_key(&self, key: &str) -> Result<()>;
    fn type_text(&self, text: &str) -> Result<()>;

    /// Scroll to the top and measure the document.
    fn metrics(&self) -> Result<PageMetrics>;
    /// Scroll down by one viewport height.
    fn scroll_by_viewport(&self) -> Result<()>;
    /// PNG of the current viewport.
    fn screenshot(&self) -> Result<Vec<u8>>;

    /// Drain the first failure recorded by the page's event hooks.
    fn take_failure(&self) -> Option<PageFailure>;

    /// Start raw coverage collection; `false` if the engine has none.
    fn start_coverage(&self) -> Result<bool> {
        Ok(false)
    }

    fn stop_coverage(&self) -> Result<Vec<CoverageEntry>> {
        Ok(Vec::new())
    }

    /// Close the page and dispose of its browsing context.
    fn close(self: Box<Self>) -> Result<()>;
}
