//! Deterministic in-process backend
//!
//! Renders a synthetic page whose pixels depend only on the document
//! position, the emulated colour scheme, per-engine tints and the state of
//! the configured elements. Every interaction is recorded so callers can
//! assert on what a run actually did.

use super::{BrowserProcess, ContextOptions, Driver, ElementBox, MouseButton, Page, PageFailure, PageMetrics};
use crate::coverage::{CoverageEntry, CoverageRange, FunctionCoverage};
use crate::step::ColorScheme;
use crate::{EngineKind, Error, Result, Viewport};
use image::{Rgba, RgbaImage};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// An element of the synthetic page
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedElement {
    pub bounds: ElementBox,
    /// Initial form value
    pub value: String,
    /// Delay after page creation before the element matches
    pub appears_after: Duration,
}

impl ScriptedElement {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            bounds: ElementBox { x, y, width, height },
            value: String::new(),
            appears_after: Duration::ZERO,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn appearing_after(mut self, delay: Duration) -> Self {
        self.appears_after = delay;
        self
    }
}

/// One interaction observed by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NewContext(ContextOptions),
    Goto(String),
    Back,
    Forward,
    SetViewport(Viewport),
    ColorScheme(ColorScheme),
    Click { selector: String, index: usize, button: MouseButton },
    Tap { selector: String, index: usize },
    Hover { selector: String, index: usize },
    Focus { selector: String, index: usize },
    Blur { selector: String, index: usize },
    MouseMove(f64, f64),
    MouseDown(MouseButton),
    MouseUp(MouseButton),
    KeyDown(String),
    KeyUp(String),
    Press(String),
    Type(String),
    Screenshot,
}

#[derive(Debug, Clone)]
struct Site {
    page_height: u32,
    elements: BTreeMap<String, Vec<ScriptedElement>>,
    navigation_failures: u32,
    navigation_delay: Duration,
    failures: Vec<PageFailure>,
    tints: HashMap<EngineKind, [u8; 3]>,
    unavailable: Vec<EngineKind>,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            page_height: 768,
            elements: BTreeMap::new(),
            navigation_failures: 0,
            navigation_delay: Duration::ZERO,
            failures: Vec::new(),
            tints: HashMap::new(),
            unavailable: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    actions: Vec<(EngineKind, Action)>,
    launched: Vec<EngineKind>,
    closed: Vec<EngineKind>,
    open_pages: usize,
    peak_pages: usize,
    navigation_attempts: u32,
}

#[derive(Debug, Default)]
struct Shared {
    site: Mutex<Site>,
    stats: Mutex<Stats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn record(&self, engine: EngineKind, action: Action) {
        lock(&self.stats).actions.push((engine, action));
    }
}

/// Driver for the synthetic site; clones share the site and the recorded
/// statistics.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    shared: Arc<Shared>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document height in CSS pixels.
    pub fn with_page_height(self, height: u32) -> Self {
        self.set_page_height(height);
        self
    }

    pub fn with_element(self, selector: impl Into<String>, element: ScriptedElement) -> Self {
        lock(&self.shared.site).elements.entry(selector.into()).or_default().push(element);
        self
    }

    /// Fail the next `count` navigations before letting one through.
    pub fn with_navigation_failures(self, count: u32) -> Self {
        lock(&self.shared.site).navigation_failures = count;
        self
    }

    /// Sleep on every navigation so that executions overlap.
    pub fn with_navigation_delay(self, delay: Duration) -> Self {
        lock(&self.shared.site).navigation_delay = delay;
        self
    }

    /// Report `failure` on every page after its first navigation.
    pub fn with_page_failure(self, failure: PageFailure) -> Self {
        lock(&self.shared.site).failures.push(failure);
        self
    }

    pub fn with_unavailable_engine(self, engine: EngineKind) -> Self {
        lock(&self.shared.site).unavailable.push(engine);
        self
    }

    pub fn set_page_height(&self, height: u32) {
        lock(&self.shared.site).page_height = height;
    }

    /// Shift every pixel rendered by `engine` by `rgb`.
    pub fn set_tint(&self, engine: EngineKind, rgb: [u8; 3]) {
        lock(&self.shared.site).tints.insert(engine, rgb);
    }

    pub fn clear_tints(&self) {
        lock(&self.shared.site).tints.clear();
    }

    /// Every recorded interaction, in order.
    pub fn actions(&self) -> Vec<(EngineKind, Action)> {
        lock(&self.shared.stats).actions.clone()
    }

    pub fn actions_for(&self, engine: EngineKind) -> Vec<Action> {
        lock(&self.shared.stats)
            .actions
            .iter()
            .filter(|(e, _)| *e == engine)
            .map(|(_, a)| a.clone())
            .collect()
    }

    pub fn screenshots(&self) -> usize {
        lock(&self.shared.stats)
            .actions
            .iter()
            .filter(|(_, a)| *a == Action::Screenshot)
            .count()
    }

    pub fn launched(&self) -> Vec<EngineKind> {
        lock(&self.shared.stats).launched.clone()
    }

    pub fn closed(&self) -> Vec<EngineKind> {
        lock(&self.shared.stats).closed.clone()
    }

    pub fn open_pages(&self) -> usize {
        lock(&self.shared.stats).open_pages
    }

    /// Highest number of simultaneously open pages.
    pub fn peak_pages(&self) -> usize {
        lock(&self.shared.stats).peak_pages
    }

    pub fn navigation_attempts(&self) -> u32 {
        lock(&self.shared.stats).navigation_attempts
    }
}

impl Driver for ScriptedDriver {
    fn launch(&self, engine: EngineKind) -> Result<Arc<dyn BrowserProcess>> {
        if lock(&self.shared.site).unavailable.contains(&engine) {
            return Err(Error::Driver(format!("{} executable not found", engine)));
        }
        lock(&self.shared.stats).launched.push(engine);
        Ok(Arc::new(ScriptedProcess {
            engine,
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedProcess {
    engine: EngineKind,
    shared: Arc<Shared>,
}

impl BrowserProcess for ScriptedProcess {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    fn new_page(&self, options: &ContextOptions) -> Result<Box<dyn Page>> {
        {
            let mut stats = lock(&self.shared.stats);
            stats.open_pages += 1;
            stats.peak_pages = stats.peak_pages.max(stats.open_pages);
        }
        self.shared.record(self.engine, Action::NewContext(options.clone()));
        Ok(Box::new(ScriptedPage {
            engine: self.engine,
            shared: self.shared.clone(),
            created: Instant::now(),
            state: Mutex::new(PageState {
                viewport: options.viewport,
                scheme: options.color_scheme,
                ..Default::default()
            }),
        }))
    }

    fn close(&self) -> Result<()> {
        lock(&self.shared.stats).closed.push(self.engine);
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct ElementState {
    clicks: u32,
    value: Option<String>,
}

#[derive(Debug, Default)]
struct PageState {
    viewport: Viewport,
    scheme: ColorScheme,
    scroll_y: u32,
    history: Vec<String>,
    position: usize,
    navigated: bool,
    failures: Vec<PageFailure>,
    elements: HashMap<(String, usize), ElementState>,
    focused: Option<(String, usize)>,
    coverage: bool,
}

struct ScriptedPage {
    engine: EngineKind,
    shared: Arc<Shared>,
    created: Instant,
    state: Mutex<PageState>,
}

impl ScriptedPage {
    fn state(&self) -> MutexGuard<'_, PageState> {
        lock(&self.state)
    }

    fn visible(&self, selector: &str) -> Vec<ScriptedElement> {
        let elapsed = self.created.elapsed();
        lock(&self.shared.site)
            .elements
            .get(selector)
            .map(|els| els.iter().filter(|e| e.appears_after <= elapsed).cloned().collect())
            .unwrap_or_default()
    }

    fn element(&self, selector: &str, index: usize) -> Result<ScriptedElement> {
        self.visible(selector)
            .into_iter()
            .nth(index)
            .ok_or_else(|| Error::Driver(format!("no element {} at index {}", selector, index)))
    }

    fn record(&self, action: Action) {
        self.shared.record(self.engine, action);
    }

    fn render(&self) -> RgbaImage {
        let site = lock(&self.shared.site).clone();
        let state = self.state();
        let Viewport { width, height } = state.viewport;
        let tint = site.tints.get(&self.engine).copied().unwrap_or([0, 0, 0]);
        let blue = match state.scheme {
            ColorScheme::Light => 230,
            ColorScheme::Dark => 30,
            ColorScheme::NoPreference => 128,
        };

        let mut img = RgbaImage::from_fn(width, height, |x, y| {
            let doc_y = y + state.scroll_y;
            if doc_y >= site.page_height {
                return Rgba([255, 255, 255, 255]);
            }
            let r = (doc_y * 255 / site.page_height.max(1)) as u8;
            let g = (x * 255 / width.max(1)) as u8;
            Rgba([r.wrapping_add(tint[0]), g.wrapping_add(tint[1]), (blue as u8).wrapping_add(tint[2]), 255])
        });

        for (selector, elements) in &site.elements {
            for (index, element) in elements.iter().enumerate() {
                if element.appears_after > self.created.elapsed() {
                    continue;
                }
                let es = state.elements.get(&(selector.clone(), index)).cloned().unwrap_or_default();
                let value_len = es.value.as_deref().unwrap_or(&element.value).len() as u32;
                let fill = Rgba([
                    ((es.clicks * 60) % 256) as u8,
                    ((value_len * 20) % 256) as u8,
                    200u8.wrapping_add(tint[2]),
                    255,
                ]);
                let b = element.bounds;
                let top = b.y as i64 - state.scroll_y as i64;
                for py in top.max(0)..(top + b.height as i64).min(height as i64) {
                    for px in (b.x as i64).max(0)..((b.x + b.width) as i64).min(width as i64) {
                        img.put_pixel(px as u32, py as u32, fill);
                    }
                }
            }
        }
        img
    }

    fn navigate(&self, url: &str) -> Result<()> {
        let (fail, delay, failures) = {
            let mut site = lock(&self.shared.site);
            let fail = site.navigation_failures > 0;
            if fail {
                site.navigation_failures -= 1;
            }
            (fail, site.navigation_delay, site.failures.clone())
        };
        lock(&self.shared.stats).navigation_attempts += 1;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail {
            return Err(Error::Driver(format!("net::ERR_CONNECTION_REFUSED at {}", url)));
        }

        let mut state = self.state();
        let position = state.position;
        if state.navigated {
            state.history.truncate(position + 1);
        }
        state.history.push(url.to_string());
        state.position = state.history.len() - 1;
        state.scroll_y = 0;
        if !state.navigated {
            state.navigated = true;
            state.failures = failures;
        }
        Ok(())
    }

    fn with_element_state<R>(&self, selector: &str, index: usize, f: impl FnOnce(&mut ElementState) -> R) -> R {
        let mut state = self.state();
        let es = state.elements.entry((selector.to_string(), index)).or_default();
        f(es)
    }
}

impl Page for ScriptedPage {
    fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.record(Action::Goto(url.to_string()));
        self.navigate(url)
    }

    fn go_back(&self, _timeout: Duration) -> Result<()> {
        self.record(Action::Back);
        let mut state = self.state();
        state.position = state.position.saturating_sub(1);
        Ok(())
    }

    fn go_forward(&self, _timeout: Duration) -> Result<()> {
        self.record(Action::Forward);
        let mut state = self.state();
        if state.position + 1 < state.history.len() {
            state.position += 1;
        }
        Ok(())
    }

    fn viewport(&self) -> Viewport {
        self.state().viewport
    }

    fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        self.record(Action::SetViewport(viewport));
        self.state().viewport = viewport;
        Ok(())
    }

    fn emulate_color_scheme(&self, scheme: ColorScheme) -> Result<()> {
        self.record(Action::ColorScheme(scheme));
        self.state().scheme = scheme;
        Ok(())
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.visible(selector).is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::SelectorTimeout {
                    selector: selector.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn count(&self, selector: &str) -> Result<usize> {
        Ok(self.visible(selector).len())
    }

    fn element_box(&self, selector: &str, index: usize) -> Result<Option<ElementBox>> {
        Ok(self.visible(selector).get(index).map(|e| e.bounds))
    }

    fn click(&self, selector: &str, index: usize, button: MouseButton) -> Result<()> {
        self.element(selector, index)?;
        self.record(Action::Click { selector: selector.to_string(), index, button });
        self.with_element_state(selector, index, |es| es.clicks += 1);
        Ok(())
    }

    fn tap(&self, selector: &str, index: usize) -> Result<()> {
        self.element(selector, index)?;
        self.record(Action::Tap { selector: selector.to_string(), index });
        self.with_element_state(selector, index, |es| es.clicks += 1);
        Ok(())
    }

    fn hover(&self, selector: &str, index: usize) -> Result<()> {
        self.element(selector, index)?;
        self.record(Action::Hover { selector: selector.to_string(), index });
        Ok(())
    }

    fn focus(&self, selector: &str, index: usize) -> Result<()> {
        self.element(selector, index)?;
        self.record(Action::Focus { selector: selector.to_string(), index });
        self.state().focused = Some((selector.to_string(), index));
        Ok(())
    }

    fn blur(&self, selector: &str, index: usize) -> Result<()> {
        self.record(Action::Blur { selector: selector.to_string(), index });
        let mut state = self.state();
        if state.focused.as_ref().is_some_and(|(s, i)| s == selector && *i == index) {
            state.focused = None;
        }
        Ok(())
    }

    fn input_value(&self, selector: &str, index: usize) -> Result<String> {
        let element = self.element(selector, index)?;
        let current = self.with_element_state(selector, index, |es| es.value.clone());
        Ok(current.unwrap_or(element.value))
    }

    fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.record(Action::MouseMove(x, y));
        Ok(())
    }

    fn mouse_down(&self, button: MouseButton) -> Result<()> {
        self.record(Action::MouseDown(button));
        Ok(())
    }

    fn mouse_up(&self, button: MouseButton) -> Result<()> {
        self.record(Action::MouseUp(button));
        Ok(())
    }

    fn key_down(&self, key: &str) -> Result<()> {
        self.record(Action::KeyDown(key.to_string()));
        Ok(())
    }

    fn key_up(&self, key: &str) -> Result<()> {
        self.record(Action::KeyUp(key.to_string()));
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        self.record(Action::Press(key.to_string()));
        if key != "Backspace" {
            return Ok(());
        }
        let Some((selector, index)) = self.state().focused.clone() else {
            return Ok(());
        };
        let mut value = self.input_value(&selector, index)?;
        value.pop();
        self.with_element_state(&selector, index, |es| es.value = Some(value));
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.record(Action::Type(text.to_string()));
        let Some((selector, index)) = self.state().focused.clone() else {
            return Ok(());
        };
        let value = self.input_value(&selector, index)? + text;
        self.with_element_state(&selector, index, |es| es.value = Some(value));
        Ok(())
    }

    fn metrics(&self) -> Result<PageMetrics> {
        let page_height = lock(&self.shared.site).page_height;
        let mut state = self.state();
        state.scroll_y = 0;
        Ok(PageMetrics {
            page_height: page_height as f64,
            viewport_height: state.viewport.height as f64,
            viewport_width: state.viewport.width as f64,
            device_pixel_ratio: 1.0,
        })
    }

    fn scroll_by_viewport(&self) -> Result<()> {
        let page_height = lock(&self.shared.site).page_height;
        let mut state = self.state();
        let max = page_height.saturating_sub(state.viewport.height);
        state.scroll_y = (state.scroll_y + state.viewport.height).min(max);
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        self.record(Action::Screenshot);
        crate::screenshot::encode_png(&self.render())
    }

    fn take_failure(&self) -> Option<PageFailure> {
        let mut state = self.state();
        if state.failures.is_empty() {
            None
        } else {
            Some(state.failures.remove(0))
        }
    }

    fn start_coverage(&self) -> Result<bool> {
        let supported = self.engine == EngineKind::Chromium;
        self.state().coverage = supported;
        Ok(supported)
    }

    fn stop_coverage(&self) -> Result<Vec<CoverageEntry>> {
        let state = self.state();
        if !state.coverage {
            return Ok(Vec::new());
        }
        Ok(state
            .history
            .iter()
            .enumerate()
            .map(|(i, url)| CoverageEntry {
                url: format!("{}/main.js", url.trim_end_matches('/')),
                script_id: i.to_string(),
                source: None,
                functions: vec![FunctionCoverage {
                    function_name: "main".to_string(),
                    is_block_coverage: true,
                    ranges: vec![CoverageRange { count: 1, start_offset: 0, end_offset: 64 }],
                }],
            })
            .collect())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut stats = lock(&self.shared.stats);
        stats.open_pages = stats.open_pages.saturating_sub(1);
        Ok(())
    }
}
