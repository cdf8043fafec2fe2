//! Chrome DevTools Protocol backend (uses the `headless_chrome` crate)
//!
//! One headless Chrome process per run; every page lives in its own browser
//! context. Only the Chromium engine can be driven this way.
//!
//! Page failures come from protocol events (`Runtime.exceptionThrown`,
//! `Network.loadingFailed`, `Inspector.targetCrashed`) registered on the tab
//! before the first navigation, so they survive document changes.

use super::{BrowserProcess, ContextOptions, Driver, ElementBox, MouseButton, Page, PageFailure, PageMetrics};
use crate::coverage::CoverageEntry;
use crate::step::ColorScheme;
use crate::{EngineKind, Error, Result, Viewport};
use headless_chrome::browser::tab::{ModifierKey, Tab};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Page as CdpPageDomain;
use headless_chrome::protocol::cdp::{Emulation, Input, Inspector, Network, Profiler, Runtime, Target};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Launches headless Chrome
#[derive(Debug, Clone)]
pub struct CdpDriver {
    /// Initial window size; pages override it per context
    pub window_size: (u32, u32),
    pub launch_timeout: Duration,
}

impl Default for CdpDriver {
    fn default() -> Self {
        Self {
            window_size: (1366, 768),
            launch_timeout: Duration::from_secs(15),
        }
    }
}

impl Driver for CdpDriver {
    fn launch(&self, engine: EngineKind) -> Result<Arc<dyn BrowserProcess>> {
        if engine != EngineKind::Chromium {
            return Err(Error::Configuration(format!("the CDP driver cannot run {}", engine)));
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .window_size(Some(self.window_size))
            .idle_browser_timeout(Duration::from_secs(600))
            .args(vec![
                OsStr::new("--disable-setuid-sandbox"),
                // cross-origin fixtures are common in visual tests
                OsStr::new("--disable-web-security"),
                OsStr::new("--hide-scrollbars"),
                OsStr::new("--force-color-profile=srgb"),
                OsStr::new("--disable-dev-shm-usage"),
            ])
            .build()
            .map_err(|e| Error::Driver(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options).map_err(|e| Error::Driver(format!("Failed to launch browser: {}", e)))?;

        Ok(Arc::new(CdpProcess {
            browser: Mutex::new(Some(browser)),
        }))
    }
}

struct CdpProcess {
    browser: Mutex<Option<Browser>>,
}

impl CdpProcess {
    fn browser(&self) -> Result<Browser> {
        self.browser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::SessionCrash("browser has been closed".into()))
    }
}

impl BrowserProcess for CdpProcess {
    fn engine(&self) -> EngineKind {
        EngineKind::Chromium
    }

    fn new_page(&self, options: &ContextOptions) -> Result<Box<dyn Page>> {
        let browser = self.browser()?;
        let (context_id, tab) = {
            let context = browser
                .new_context()
                .map_err(|e| Error::Driver(format!("Failed to create context: {}", e)))?;
            let tab = context
                .new_tab()
                .map_err(|e| Error::Driver(format!("Failed to create tab: {}", e)))?;
            (context.get_id().to_string(), tab)
        };
        tab.set_default_timeout(options.timeout);

        let page = CdpPage {
            context_id,
            tab,
            viewport: Mutex::new(options.viewport),
            touch: options.touch,
            modifiers: Mutex::new(Vec::new()),
            pointer: Mutex::new(Pointer::default()),
            failures: Arc::new(Mutex::new(FailureLog::default())),
        };
        page.hook_failures()?;
        page.prepare(options)?;
        Ok(Box::new(page))
    }

    fn close(&self) -> Result<()> {
        // dropping the last handle terminates the child process
        drop(self.browser.lock().unwrap_or_else(|e| e.into_inner()).take());
        Ok(())
    }
}

/// Page failures collected from protocol events, drained after each step
#[derive(Debug, Default)]
struct FailureLog {
    // request id -> "METHOD url"
    in_flight: HashMap<String, String>,
    pending: VecDeque<PageFailure>,
}

impl FailureLog {
    fn record(&mut self, event: &Event) {
        match event {
            Event::NetworkRequestWillBeSent(e) => {
                let request = &e.params.request;
                self.request_sent(&e.params.request_id, &request.method, &request.url);
            }
            Event::NetworkLoadingFinished(e) => self.request_finished(&e.params.request_id),
            Event::NetworkLoadingFailed(e) => self.request_failed(&e.params.request_id, &e.params.error_text),
            Event::RuntimeExceptionThrown(e) => self.script_error(&e.params.exception_details),
            Event::InspectorTargetCrashed(_) => self.crashed(),
            _ => {}
        }
    }

    fn request_sent(&mut self, id: &str, method: &str, url: &str) {
        self.in_flight.insert(id.to_string(), format!("{} {}", method, url));
    }

    fn request_finished(&mut self, id: &str) {
        self.in_flight.remove(id);
    }

    fn request_failed(&mut self, id: &str, error_text: &str) {
        let request = self.in_flight.remove(id).unwrap_or_else(|| format!("request {}", id));
        self.pending
            .push_back(PageFailure::RequestFailed(format!("{} {}", request, error_text)));
    }

    fn script_error(&mut self, details: &Runtime::ExceptionDetails) {
        let message = details
            .exception
            .as_ref()
            .and_then(|e| e.description.clone())
            .unwrap_or_else(|| details.text.clone());
        self.pending.push_back(PageFailure::Script(message));
    }

    fn crashed(&mut self) {
        self.pending.push_back(PageFailure::Crashed("Page crashed".to_string()));
    }

    fn take(&mut self) -> Option<PageFailure> {
        self.pending.pop_front()
    }
}

#[derive(Debug, Clone, Copy)]
enum MouseAction {
    Move(f64, f64),
    Press(MouseButton),
    Release(MouseButton),
}

/// Last pointer position and the button held down, if any
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Pointer {
    x: f64,
    y: f64,
    pressed: Option<MouseButton>,
}

impl Pointer {
    /// Advance the pointer and build the matching protocol event. Presses and
    /// releases land where the pointer last moved; moves carry the held button.
    fn apply(&mut self, action: MouseAction, modifiers: u32) -> Input::DispatchMouseEvent {
        let (kind, button) = match action {
            MouseAction::Move(x, y) => {
                self.x = x;
                self.y = y;
                (Input::DispatchMouseEventTypeOption::MouseMoved, self.pressed)
            }
            MouseAction::Press(button) => {
                self.pressed = Some(button);
                (Input::DispatchMouseEventTypeOption::MousePressed, Some(button))
            }
            MouseAction::Release(button) => {
                self.pressed = None;
                (Input::DispatchMouseEventTypeOption::MouseReleased, Some(button))
            }
        };
        Input::DispatchMouseEvent {
            Type: kind,
            x: self.x,
            y: self.y,
            modifiers: Some(modifiers),
            timestamp: None,
            button: Some(button.map(cdp_button).unwrap_or(Input::MouseButton::None)),
            buttons: Some(self.pressed.map(button_mask).unwrap_or(0)),
            click_count: (!matches!(action, MouseAction::Move(..))).then_some(1),
            force: None,
            tangential_pressure: None,
            tilt_x: None,
            tilt_y: None,
            twist: None,
            delta_x: None,
            delta_y: None,
            pointer_Type: None,
        }
    }
}

struct CdpPage {
    context_id: String,
    tab: Arc<Tab>,
    viewport: Mutex<Viewport>,
    touch: bool,
    // modifier keys currently held down
    modifiers: Mutex<Vec<String>>,
    pointer: Mutex<Pointer>,
    failures: Arc<Mutex<FailureLog>>,
}

#[derive(Deserialize)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Deserialize)]
struct RawMetrics {
    height: f64,
    inner_height: f64,
    inner_width: f64,
    dpr: f64,
}

fn cdp_err(what: &str) -> impl Fn(anyhow::Error) -> Error + '_ {
    move |e| Error::Driver(format!("{}: {}", what, e))
}

fn modifier_key(key: &str) -> Option<ModifierKey> {
    match key {
        "Shift" => Some(ModifierKey::Shift),
        "Control" => Some(ModifierKey::Ctrl),
        "Alt" => Some(ModifierKey::Alt),
        "Meta" => Some(ModifierKey::Meta),
        _ => None,
    }
}

/// Protocol modifier bit mask for the held keys.
fn modifier_mask(held: &[String]) -> u32 {
    held.iter()
        .map(|k| match k.as_str() {
            "Alt" => 1,
            "Control" => 2,
            "Meta" => 4,
            "Shift" => 8,
            _ => 0,
        })
        .sum()
}

fn cdp_button(button: MouseButton) -> Input::MouseButton {
    match button {
        MouseButton::Left => Input::MouseButton::Left,
        MouseButton::Right => Input::MouseButton::Right,
        MouseButton::Middle => Input::MouseButton::Middle,
    }
}

/// Protocol `buttons` bit for a held button.
fn button_mask(button: MouseButton) -> u32 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Right => 2,
        MouseButton::Middle => 4,
    }
}

fn touch_point(x: f64, y: f64) -> Input::TouchPoint {
    Input::TouchPoint {
        x,
        y,
        radius_x: None,
        radius_y: None,
        rotation_angle: None,
        force: None,
        tangential_pressure: None,
        tilt_x: None,
        tilt_y: None,
        twist: None,
        id: None,
    }
}

impl CdpPage {
    fn hook_failures(&self) -> Result<()> {
        let failures = Arc::clone(&self.failures);
        self.tab
            .add_event_listener(Arc::new(move |event: &Event| {
                failures.lock().unwrap_or_else(|e| e.into_inner()).record(event);
            }))
            .map_err(cdp_err("Failed to register page hooks"))?;

        self.tab.enable_runtime().map_err(cdp_err("Failed to enable runtime"))?;
        self.tab
            .call_method(Network::Enable {
                max_total_buffer_size: None,
                max_resource_buffer_size: None,
                max_post_data_size: None,
                report_direct_socket_traffic: None,
                enable_durable_messages: None,
            })
            .map_err(cdp_err("Failed to enable network events"))?;
        self.tab
            .call_method(Inspector::Enable(None))
            .map_err(cdp_err("Failed to enable inspector events"))?;
        Ok(())
    }

    fn prepare(&self, options: &ContextOptions) -> Result<()> {
        self.apply_metrics(options.viewport)?;
        if options.touch {
            self.tab
                .call_method(Emulation::SetTouchEmulationEnabled { enabled: true, max_touch_points: Some(1) })
                .map_err(cdp_err("Failed to enable touch"))?;
        }
        self.tab
            .call_method(Emulation::SetLocaleOverride { locale: Some(options.locale.clone()) })
            .map_err(cdp_err("Failed to set locale"))?;
        self.tab
            .call_method(Emulation::SetTimezoneOverride { timezone_id: options.timezone.clone() })
            .map_err(cdp_err("Failed to set timezone"))?;
        self.emulate_color_scheme(options.color_scheme)?;

        let headers = options.extra_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.tab
            .set_extra_http_headers(headers)
            .map_err(cdp_err("Failed to set headers"))?;
        Ok(())
    }

    fn apply_metrics(&self, viewport: Viewport) -> Result<()> {
        self.tab
            .call_method(Emulation::SetDeviceMetricsOverride {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: 1.0,
                mobile: self.touch,
                scale: None,
                screen_width: None,
                screen_height: None,
                position_x: None,
                position_y: None,
                dont_set_visible_size: None,
                screen_orientation: None,
                viewport: None,
                display_feature: None,
                device_posture: None,
            })
            .map_err(cdp_err("Failed to set viewport"))?;
        Ok(())
    }

    fn eval(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self
            .tab
            .evaluate(expression, true)
            .map_err(|e| Error::Driver(format!("Evaluation failed: {}", e)))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    /// Evaluate an expression returning `JSON.stringify(...)` and decode it.
    fn eval_json<T: serde::de::DeserializeOwned>(&self, expression: &str) -> Result<T> {
        match self.eval(expression)? {
            serde_json::Value::String(s) => Ok(serde_json::from_str(&s)?),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Run `body` with `el` bound to the `index`th match of `selector`.
    fn on_element(&self, selector: &str, index: usize, body: &str) -> Result<serde_json::Value> {
        let selector = serde_json::to_string(selector)?;
        self.eval(&format!(
            "(function(){{ const el = document.querySelectorAll({})[{}]; if (!el) return null; {} }})()",
            selector, index, body
        ))
    }

    /// Scroll the element into view and return its center.
    fn target_point(&self, selector: &str, index: usize) -> Result<(f64, f64)> {
        self.on_element(selector, index, "el.scrollIntoView({block: 'center', inline: 'center'}); return null;")?;
        let bounds = self
            .element_box(selector, index)?
            .ok_or_else(|| Error::Driver(format!("{} no longer matches element {}", selector, index)))?;
        Ok(bounds.center())
    }

    fn mouse(&self, action: MouseAction) -> Result<()> {
        let modifiers = modifier_mask(&self.modifiers.lock().unwrap_or_else(|e| e.into_inner()));
        let event = self.pointer.lock().unwrap_or_else(|e| e.into_inner()).apply(action, modifiers);
        self.tab.call_method(event).map_err(cdp_err("Mouse event failed"))?;
        Ok(())
    }

    fn key(&self, kind: Input::DispatchKeyEventTypeOption, key: &str) -> Result<()> {
        let modifiers = modifier_mask(&self.modifiers.lock().unwrap_or_else(|e| e.into_inner()));
        self.tab
            .call_method(Input::DispatchKeyEvent {
                Type: kind,
                modifiers: Some(modifiers),
                timestamp: None,
                text: None,
                unmodified_text: None,
                key_identifier: None,
                code: None,
                key: Some(key.to_string()),
                windows_virtual_key_code: None,
                native_virtual_key_code: None,
                auto_repeat: None,
                is_keypad: None,
                is_system_key: None,
                location: None,
                commands: None,
            })
            .map_err(cdp_err("Key event failed"))?;
        Ok(())
    }

    fn touch(&self, kind: Input::DispatchTouchEventTypeOption, points: Vec<Input::TouchPoint>) -> Result<()> {
        self.tab
            .call_method(Input::DispatchTouchEvent {
                Type: kind,
                touch_points: points,
                modifiers: None,
                timestamp: None,
            })
            .map_err(cdp_err("Touch event failed"))?;
        Ok(())
    }

    fn history(&self, delta: i32, timeout: Duration) -> Result<()> {
        self.eval(&format!("history.go({})", delta))?;
        std::thread::sleep(Duration::from_millis(50));
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::Navigation { url: self.tab.get_url(), attempts: 1, message: format!("{} ({:?})", e, timeout) })?;
        Ok(())
    }
}

impl Page for CdpPage {
    fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(timeout);
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(|e| Error::Driver(format!("Navigation to {} failed: {}", url, e)))?;
        Ok(())
    }

    fn go_back(&self, timeout: Duration) -> Result<()> {
        self.history(-1, timeout)
    }

    fn go_forward(&self, timeout: Duration) -> Result<()> {
        self.history(1, timeout)
    }

    fn viewport(&self) -> Viewport {
        *self.viewport.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        self.apply_metrics(viewport)?;
        *self.viewport.lock().unwrap_or_else(|e| e.into_inner()) = viewport;
        Ok(())
    }

    fn emulate_color_scheme(&self, scheme: ColorScheme) -> Result<()> {
        self.tab
            .call_method(Emulation::SetEmulatedMedia {
                media: None,
                features: Some(vec![Emulation::MediaFeature {
                    name: "prefers-color-scheme".to_string(),
                    value: match scheme {
                        ColorScheme::NoPreference => String::new(),
                        other => other.as_str().to_string(),
                    },
                }]),
            })
            .map_err(cdp_err("Failed to emulate media"))?;
        Ok(())
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map_err(|_| Error::SelectorTimeout {
                selector: selector.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?;
        Ok(())
    }

    fn count(&self, selector: &str) -> Result<usize> {
        let selector = serde_json::to_string(selector)?;
        let n = self.eval(&format!("document.querySelectorAll({}).length", selector))?;
        Ok(n.as_u64().unwrap_or(0) as usize)
    }

    fn element_box(&self, selector: &str, index: usize) -> Result<Option<ElementBox>> {
        let raw = self.on_element(
            selector,
            index,
            "const r = el.getBoundingClientRect(); return JSON.stringify({x: r.x, y: r.y, width: r.width, height: r.height});",
        )?;
        let Some(text) = raw.as_str() else {
            return Ok(None);
        };
        let r: Rect = serde_json::from_str(text)?;
        Ok(Some(ElementBox { x: r.x, y: r.y, width: r.width, height: r.height }))
    }

    fn click(&self, selector: &str, index: usize, button: MouseButton) -> Result<()> {
        let (x, y) = self.target_point(selector, index)?;
        self.mouse(MouseAction::Move(x, y))?;
        self.mouse(MouseAction::Press(button))?;
        self.mouse(MouseAction::Release(button))
    }

    fn tap(&self, selector: &str, index: usize) -> Result<()> {
        let (x, y) = self.target_point(selector, index)?;
        self.touch(Input::DispatchTouchEventTypeOption::TouchStart, vec![touch_point(x, y)])?;
        self.touch(Input::DispatchTouchEventTypeOption::TouchEnd, vec![])
    }

    fn hover(&self, selector: &str, index: usize) -> Result<()> {
        let (x, y) = self.target_point(selector, index)?;
        self.mouse(MouseAction::Move(x, y))
    }

    fn focus(&self, selector: &str, index: usize) -> Result<()> {
        self.on_element(selector, index, "el.focus(); return null;")?;
        Ok(())
    }

    fn blur(&self, selector: &str, index: usize) -> Result<()> {
        self.on_element(selector, index, "el.blur(); return null;")?;
        Ok(())
    }

    fn input_value(&self, selector: &str, index: usize) -> Result<String> {
        let value = self.on_element(selector, index, "return el.value === undefined ? '' : String(el.value);")?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.mouse(MouseAction::Move(x, y))
    }

    fn mouse_down(&self, button: MouseButton) -> Result<()> {
        self.mouse(MouseAction::Press(button))
    }

    fn mouse_up(&self, button: MouseButton) -> Result<()> {
        self.mouse(MouseAction::Release(button))
    }

    fn key_down(&self, key: &str) -> Result<()> {
        self.key(Input::DispatchKeyEventTypeOption::RawKeyDown, key)?;
        if modifier_key(key).is_some() {
            self.modifiers.lock().unwrap_or_else(|e| e.into_inner()).push(key.to_string());
        }
        Ok(())
    }

    fn key_up(&self, key: &str) -> Result<()> {
        self.modifiers.lock().unwrap_or_else(|e| e.into_inner()).retain(|h| h != key);
        self.key(Input::DispatchKeyEventTypeOption::KeyUp, key)
    }

    fn press_key(&self, key: &str) -> Result<()> {
        let held: Vec<ModifierKey> = self
            .modifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|k| modifier_key(k))
            .collect();
        let modifiers = (!held.is_empty()).then_some(held.as_slice());
        self.tab
            .press_key_with_modifiers(key, modifiers)
            .map_err(|e| Error::Driver(format!("Failed to press {}: {}", key, e)))?;
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.tab
            .type_str(text)
            .map_err(|e| Error::Driver(format!("Failed to type: {}", e)))?;
        Ok(())
    }

    fn metrics(&self) -> Result<PageMetrics> {
        let m: RawMetrics = self.eval_json(
            "(function(){ window.scrollTo(0, 0); return JSON.stringify({ height: document.body.clientHeight, \
             inner_height: window.innerHeight, inner_width: window.innerWidth, dpr: window.devicePixelRatio }); })()",
        )?;
        Ok(PageMetrics {
            page_height: m.height,
            viewport_height: m.inner_height,
            viewport_width: m.inner_width,
            device_pixel_ratio: m.dpr,
        })
    }

    fn scroll_by_viewport(&self) -> Result<()> {
        self.eval("window.scrollBy(0, window.innerHeight)")?;
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        self.tab
            .capture_screenshot(CdpPageDomain::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| Error::Driver(format!("Screenshot failed: {}", e)))
    }

    fn take_failure(&self) -> Option<PageFailure> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn start_coverage(&self) -> Result<bool> {
        self.tab
            .call_method(Profiler::Enable(None))
            .map_err(cdp_err("Failed to enable profiler"))?;
        self.tab
            .call_method(Profiler::StartPreciseCoverage {
                call_count: Some(true),
                detailed: Some(true),
                allow_triggered_updates: None,
            })
            .map_err(cdp_err("Failed to start coverage"))?;
        Ok(true)
    }

    fn stop_coverage(&self) -> Result<Vec<CoverageEntry>> {
        let taken = self
            .tab
            .call_method(Profiler::TakePreciseCoverage(None))
            .map_err(cdp_err("Failed to take coverage"))?;
        if let Err(e) = self.tab.call_method(Profiler::StopPreciseCoverage(None)) {
            debug!("Failed to stop coverage: {}", e);
        }
        // protocol field names match the entry format
        Ok(serde_json::from_value(serde_json::to_value(&taken.result)?)?)
    }

    fn close(self: Box<Self>) -> Result<()> {
        // disposing the context closes its tabs
        let disposed = self
            .tab
            .call_method(Target::DisposeBrowserContext { browser_context_id: self.context_id.clone() });
        if let Err(e) = disposed {
            warn!("Failed to dispose context {}: {}", self.context_id, e);
            self.tab.close(true).map_err(cdp_err("Failed to close tab"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_chromium_is_supported() {
        let driver = CdpDriver::default();
        assert!(matches!(driver.launch(EngineKind::Firefox), Err(Error::Configuration(_))));
        assert!(matches!(driver.launch(EngineKind::Webkit), Err(Error::Configuration(_))));
    }

    #[test]
    fn modifier_masks_follow_the_protocol() {
        assert_eq!(modifier_mask(&["Alt".to_string(), "Shift".to_string()]), 9);
        assert!(modifier_key("Control").is_some());
        assert!(modifier_key("K").is_none());
    }

    #[test]
    fn drag_presses_and_releases_where_the_pointer_is() {
        let mut pointer = Pointer::default();
        pointer.apply(MouseAction::Move(40.0, 25.0), 0);

        let down = pointer.apply(MouseAction::Press(MouseButton::Left), 0);
        assert!(matches!(down.Type, Input::DispatchMouseEventTypeOption::MousePressed));
        assert_eq!((down.x, down.y), (40.0, 25.0));
        assert_eq!(down.buttons, Some(1));
        assert_eq!(down.click_count, Some(1));

        let moved = pointer.apply(MouseAction::Move(60.0, 30.0), 8);
        assert_eq!(moved.button, Some(Input::MouseButton::Left));
        assert_eq!(moved.buttons, Some(1));
        assert_eq!(moved.modifiers, Some(8));
        assert_eq!(moved.click_count, None);

        let up = pointer.apply(MouseAction::Release(MouseButton::Left), 0);
        assert!(matches!(up.Type, Input::DispatchMouseEventTypeOption::MouseReleased));
        assert_eq!((up.x, up.y), (60.0, 30.0));
        assert_eq!(up.buttons, Some(0));

        let hover = pointer.apply(MouseAction::Move(5.0, 5.0), 0);
        assert_eq!(hover.button, Some(Input::MouseButton::None));
        assert_eq!(hover.buttons, Some(0));
    }

    #[test]
    fn right_button_press_sets_its_own_bit() {
        let mut pointer = Pointer::default();
        let down = pointer.apply(MouseAction::Press(MouseButton::Right), 0);
        assert_eq!(down.button, Some(Input::MouseButton::Right));
        assert_eq!(down.buttons, Some(2));
        assert_eq!((down.x, down.y), (0.0, 0.0));
    }

    #[test]
    fn failures_are_queued_in_arrival_order() {
        let mut log = FailureLog::default();
        log.request_sent("1", "GET", "http://app.test/app.js");
        log.request_sent("2", "POST", "http://app.test/api");
        log.request_finished("1");
        log.request_failed("2", "net::ERR_CONNECTION_REFUSED");
        log.crashed();

        assert_eq!(
            log.take(),
            Some(PageFailure::RequestFailed("POST http://app.test/api net::ERR_CONNECTION_REFUSED".into()))
        );
        assert_eq!(log.take(), Some(PageFailure::Crashed("Page crashed".into())));
        assert_eq!(log.take(), None);
        assert!(log.in_flight.is_empty());
    }

    #[test]
    fn script_errors_prefer_the_exception_description() {
        let details: Runtime::ExceptionDetails = serde_json::from_value(serde_json::json!({
            "exceptionId": 1,
            "text": "Uncaught",
            "lineNumber": 3,
            "columnNumber": 7,
            "exception": { "type": "object", "description": "TypeError: x is undefined" }
        }))
        .unwrap();
        let bare: Runtime::ExceptionDetails = serde_json::from_value(serde_json::json!({
            "exceptionId": 2,
            "text": "Uncaught SyntaxError",
            "lineNumber": 0,
            "columnNumber": 0
        }))
        .unwrap();

        let mut log = FailureLog::default();
        log.script_error(&details);
        log.script_error(&bare);
        assert_eq!(log.take(), Some(PageFailure::Script("TypeError: x is undefined".into())));
        assert_eq!(log.take(), Some(PageFailure::Script("Uncaught SyntaxError".into())));
    }

    #[test]
    fn unknown_failed_requests_keep_their_id() {
        let mut log = FailureLog::default();
        log.request_failed("77", "net::ERR_ABORTED");
        assert_eq!(log.take(), Some(PageFailure::RequestFailed("request 77 net::ERR_ABORTED".into())));
    }
}
