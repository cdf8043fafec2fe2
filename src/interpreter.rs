//! Step interpreter
//!
//! Translates one [`Step`] into browser actions on a live [`Page`]. The only
//! cross-step state is the [`ExecutionContext`]; the interpreter never
//! mutates it and instead returns a [`StepEffect`] for the session to apply.

use crate::driver::{MouseButton, Page};
use crate::step::{ClickButton, ColorScheme, Coordinate, KeyChord, Step, ViewportDescriptor, Wait};
use crate::{Error, Result, Viewport};
use log::debug;
use std::time::Duration;

/// Intermediate pointer positions between the start and end of a drag
pub const POINTER_STEPS: u32 = 10;

/// Per-execution state carried between steps
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub selector: Option<String>,
    pub viewport: Viewport,
    pub touch: bool,
    pub full_page: bool,
}

impl ExecutionContext {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            selector: None,
            viewport,
            touch: false,
            full_page: false,
        }
    }
}

/// Context change requested by a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    None,
    /// Adopt a new current selector
    Selector(String),
    /// Resize, toggle touch or toggle full-page capture
    Viewport(ViewportDescriptor),
}

/// Run-wide settings the interpreter needs
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub base_url: String,
    pub step_timeout: Duration,
}

/// Execute one step.
pub fn run_step(page: &dyn Page, ctx: &ExecutionContext, step: &Step, opts: &StepOptions) -> Result<StepEffect> {
    match step {
        Step::Wait(Wait::Seconds(secs)) => {
            let pause = Duration::try_from_secs_f64(*secs)
                .map_err(|_| Error::InvalidStep(format!("wait: invalid duration {}", secs)))?;
            std::thread::sleep(pause);
            Ok(StepEffect::None)
        }
        Step::Wait(Wait::Selector(selector)) => {
            page.wait_for_selector(selector, opts.step_timeout)?;
            Ok(StepEffect::Selector(selector.clone()))
        }
        Step::Select(selector) => Ok(StepEffect::Selector(selector.clone())),
        Step::Click(button) => {
            for_each_match(page, ctx, |selector, index| {
                match (button, ctx.touch) {
                    (ClickButton::Left, true) => page.tap(selector, index)?,
                    (ClickButton::Left, false) => page.click(selector, index, MouseButton::Left)?,
                    (ClickButton::Right, _) => page.click(selector, index, MouseButton::Right)?,
                    (ClickButton::Middle, _) => page.click(selector, index, MouseButton::Middle)?,
                }
                // park the pointer so hover styles stay out of the capture
                page.mouse_move(-1.0, -1.0)
            })?;
            Ok(StepEffect::None)
        }
        Step::Hover => {
            for_each_match(page, ctx, |selector, index| page.hover(selector, index))?;
            Ok(StepEffect::None)
        }
        Step::Type(text) => {
            for_each_match(page, ctx, |selector, index| {
                let current = page.input_value(selector, index)?;
                page.focus(selector, index)?;
                for _ in current.chars() {
                    page.press_key("Backspace")?;
                }
                page.type_text(text)?;
                page.blur(selector, index)
            })?;
            Ok(StepEffect::None)
        }
        Step::Keyboard(literal) => {
            let chord = KeyChord::parse(literal)?;
            let matched = for_each_match(page, ctx, |selector, index| {
                page.focus(selector, index)?;
                for modifier in &chord.modifiers {
                    page.key_down(modifier)?;
                }
                for key in &chord.keys {
                    page.press_key(key)?;
                }
                for modifier in chord.modifiers.iter().rev() {
                    page.key_up(modifier)?;
                }
                page.blur(selector, index)
            })?;
            if matched == 0 {
                return Err(missing("keyboard", ctx));
            }
            Ok(StepEffect::None)
        }
        Step::Drag { x, y } => {
            let selector = ctx.selector.as_deref().ok_or_else(|| missing("drag", ctx))?;
            let bounds = page.element_box(selector, 0)?.ok_or_else(|| missing("drag", ctx))?;
            let viewport = page.viewport();
            let (cx, cy) = bounds.center();
            let to = (x.resolve(viewport.width, Some(cx)), y.resolve(viewport.height, Some(cy)));
            drag_pointer(page, (cx, cy), to)?;
            Ok(StepEffect::None)
        }
        Step::Swipe { from, to } => {
            let viewport = page.viewport();
            let resolve = |c: &(Coordinate, Coordinate)| (c.0.resolve(viewport.width, None), c.1.resolve(viewport.height, None));
            drag_pointer(page, resolve(from), resolve(to))?;
            Ok(StepEffect::None)
        }
        Step::Viewport(literal) => Ok(StepEffect::Viewport(ViewportDescriptor::parse(literal, page.viewport()))),
        Step::Goto(target) => {
            match target.as_str() {
                "back" => page.go_back(opts.step_timeout)?,
                "forward" => page.go_forward(opts.step_timeout)?,
                url => page.goto(&resolve_url(&opts.base_url, url), opts.step_timeout)?,
            }
            Ok(StepEffect::None)
        }
        Step::Media(literal) => {
            match ColorScheme::from_media_literal(literal) {
                Some(scheme) => page.emulate_color_scheme(scheme)?,
                None => debug!("Ignoring unsupported media feature `{}`", literal),
            }
            Ok(StepEffect::None)
        }
    }
}

/// Root-relative paths are joined to the base URL; anything else is used as is.
pub fn resolve_url(base_url: &str, target: &str) -> String {
    if target.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), target)
    } else {
        target.to_string()
    }
}

/// Apply `f` to every element matched by the current selector and return how
/// many there were. No selector means no matches.
fn for_each_match<F>(page: &dyn Page, ctx: &ExecutionContext, mut f: F) -> Result<usize>
where
    F: FnMut(&str, usize) -> Result<()>,
{
    let Some(selector) = ctx.selector.as_deref() else {
        return Ok(0);
    };
    let count = page.count(selector)?;
    for index in 0..count {
        f(selector, index)?;
    }
    Ok(count)
}

fn missing(action: &'static str, ctx: &ExecutionContext) -> Error {
    Error::MissingElement {
        action,
        selector: ctx.selector.clone().unwrap_or_default(),
    }
}

/// Press at `from`, travel to `to` through [`POINTER_STEPS`] points, release.
fn drag_pointer(page: &dyn Page, from: (f64, f64), to: (f64, f64)) -> Result<()> {
    page.mouse_move(from.0, from.1)?;
    page.mouse_down(MouseButton::Left)?;
    for i in 1..=POINTER_STEPS {
        let t = i as f64 / POINTER_STEPS as f64;
        page.mouse_move(from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)?;
    }
    page.mouse_up(MouseButton::Left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::{Action, ScriptedDriver, ScriptedElement};
    use crate::driver::{ContextOptions, Driver};
    use crate::step::RawStep;
    use crate::EngineKind;
    use std::collections::HashMap;

    fn opts() -> StepOptions {
        StepOptions { base_url: "http://app".into(), step_timeout: Duration::from_millis(500) }
    }

    fn open(driver: &ScriptedDriver, touch: bool) -> Box<dyn Page> {
        driver
            .launch(EngineKind::Chromium)
            .unwrap()
            .new_page(&ContextOptions {
                viewport: Viewport { width: 200, height: 100 },
                touch,
                locale: "en-US".into(),
                timezone: "America/Los_Angeles".into(),
                color_scheme: ColorScheme::Light,
                extra_headers: HashMap::new(),
                timeout: Duration::from_secs(1),
            })
            .unwrap()
    }

    fn ctx(selector: Option<&str>) -> ExecutionContext {
        ExecutionContext {
            selector: selector.map(String::from),
            ..ExecutionContext::new(Viewport { width: 200, height: 100 })
        }
    }

    fn interactions(driver: &ScriptedDriver) -> Vec<Action> {
        driver
            .actions_for(EngineKind::Chromium)
            .into_iter()
            .filter(|a| !matches!(a, Action::NewContext(_)))
            .collect()
    }

    #[test]
    fn wait_for_selector_adopts_it() {
        let driver = ScriptedDriver::new().with_element("#menu", ScriptedElement::new(0.0, 0.0, 10.0, 10.0));
        let page = open(&driver, false);
        let effect = run_step(page.as_ref(), &ctx(None), &Step::Wait(Wait::Selector("#menu".into())), &opts()).unwrap();
        assert_eq!(effect, StepEffect::Selector("#menu".into()));

        let err = run_step(page.as_ref(), &ctx(None), &Step::Wait(Wait::Selector("#gone".into())), &opts()).unwrap_err();
        assert!(matches!(err, Error::SelectorTimeout { timeout_ms: 500, .. }));
    }

    #[test]
    fn click_hits_every_match_and_parks_the_pointer() {
        let driver = ScriptedDriver::new()
            .with_element(".item", ScriptedElement::new(0.0, 0.0, 10.0, 10.0))
            .with_element(".item", ScriptedElement::new(0.0, 20.0, 10.0, 10.0));
        let page = open(&driver, false);
        run_step(page.as_ref(), &ctx(Some(".item")), &Step::Click(ClickButton::Right), &opts()).unwrap();
        assert_eq!(
            interactions(&driver),
            vec![
                Action::Click { selector: ".item".into(), index: 0, button: MouseButton::Right },
                Action::MouseMove(-1.0, -1.0),
                Action::Click { selector: ".item".into(), index: 1, button: MouseButton::Right },
                Action::MouseMove(-1.0, -1.0),
            ]
        );
    }

    #[test]
    fn touch_mode_left_click_taps() {
        let driver = ScriptedDriver::new().with_element("#b", ScriptedElement::new(0.0, 0.0, 10.0, 10.0));
        let page = open(&driver, true);
        let touch = ExecutionContext { touch: true, ..ctx(Some("#b")) };
        run_step(page.as_ref(), &touch, &Step::Click(ClickButton::Left), &opts()).unwrap();
        assert_eq!(interactions(&driver)[0], Action::Tap { selector: "#b".into(), index: 0 });
    }

    #[test]
    fn zero_matches_are_a_noop_for_bulk_actions() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        for step in [Step::Click(ClickButton::Left), Step::Hover, Step::Type("x".into())] {
            assert_eq!(run_step(page.as_ref(), &ctx(Some("#none")), &step, &opts()).unwrap(), StepEffect::None);
        }
        assert!(interactions(&driver).is_empty());
    }

    #[test]
    fn drag_and_keyboard_require_an_element() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        let drag = Step::Drag { x: Coordinate::Pixels(1.0), y: Coordinate::Pixels(1.0) };
        assert!(matches!(
            run_step(page.as_ref(), &ctx(Some("#none")), &drag, &opts()),
            Err(Error::MissingElement { action: "drag", .. })
        ));
        assert!(matches!(
            run_step(page.as_ref(), &ctx(None), &Step::Keyboard("Enter".into()), &opts()),
            Err(Error::MissingElement { action: "keyboard", .. })
        ));
    }

    #[test]
    fn type_clears_existing_content_first() {
        let driver =
            ScriptedDriver::new().with_element("#q", ScriptedElement::new(0.0, 0.0, 10.0, 10.0).with_value("old"));
        let page = open(&driver, false);
        run_step(page.as_ref(), &ctx(Some("#q")), &Step::Type("new".into()), &opts()).unwrap();
        assert_eq!(page.input_value("#q", 0).unwrap(), "new");
        let presses = interactions(&driver).iter().filter(|a| **a == Action::Press("Backspace".into())).count();
        assert_eq!(presses, 3);
        assert_eq!(interactions(&driver).last(), Some(&Action::Blur { selector: "#q".into(), index: 0 }));
    }

    #[test]
    fn keyboard_holds_modifiers_and_releases_in_reverse() {
        let driver = ScriptedDriver::new().with_element("#e", ScriptedElement::new(0.0, 0.0, 10.0, 10.0));
        let page = open(&driver, false);
        run_step(page.as_ref(), &ctx(Some("#e")), &Step::Keyboard("Control+Shift+K".into()), &opts()).unwrap();
        assert_eq!(
            interactions(&driver),
            vec![
                Action::Focus { selector: "#e".into(), index: 0 },
                Action::KeyDown("Control".into()),
                Action::KeyDown("Shift".into()),
                Action::Press("K".into()),
                Action::KeyUp("Shift".into()),
                Action::KeyUp("Control".into()),
                Action::Blur { selector: "#e".into(), index: 0 },
            ]
        );
    }

    #[test]
    fn drag_interpolates_from_element_center() {
        let driver = ScriptedDriver::new().with_element("#h", ScriptedElement::new(10.0, 10.0, 20.0, 20.0));
        let page = open(&driver, false);
        let drag = Step::Drag { x: Coordinate::ViewportPercent(50.0), y: Coordinate::ElementOffset(30.0) };
        run_step(page.as_ref(), &ctx(Some("#h")), &drag, &opts()).unwrap();

        let actions = interactions(&driver);
        assert_eq!(actions[0], Action::MouseMove(20.0, 20.0));
        assert_eq!(actions[1], Action::MouseDown(MouseButton::Left));
        let moves: Vec<_> = actions.iter().filter(|a| matches!(a, Action::MouseMove(..))).collect();
        assert_eq!(moves.len(), 1 + POINTER_STEPS as usize);
        assert_eq!(actions[actions.len() - 2], Action::MouseMove(100.0, 50.0));
        assert_eq!(actions.last(), Some(&Action::MouseUp(MouseButton::Left)));
    }

    #[test]
    fn goto_resolves_relative_paths_and_history() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        run_step(page.as_ref(), &ctx(None), &Step::Goto("/settings".into()), &opts()).unwrap();
        run_step(page.as_ref(), &ctx(None), &Step::Goto("https://other.test/".into()), &opts()).unwrap();
        run_step(page.as_ref(), &ctx(None), &Step::Goto("back".into()), &opts()).unwrap();
        run_step(page.as_ref(), &ctx(None), &Step::Goto("forward".into()), &opts()).unwrap();
        assert_eq!(
            interactions(&driver),
            vec![
                Action::Goto("http://app/settings".into()),
                Action::Goto("https://other.test/".into()),
                Action::Back,
                Action::Forward,
            ]
        );
    }

    #[test]
    fn swipe_resolves_percentages_per_axis_and_interpolates() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        let raw: RawStep = serde_json::from_value(serde_json::json!({"action": "swipe", "value": ["10v", "50v", "90v", 20]})).unwrap();
        let swipe = Step::try_from(raw).unwrap();
        // no selector needed
        assert_eq!(run_step(page.as_ref(), &ctx(None), &swipe, &opts()).unwrap(), StepEffect::None);

        let mut expected = vec![Action::MouseMove(20.0, 50.0), Action::MouseDown(MouseButton::Left)];
        for i in 1..=POINTER_STEPS {
            let t = i as f64 / POINTER_STEPS as f64;
            expected.push(Action::MouseMove(20.0 + 160.0 * t, 50.0 - 30.0 * t));
        }
        expected.push(Action::MouseUp(MouseButton::Left));
        assert_eq!(interactions(&driver), expected);
        assert_eq!(expected[expected.len() - 2], Action::MouseMove(180.0, 20.0));
    }

    #[test]
    fn oversized_wait_is_rejected() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        let err = run_step(page.as_ref(), &ctx(None), &Step::Wait(Wait::Seconds(1e20)), &opts()).unwrap_err();
        assert!(matches!(err, Error::InvalidStep(_)));
        let err = run_step(page.as_ref(), &ctx(None), &Step::Wait(Wait::Seconds(-1.0)), &opts()).unwrap_err();
        assert!(matches!(err, Error::InvalidStep(_)));
    }

    #[test]
    fn viewport_and_media_steps() {
        let driver = ScriptedDriver::new();
        let page = open(&driver, false);
        let effect = run_step(page.as_ref(), &ctx(None), &Step::Viewport("390x844t".into()), &opts()).unwrap();
        assert_eq!(
            effect,
            StepEffect::Viewport(ViewportDescriptor { width: 390, height: 844, touch: true, full_page: false })
        );

        run_step(page.as_ref(), &ctx(None), &Step::Media("prefers-color-scheme:dark".into()), &opts()).unwrap();
        run_step(page.as_ref(), &ctx(None), &Step::Media("prefers-reduced-motion:reduce".into()), &opts()).unwrap();
        assert_eq!(interactions(&driver), vec![Action::ColorScheme(ColorScheme::Dark)]);
    }
}
