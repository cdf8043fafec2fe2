//! Declarative test steps and the literals they carry
//!
//! On disk a step is `{ "action": string, "value": any }`. In memory it is a
//! tagged union so that every action's payload has a fixed shape; decoding
//! goes through [`RawStep`] and rejects malformed payloads up front.

use crate::{Error, Result, Viewport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// One declarative step of a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum Step {
    /// Sleep for a duration, or wait for a selector and adopt it
    Wait(Wait),
    /// Stage a selector for the following steps
    Select(String),
    /// Click every matched element
    Click(ClickButton),
    /// Replace the content of every matched element
    Type(String),
    /// Hover every matched element
    Hover,
    /// Drag the selected element to a target point
    Drag { x: Coordinate, y: Coordinate },
    /// Swipe across the viewport
    Swipe { from: (Coordinate, Coordinate), to: (Coordinate, Coordinate) },
    /// Press a `+`-joined key chord on the selected element
    Keyboard(String),
    /// Change viewport size, touch capability or full-page mode
    Viewport(String),
    /// Navigate to a URL, a root-relative path, `back` or `forward`
    Goto(String),
    /// Emulate a CSS media feature (`prefers-color-scheme:dark`)
    Media(String),
}

/// Payload of a `wait` step
#[derive(Debug, Clone, PartialEq)]
pub enum Wait {
    Seconds(f64),
    Selector(String),
}

/// Mouse button used by `click`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClickButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// A coordinate literal used by `drag` and `swipe`
///
/// Plain numbers are absolute pixels, `50v` is 50% of the viewport extent
/// on that axis and `-20f` is an offset from the selected element's center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinate {
    Pixels(f64),
    ViewportPercent(f64),
    ElementOffset(f64),
}

/// Wire form of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStep {
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Step {
    /// Lower-case action name as written in map files.
    pub fn action(&self) -> &'static str {
        match self {
            Step::Wait(_) => "wait",
            Step::Select(_) => "select",
            Step::Click(_) => "click",
            Step::Type(_) => "type",
            Step::Hover => "hover",
            Step::Drag { .. } => "drag",
            Step::Swipe { .. } => "swipe",
            Step::Keyboard(_) => "keyboard",
            Step::Viewport(_) => "viewport",
            Step::Goto(_) => "goto",
            Step::Media(_) => "media",
        }
    }
}

impl TryFrom<RawStep> for Step {
    type Error = Error;

    fn try_from(raw: RawStep) -> Result<Self> {
        let RawStep { action, value } = raw;
        let step = match action.as_str() {
            "wait" => match value {
                Value::Number(n) => {
                    let secs = n.as_f64().unwrap_or(0.0);
                    if Duration::try_from_secs_f64(secs).is_err() {
                        return Err(Error::InvalidStep(format!("wait: invalid duration {}", n)));
                    }
                    Step::Wait(Wait::Seconds(secs))
                }
                Value::String(s) if !s.trim().is_empty() => Step::Wait(Wait::Selector(s)),
                other => return Err(invalid(&action, &other)),
            },
            "select" => Step::Select(expect_string(&action, value)?),
            "click" => match &value {
                Value::Null => Step::Click(ClickButton::Left),
                Value::String(s) => match s.as_str() {
                    "" | "left" => Step::Click(ClickButton::Left),
                    "right" => Step::Click(ClickButton::Right),
                    "middle" => Step::Click(ClickButton::Middle),
                    _ => return Err(invalid(&action, &value)),
                },
                _ => return Err(invalid(&action, &value)),
            },
            "type" => match value {
                Value::String(s) => Step::Type(s),
                Value::Number(n) => Step::Type(n.to_string()),
                other => return Err(invalid(&action, &other)),
            },
            "hover" => Step::Hover,
            "drag" => {
                let coords = expect_coordinates(&action, &value, 2)?;
                Step::Drag { x: coords[0], y: coords[1] }
            }
            "swipe" => {
                let coords = expect_coordinates(&action, &value, 4)?;
                if coords.iter().any(|c| matches!(c, Coordinate::ElementOffset(_))) {
                    return Err(Error::InvalidStep("swipe: element offsets (`f`) are not supported".into()));
                }
                Step::Swipe { from: (coords[0], coords[1]), to: (coords[2], coords[3]) }
            }
            "keyboard" => {
                let chord = expect_string(&action, value)?;
                KeyChord::parse(&chord)?;
                Step::Keyboard(chord)
            }
            "viewport" => Step::Viewport(expect_string(&action, value)?),
            "goto" => Step::Goto(expect_string(&action, value)?),
            "media" => Step::Media(expect_string(&action, value)?),
            other => return Err(Error::InvalidStep(format!("unknown action `{}`", other))),
        };
        Ok(step)
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let action = step.action().to_string();
        let value = match step {
            Step::Wait(Wait::Seconds(s)) => serde_json::json!(s),
            Step::Wait(Wait::Selector(s)) => Value::String(s),
            Step::Select(s) | Step::Type(s) | Step::Keyboard(s) | Step::Viewport(s) | Step::Goto(s) | Step::Media(s) => {
                Value::String(s)
            }
            Step::Click(ClickButton::Left) | Step::Hover => Value::Null,
            Step::Click(ClickButton::Right) => Value::String("right".into()),
            Step::Click(ClickButton::Middle) => Value::String("middle".into()),
            Step::Drag { x, y } => Value::Array(vec![x.to_value(), y.to_value()]),
            Step::Swipe { from, to } => Value::Array(vec![
                from.0.to_value(),
                from.1.to_value(),
                to.0.to_value(),
                to.1.to_value(),
            ]),
        };
        RawStep { action, value }
    }
}

fn invalid(action: &str, value: &Value) -> Error {
    Error::InvalidStep(format!("{}: unexpected value {}", action, value))
}

fn expect_string(action: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(invalid(action, &other)),
    }
}

fn expect_coordinates(action: &str, value: &Value, len: usize) -> Result<Vec<Coordinate>> {
    let items = value
        .as_array()
        .filter(|a| a.len() == len)
        .ok_or_else(|| Error::InvalidStep(format!("{}: expected an array of {} coordinates", action, len)))?;
    items.iter().map(Coordinate::from_value).collect()
}

/// Parse the leading integer of a literal the way lenient number parsing
/// does: optional whitespace and sign, then digits; trailing text is ignored.
pub fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let digits: &str = &rest[..rest.bytes().take_while(u8::is_ascii_digit).count()];
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|n| sign * n)
}

impl Coordinate {
    /// Decode a coordinate from a JSON number or suffixed string.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Coordinate::Pixels)
                .ok_or_else(|| Error::InvalidStep(format!("invalid coordinate {}", n))),
            Value::String(s) => Self::parse(s),
            other => Err(Error::InvalidStep(format!("invalid coordinate {}", other))),
        }
    }

    /// Parse `120`, `50v` or `-20f`.
    pub fn parse(s: &str) -> Result<Self> {
        let t = s.trim();
        let n = parse_leading_int(t).ok_or_else(|| Error::InvalidStep(format!("invalid coordinate `{}`", s)))? as f64;
        Ok(if t.ends_with('v') {
            Coordinate::ViewportPercent(n)
        } else if t.ends_with('f') {
            Coordinate::ElementOffset(n)
        } else {
            Coordinate::Pixels(n)
        })
    }

    /// Resolve against the viewport extent and (for offsets) the element
    /// center on the same axis.
    pub fn resolve(&self, viewport_extent: u32, element_center: Option<f64>) -> f64 {
        match *self {
            Coordinate::Pixels(n) => n,
            Coordinate::ViewportPercent(p) => (p / 100.0) * viewport_extent as f64,
            Coordinate::ElementOffset(o) => element_center.unwrap_or(0.0) + o,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Coordinate::Pixels(n) => serde_json::json!(n),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coordinate::Pixels(n) => write!(f, "{}", n),
            Coordinate::ViewportPercent(n) => write!(f, "{}v", n),
            Coordinate::ElementOffset(n) => write!(f, "{}f", n),
        }
    }
}

/// A parsed `viewport` literal such as `390x844tf`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportDescriptor {
    pub width: u32,
    pub height: u32,
    pub touch: bool,
    pub full_page: bool,
}

impl ViewportDescriptor {
    /// Parse a descriptor; missing or unparsable dimensions keep the
    /// current size. `t` enables touch and `f` full-page capture.
    pub fn parse(literal: &str, current: Viewport) -> Self {
        let mut width = current.width;
        let mut height = current.height;

        if let Some((w, h)) = literal.split_once('x') {
            if let Some(w) = parse_leading_int(w).and_then(|w| u32::try_from(w).ok()).filter(|w| *w > 0) {
                width = w;
            }
            if let Some(h) = parse_leading_int(h).and_then(|h| u32::try_from(h).ok()).filter(|h| *h > 0) {
                height = h;
            }
        }

        Self {
            width,
            height,
            touch: literal.contains('t'),
            full_page: literal.contains('f'),
        }
    }

    pub fn size(&self) -> Viewport {
        Viewport { width: self.width, height: self.height }
    }
}

/// Keys a chord holds down rather than presses
pub const MODIFIER_KEYS: [&str; 4] = ["Shift", "Control", "Alt", "Meta"];

/// A parsed `keyboard` literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    /// Modifiers in the order they are pressed
    pub modifiers: Vec<String>,
    /// Non-modifier keys pressed while the modifiers are held
    pub keys: Vec<String>,
}

impl KeyChord {
    pub fn parse(literal: &str) -> Result<Self> {
        if literal.is_empty() {
            return Err(Error::InvalidStep("keyboard: empty key chord".into()));
        }
        let literal = literal.replacen("++", "+NumpadAdd", 1);
        let mut modifiers = Vec::new();
        let mut keys = Vec::new();
        for part in literal.split('+').filter(|p| !p.is_empty()) {
            if MODIFIER_KEYS.contains(&part) {
                if !modifiers.iter().any(|m| m == part) {
                    modifiers.push(part.to_string());
                }
            } else {
                keys.push(part.to_string());
            }
        }
        if modifiers.is_empty() && keys.is_empty() {
            return Err(Error::InvalidStep(format!("keyboard: no keys in `{}`", literal)));
        }
        Ok(Self { modifiers, keys })
    }
}

/// Emulated `prefers-color-scheme` value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
    NoPreference,
}

impl ColorScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorScheme::Light => "light",
            ColorScheme::Dark => "dark",
            ColorScheme::NoPreference => "no-preference",
        }
    }

    /// Parse a `media` literal; `None` for unsupported features or values.
    pub fn from_media_literal(literal: &str) -> Option<Self> {
        let (name, value) = literal.split_once(':')?;
        if name.trim() != "prefers-color-scheme" {
            return None;
        }
        match value.trim() {
            "light" => Some(ColorScheme::Light),
            "dark" => Some(ColorScheme::Dark),
            "no-preference" => Some(ColorScheme::NoPreference),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Wait(Wait::Seconds(s)) => write!(f, "wait {}s", s),
            Step::Wait(Wait::Selector(s)) => write!(f, "wait for {}", s),
            Step::Select(s) => write!(f, "select {}", s),
            Step::Click(ClickButton::Left) => write!(f, "click"),
            Step::Click(ClickButton::Right) => write!(f, "right click"),
            Step::Click(ClickButton::Middle) => write!(f, "middle click"),
            Step::Type(s) => write!(f, "type {:?}", s),
            Step::Hover => write!(f, "hover"),
            Step::Drag { x, y } => write!(f, "drag to ({}, {})", x, y),
            Step::Swipe { from, to } => write!(f, "swipe ({}, {}) to ({}, {})", from.0, from.1, to.0, to.1),
            Step::Keyboard(k) => write!(f, "press {}", k),
            Step::Viewport(v) => write!(f, "viewport {}", v),
            Step::Goto(u) => write!(f, "go to {}", u),
            Step::Media(m) => write!(f, "media {}", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(v: Value) -> Result<Step> {
        serde_json::from_value::<RawStep>(v).map_err(Error::from).and_then(Step::try_from)
    }

    #[test]
    fn decodes_every_action() {
        assert_eq!(step(json!({"action": "wait", "value": 1.5})).unwrap(), Step::Wait(Wait::Seconds(1.5)));
        assert_eq!(
            step(json!({"action": "wait", "value": "#app"})).unwrap(),
            Step::Wait(Wait::Selector("#app".into()))
        );
        assert_eq!(step(json!({"action": "click"})).unwrap(), Step::Click(ClickButton::Left));
        assert_eq!(step(json!({"action": "click", "value": "right"})).unwrap(), Step::Click(ClickButton::Right));
        assert_eq!(step(json!({"action": "hover", "value": null})).unwrap(), Step::Hover);
        assert_eq!(
            step(json!({"action": "drag", "value": ["50v", "-20f"]})).unwrap(),
            Step::Drag { x: Coordinate::ViewportPercent(50.0), y: Coordinate::ElementOffset(-20.0) }
        );
        assert_eq!(
            step(json!({"action": "swipe", "value": [0, "10v", 100, "90v"]})).unwrap(),
            Step::Swipe {
                from: (Coordinate::Pixels(0.0), Coordinate::ViewportPercent(10.0)),
                to: (Coordinate::Pixels(100.0), Coordinate::ViewportPercent(90.0)),
            }
        );
        assert_eq!(step(json!({"action": "goto", "value": "back"})).unwrap(), Step::Goto("back".into()));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(step(json!({"action": "fly", "value": 1})).is_err());
        assert!(step(json!({"action": "wait", "value": -1})).is_err());
        assert!(matches!(step(json!({"action": "wait", "value": 1e20})), Err(Error::InvalidStep(_))));
        assert!(step(json!({"action": "drag", "value": [1]})).is_err());
        assert!(step(json!({"action": "swipe", "value": [1, 2, "3f", 4]})).is_err());
        assert!(step(json!({"action": "select", "value": 3})).is_err());
        assert!(step(json!({"action": "keyboard", "value": ""})).is_err());
    }

    #[test]
    fn serializes_back_to_wire_shape() {
        let s = Step::Click(ClickButton::Left);
        assert_eq!(serde_json::to_value(&s).unwrap(), json!({"action": "click"}));
        let d = Step::Drag { x: Coordinate::Pixels(10.0), y: Coordinate::ViewportPercent(5.0) };
        assert_eq!(serde_json::to_value(&d).unwrap(), json!({"action": "drag", "value": [10.0, "5v"]}));
    }

    #[test]
    fn leading_int_is_lenient() {
        assert_eq!(parse_leading_int("844tf"), Some(844));
        assert_eq!(parse_leading_int(" -20f"), Some(-20));
        assert_eq!(parse_leading_int("v"), None);
        assert_eq!(parse_leading_int(""), None);
    }

    #[test]
    fn coordinates_resolve_per_unit() {
        assert_eq!(Coordinate::parse("50v").unwrap().resolve(800, None), 400.0);
        assert_eq!(Coordinate::parse("-20f").unwrap().resolve(800, Some(100.0)), 80.0);
        assert_eq!(Coordinate::parse("120").unwrap().resolve(800, Some(100.0)), 120.0);
        assert!(Coordinate::parse("abc").is_err());
    }

    #[test]
    fn viewport_descriptor_parsing() {
        let current = Viewport { width: 1366, height: 768 };
        assert_eq!(
            ViewportDescriptor::parse("390x844tf", current),
            ViewportDescriptor { width: 390, height: 844, touch: true, full_page: true }
        );
        assert_eq!(
            ViewportDescriptor::parse("x500", current),
            ViewportDescriptor { width: 1366, height: 500, touch: false, full_page: false }
        );
        assert_eq!(ViewportDescriptor::parse("99999999999x10", current).size(), Viewport { width: 1366, height: 10 });
        assert_eq!(ViewportDescriptor::parse("800x4294967296", current).size(), Viewport { width: 800, height: 768 });
        let d = ViewportDescriptor::parse("t", current);
        assert_eq!(d.size(), current);
        assert!(d.touch);
        assert!(!d.full_page);
    }

    #[test]
    fn key_chords_split_modifiers_from_keys() {
        let c = KeyChord::parse("Control+Shift+K").unwrap();
        assert_eq!(c.modifiers, vec!["Control", "Shift"]);
        assert_eq!(c.keys, vec!["K"]);

        let plus = KeyChord::parse("Control++").unwrap();
        assert_eq!(plus.modifiers, vec!["Control"]);
        assert_eq!(plus.keys, vec!["NumpadAdd"]);

        let plain = KeyChord::parse("Enter").unwrap();
        assert!(plain.modifiers.is_empty());
        assert_eq!(plain.keys, vec!["Enter"]);
    }

    #[test]
    fn media_literals() {
        assert_eq!(ColorScheme::from_media_literal("prefers-color-scheme:dark"), Some(ColorScheme::Dark));
        assert_eq!(ColorScheme::from_media_literal("prefers-reduced-motion:reduce"), None);
        assert_eq!(ColorScheme::from_media_literal("prefers-color-scheme:sepia"), None);
    }

    #[test]
    fn renders_human_readable_steps() {
        assert_eq!(Step::Wait(Wait::Seconds(2.0)).to_string(), "wait 2s");
        assert_eq!(Step::Type("hi".into()).to_string(), "type \"hi\"");
        assert_eq!(
            Step::Drag { x: Coordinate::ViewportPercent(50.0), y: Coordinate::Pixels(3.0) }.to_string(),
            "drag to (50v, 3)"
        );
    }
}
