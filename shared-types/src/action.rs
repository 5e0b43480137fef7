//! UI action model.
//!
//! An [`Action`] is one UI operation dispatched to the device agent. Targeted
//! kinds (clicks, `WaitFor`, `GetText`) carry a single visible word as target
//! and an ordered list of [`Anchor`]s that disambiguate it spatially; the
//! first anchor's reference point becomes the base for subsequent anchors.
//!
//! Actions have a textual form used in flow scripts and by the oracle:
//!
//! ```text
//! LeftClick(target='OK').below('Question').left('Cancel').offset(x=4, y=0).do()
//! SendKeys(keys='Hello').do()
//! ActivateWindow(window_name='Calculator').do()
//! ```
//!
//! Inside quotes a backslash escapes `\\`, `'` and `"`; any other backslash is
//! kept literally.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static KEYWORD_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*([A-Za-z_]+)\s*=\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)"|(-?\d+))\s*$"#,
    )
    .expect("keyword argument regex")
});

static POSITIONAL_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*$"#)
        .expect("positional argument regex")
});

/// Spatial relation between a target and an anchor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorRelation {
    /// Target is above the anchor.
    Above,
    /// Target is below the anchor.
    Below,
    /// Target is left of the anchor.
    Left,
    /// Target is right of the anchor.
    Right,
}

impl AnchorRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Relative-position qualifier for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub relation: AnchorRelation,
    /// Single visible word on the screen.
    pub value: String,
}

impl Anchor {
    pub fn new(relation: AnchorRelation, value: impl Into<String>) -> Self {
        Self {
            relation,
            value: value.into(),
        }
    }
}

/// What a targeted action points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Visible text on the screen.
    Text(String),
    /// Name of an element known to the device agent.
    Named(String),
}

impl Target {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Named(s) => s,
        }
    }

    fn arg_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "target",
            Self::Named(_) => "target_name",
        }
    }
}

/// Click offset relative to the resolved target, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
}

impl Offset {
    pub fn is_zero(&self) -> bool {
        self.dx == 0 && self.dy == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ActionKind {
    LeftClick,
    RightClick,
    DoubleClick,
    WaitFor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    GetText,
    SendKeys {
        keys: String,
    },
    PressKeys {
        keys: String,
    },
    PasteText {
        text: String,
    },
    ActivateWindow {
        window_name: String,
    },
    CloseWindow {
        window_name: String,
    },
    MaximizeWindow {
        window_name: String,
    },
    MinimizeWindow {
        window_name: String,
    },
    OpenApplication {
        app_name: String,
    },
    ForceCloseApplication {
        process_name: String,
    },
    Scroll {
        clicks: i32,
    },
    NoAction,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LeftClick => "LeftClick",
            Self::RightClick => "RightClick",
            Self::DoubleClick => "DoubleClick",
            Self::WaitFor { .. } => "WaitFor",
            Self::GetText => "GetText",
            Self::SendKeys { .. } => "SendKeys",
            Self::PressKeys { .. } => "PressKeys",
            Self::PasteText { .. } => "PasteText",
            Self::ActivateWindow { .. } => "ActivateWindow",
            Self::CloseWindow { .. } => "CloseWindow",
            Self::MaximizeWindow { .. } => "MaximizeWindow",
            Self::MinimizeWindow { .. } => "MinimizeWindow",
            Self::OpenApplication { .. } => "OpenApplication",
            Self::ForceCloseApplication { .. } => "ForceCloseApplication",
            Self::Scroll { .. } => "Scroll",
            Self::NoAction => "NoAction",
        }
    }

    /// Kinds that resolve an on-screen element and therefore need a target.
    pub fn is_targeted(&self) -> bool {
        matches!(
            self,
            Self::LeftClick
                | Self::RightClick
                | Self::DoubleClick
                | Self::WaitFor { .. }
                | Self::GetText
        )
    }

    fn string_arg_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::SendKeys { keys } | Self::PressKeys { keys } => Some(keys),
            Self::PasteText { text } => Some(text),
            Self::ActivateWindow { window_name }
            | Self::CloseWindow { window_name }
            | Self::MaximizeWindow { window_name }
            | Self::MinimizeWindow { window_name } => Some(window_name),
            Self::OpenApplication { app_name } => Some(app_name),
            Self::ForceCloseApplication { process_name } => Some(process_name),
            _ => None,
        }
    }

    /// The single string argument of untargeted kinds, with its keyword.
    fn string_arg(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::SendKeys { keys } | Self::PressKeys { keys } => Some(("keys", keys)),
            Self::PasteText { text } => Some(("text", text)),
            Self::ActivateWindow { window_name }
            | Self::CloseWindow { window_name }
            | Self::MaximizeWindow { window_name }
            | Self::MinimizeWindow { window_name } => Some(("window_name", window_name)),
            Self::OpenApplication { app_name } => Some(("app_name", app_name)),
            Self::ForceCloseApplication { process_name } => Some(("process_name", process_name)),
            _ => None,
        }
    }
}

/// A single UI action with its spatial qualifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<Anchor>,
    #[serde(default)]
    pub offset: Offset,
    /// Set once the action is committed (`.do()`) or has completed on the device.
    #[serde(default)]
    pub done: bool,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            anchors: Vec::new(),
            offset: Offset::default(),
            done: false,
        }
    }

    pub fn targeted(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            target: Some(Target::Text(target.into())),
            ..Self::new(kind)
        }
    }

    pub fn left_click(target: impl Into<String>) -> Self {
        Self::targeted(ActionKind::LeftClick, target)
    }

    pub fn double_click(target: impl Into<String>) -> Self {
        Self::targeted(ActionKind::DoubleClick, target)
    }

    pub fn right_click(target: impl Into<String>) -> Self {
        Self::targeted(ActionKind::RightClick, target)
    }

    pub fn send_keys(keys: impl Into<String>) -> Self {
        Self::new(ActionKind::SendKeys { keys: keys.into() })
    }

    pub fn press_keys(keys: impl Into<String>) -> Self {
        Self::new(ActionKind::PressKeys { keys: keys.into() })
    }

    pub fn activate_window(window_name: impl Into<String>) -> Self {
        Self::new(ActionKind::ActivateWindow {
            window_name: window_name.into(),
        })
    }

    pub fn close_window(window_name: impl Into<String>) -> Self {
        Self::new(ActionKind::CloseWindow {
            window_name: window_name.into(),
        })
    }

    pub fn scroll(clicks: i32) -> Self {
        Self::new(ActionKind::Scroll { clicks })
    }

    pub fn no_action() -> Self {
        Self::new(ActionKind::NoAction)
    }

    pub fn anchored(mut self, relation: AnchorRelation, value: impl Into<String>) -> Self {
        self.anchors.push(Anchor::new(relation, value));
        self
    }

    pub fn above(self, value: impl Into<String>) -> Self {
        self.anchored(AnchorRelation::Above, value)
    }

    pub fn below(self, value: impl Into<String>) -> Self {
        self.anchored(AnchorRelation::Below, value)
    }

    pub fn left(self, value: impl Into<String>) -> Self {
        self.anchored(AnchorRelation::Left, value)
    }

    pub fn right(self, value: impl Into<String>) -> Self {
        self.anchored(AnchorRelation::Right, value)
    }

    pub fn offset(mut self, dx: i32, dy: i32) -> Self {
        self.offset = Offset { dx, dy };
        self
    }

    pub fn committed(mut self) -> Self {
        self.done = true;
        self
    }

    /// Render the textual form. Anchor suffixes follow anchor order; the offset
    /// suffix only appears when non-zero; `.do()` only when `done` is set.
    pub fn render(&self) -> String {
        let mut out = format!("{}({})", self.kind.name(), self.render_args());
        for anchor in &self.anchors {
            out.push_str(&format!(
                ".{}({})",
                anchor.relation.as_str(),
                quote(&anchor.value)
            ));
        }
        if !self.offset.is_zero() {
            out.push_str(&format!(
                ".offset(x={}, y={})",
                self.offset.dx, self.offset.dy
            ));
        }
        if self.done {
            out.push_str(".do()");
        }
        out
    }

    fn render_args(&self) -> String {
        let mut args = Vec::new();
        if let Some(target) = &self.target {
            args.push(format!("{}={}", target.arg_name(), quote(target.as_str())));
        }
        match &self.kind {
            ActionKind::WaitFor {
                timeout_secs: Some(secs),
            } => args.push(format!("timeout={secs}")),
            ActionKind::Scroll { clicks } => args.push(format!("clicks={clicks}")),
            kind => {
                if let Some((name, value)) = kind.string_arg() {
                    args.push(format!("{name}={}", quote(value)));
                }
            }
        }
        args.join(", ")
    }

    /// Rewrite every string value (target, anchors, string argument) in
    /// place. The structure of the action is left untouched.
    pub fn try_map_text<E, F>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<String, E>,
    {
        if let Some(Target::Text(value) | Target::Named(value)) = &mut self.target {
            *value = f(value)?;
        }
        for anchor in &mut self.anchors {
            anchor.value = f(&anchor.value)?;
        }
        if let Some(value) = self.kind.string_arg_mut() {
            *value = f(value)?;
        }
        Ok(())
    }

    /// Structural checks the device agent relies on. Uniqueness of the target
    /// on screen is resolved device-side.
    pub fn validate(&self) -> Result<(), ActionValidationError> {
        let kind = self.kind.name();
        match (&self.target, self.kind.is_targeted()) {
            (None, true) => return Err(ActionValidationError::MissingTarget(kind)),
            (Some(target), true) if target.as_str().trim().is_empty() => {
                return Err(ActionValidationError::MissingTarget(kind));
            }
            (Some(_), false) => return Err(ActionValidationError::UnexpectedTarget(kind)),
            _ => {}
        }
        if !self.kind.is_targeted() && (!self.anchors.is_empty() || !self.offset.is_zero()) {
            return Err(ActionValidationError::UnexpectedTarget(kind));
        }
        if let Some((arg, value)) = self.kind.string_arg() {
            if value.trim().is_empty() {
                return Err(ActionValidationError::EmptyArgument { kind, arg });
            }
        }
        for anchor in &self.anchors {
            if !is_single_word(&anchor.value) {
                return Err(ActionValidationError::AnchorNotSingleWord(
                    anchor.value.clone(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let calls = split_calls(input)?;
        let mut calls = calls.into_iter();
        let (kind_name, args) = calls.next().ok_or(ActionParseError::Empty)?;
        let mut action = parse_head(&kind_name, &args)?;

        for (name, args) in calls {
            if let Some(relation) = AnchorRelation::parse(&name) {
                action.anchors.push(Anchor::new(relation, positional(&name, &args)?));
                continue;
            }
            match name.as_str() {
                "offset" => {
                    let kwargs = keyword_args(&name, &args)?;
                    action.offset = Offset {
                        dx: int_arg(&kwargs, &name, "x")?.unwrap_or(0),
                        dy: int_arg(&kwargs, &name, "y")?.unwrap_or(0),
                    };
                }
                "do" if args.trim().is_empty() => action.done = true,
                other => return Err(ActionParseError::UnknownModifier(other.to_string())),
            }
        }
        Ok(action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionParseError {
    #[error("empty action string")]
    Empty,
    #[error("malformed action string: {0}")]
    Malformed(String),
    #[error("unknown action kind: {0}")]
    UnknownKind(String),
    #[error("unknown action modifier: {0}")]
    UnknownModifier(String),
    #[error("{call} is missing argument '{arg}'")]
    MissingArgument { call: String, arg: &'static str },
    #[error("{call} has invalid argument: {detail}")]
    InvalidArgument { call: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionValidationError {
    #[error("{0} requires a non-empty target")]
    MissingTarget(&'static str),
    #[error("{0} does not take a target, anchors or offset")]
    UnexpectedTarget(&'static str),
    #[error("{kind} requires a non-empty '{arg}'")]
    EmptyArgument {
        kind: &'static str,
        arg: &'static str,
    },
    #[error("anchor '{0}' must be a single word")]
    AnchorNotSingleWord(String),
}

pub fn is_single_word(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(char::is_whitespace)
}

fn quote(value: &str) -> String {
    let delimiter = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(delimiter);
    for c in value.chars() {
        if c == '\\' || c == delimiter {
            out.push('\\');
        }
        out.push(c);
    }
    out.push(delimiter);
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, '\\' | '\'' | '"') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Split `Name(args).name(args)...` into calls, honouring quotes inside args.
fn split_calls(input: &str) -> Result<Vec<(String, String)>, ActionParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ActionParseError::Empty);
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let mut calls = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if !calls.is_empty() {
            if chars[i] != '.' {
                return Err(ActionParseError::Malformed(trimmed.to_string()));
            }
            i += 1;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        let name: String = chars[start..i].iter().collect();
        if name.is_empty() || i >= chars.len() || chars[i] != '(' {
            return Err(ActionParseError::Malformed(trimmed.to_string()));
        }
        i += 1;

        let args_start = i;
        let mut quote_char: Option<char> = None;
        while i < chars.len() {
            match (quote_char, chars[i]) {
                (None, '\'' | '"') => quote_char = Some(chars[i]),
                (Some(_), '\\') => i += 1,
                (Some(q), c) if c == q => quote_char = None,
                (None, ')') => break,
                _ => {}
            }
            i += 1;
        }
        if i >= chars.len() {
            return Err(ActionParseError::Malformed(trimmed.to_string()));
        }
        let args: String = chars[args_start..i].iter().collect();
        i += 1;
        calls.push((name, args));
    }
    Ok(calls)
}

/// Split on commas outside quotes.
fn split_args(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote_char: Option<char> = None;
    let mut escaped = false;
    for c in args.chars() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }
        match (quote_char, c) {
            (Some(_), '\\') => {
                escaped = true;
                current.push(c);
            }
            (None, '\'' | '"') => {
                quote_char = Some(c);
                current.push(c);
            }
            (Some(q), c) if c == q => {
                quote_char = None;
                current.push(c);
            }
            (None, ',') => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

#[derive(Debug)]
enum ArgValue {
    Str(String),
    Int(i64),
}

fn keyword_args(call: &str, args: &str) -> Result<Vec<(String, ArgValue)>, ActionParseError> {
    split_args(args)
        .iter()
        .map(|part| {
            let caps = KEYWORD_ARG
                .captures(part)
                .ok_or_else(|| ActionParseError::InvalidArgument {
                    call: call.to_string(),
                    detail: part.trim().to_string(),
                })?;
            let key = caps[1].to_string();
            let value = if let Some(s) = caps.get(2).or_else(|| caps.get(3)) {
                ArgValue::Str(unescape(s.as_str()))
            } else {
                let raw = &caps[4];
                ArgValue::Int(raw.parse().map_err(|_| ActionParseError::InvalidArgument {
                    call: call.to_string(),
                    detail: raw.to_string(),
                })?)
            };
            Ok((key, value))
        })
        .collect()
}

fn positional(call: &str, args: &str) -> Result<String, ActionParseError> {
    let caps = POSITIONAL_ARG
        .captures(args)
        .ok_or_else(|| ActionParseError::InvalidArgument {
            call: call.to_string(),
            detail: args.trim().to_string(),
        })?;
    Ok(caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| unescape(m.as_str()))
        .unwrap_or_default())
}

fn str_arg(
    kwargs: &[(String, ArgValue)],
    call: &str,
    key: &'static str,
) -> Result<Option<String>, ActionParseError> {
    match kwargs.iter().find(|(k, _)| k == key) {
        None => Ok(None),
        Some((_, ArgValue::Str(s))) => Ok(Some(s.clone())),
        Some((_, ArgValue::Int(n))) => Err(ActionParseError::InvalidArgument {
            call: call.to_string(),
            detail: format!("{key} must be a string, got {n}"),
        }),
    }
}

fn int_arg(
    kwargs: &[(String, ArgValue)],
    call: &str,
    key: &'static str,
) -> Result<Option<i32>, ActionParseError> {
    match kwargs.iter().find(|(k, _)| k == key) {
        None => Ok(None),
        Some((_, ArgValue::Int(n))) => {
            i32::try_from(*n)
                .map(Some)
                .map_err(|_| ActionParseError::InvalidArgument {
                    call: call.to_string(),
                    detail: format!("{key} out of range"),
                })
        }
        Some((_, ArgValue::Str(s))) => Err(ActionParseError::InvalidArgument {
            call: call.to_string(),
            detail: format!("{key} must be an integer, got '{s}'"),
        }),
    }
}

fn required(
    kwargs: &[(String, ArgValue)],
    call: &str,
    key: &'static str,
) -> Result<String, ActionParseError> {
    str_arg(kwargs, call, key)?.ok_or_else(|| ActionParseError::MissingArgument {
        call: call.to_string(),
        arg: key,
    })
}

fn parse_head(name: &str, args: &str) -> Result<Action, ActionParseError> {
    let kwargs = keyword_args(name, args)?;
    let kind = match name {
        "LeftClick" => ActionKind::LeftClick,
        "RightClick" => ActionKind::RightClick,
        "DoubleClick" => ActionKind::DoubleClick,
        "GetText" => ActionKind::GetText,
        "WaitFor" => ActionKind::WaitFor {
            timeout_secs: int_arg(&kwargs, name, "timeout")?
                .map(|secs| u64::try_from(secs.max(0)).unwrap_or_default()),
        },
        "SendKeys" => ActionKind::SendKeys {
            keys: required(&kwargs, name, "keys")?,
        },
        "PressKeys" => ActionKind::PressKeys {
            keys: required(&kwargs, name, "keys")?,
        },
        "PasteText" => ActionKind::PasteText {
            text: required(&kwargs, name, "text")?,
        },
        "ActivateWindow" => ActionKind::ActivateWindow {
            window_name: required(&kwargs, name, "window_name")?,
        },
        "CloseWindow" => ActionKind::CloseWindow {
            window_name: required(&kwargs, name, "window_name")?,
        },
        "MaximizeWindow" => ActionKind::MaximizeWindow {
            window_name: required(&kwargs, name, "window_name")?,
        },
        "MinimizeWindow" => ActionKind::MinimizeWindow {
            window_name: required(&kwargs, name, "window_name")?,
        },
        "OpenApplication" => ActionKind::OpenApplication {
            app_name: required(&kwargs, name, "app_name")?,
        },
        "ForceCloseApplication" => ActionKind::ForceCloseApplication {
            process_name: required(&kwargs, name, "process_name")?,
        },
        "Scroll" => ActionKind::Scroll {
            clicks: int_arg(&kwargs, name, "clicks")?.ok_or(
                ActionParseError::MissingArgument {
                    call: name.to_string(),
                    arg: "clicks",
                },
            )?,
        },
        "NoAction" => ActionKind::NoAction,
        other => return Err(ActionParseError::UnknownKind(other.to_string())),
    };

    let mut action = Action::new(kind);
    if action.kind.is_targeted() {
        action.target = match (
            str_arg(&kwargs, name, "target")?,
            str_arg(&kwargs, name, "target_name")?,
        ) {
            (Some(text), _) => Some(Target::Text(text)),
            (None, Some(named)) => Some(Target::Named(named)),
            (None, None) => None,
        };
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_anchors_has_no_anchor_suffix() {
        let action = Action::left_click("OK").committed();
        assert_eq!(action.render(), "LeftClick(target='OK').do()");
    }

    #[test]
    fn render_emits_anchor_suffixes_in_order() {
        let action = Action::left_click("OK")
            .below("Question")
            .left("Cancel")
            .above("Footer")
            .committed();
        assert_eq!(
            action.render(),
            "LeftClick(target='OK').below('Question').left('Cancel').above('Footer').do()"
        );
    }

    #[test]
    fn render_offset_only_when_non_zero() {
        let plain = Action::double_click("starten").right("Suche");
        assert!(!plain.render().contains("offset"));

        let shifted = plain.offset(12, -3);
        assert_eq!(
            shifted.render(),
            "DoubleClick(target='starten').right('Suche').offset(x=12, y=-3)"
        );
    }

    #[test]
    fn parse_prompt_vocabulary() {
        let cases = [
            (
                r#"LeftClick(target="OK").below("Question").left("Cancel").do()"#,
                Action::left_click("OK")
                    .below("Question")
                    .left("Cancel")
                    .committed(),
            ),
            (
                r#"SendKeys(keys="Hello").do()"#,
                Action::send_keys("Hello").committed(),
            ),
            (
                r#"PressKeys(keys="Alt+F4").do()"#,
                Action::press_keys("Alt+F4").committed(),
            ),
            (
                r#"CloseWindow(window_name="Calculator").do()"#,
                Action::close_window("Calculator").committed(),
            ),
            ("NoAction().do()", Action::no_action().committed()),
        ];
        for (input, expected) in cases {
            let parsed: Action = input.parse().expect(input);
            assert_eq!(parsed, expected, "{input}");
        }
    }

    #[test]
    fn parse_keeps_parens_and_commas_inside_quotes() {
        let parsed: Action = "SendKeys(keys='f(x), g').do()".parse().unwrap();
        assert_eq!(parsed.kind, ActionKind::SendKeys { keys: "f(x), g".into() });
    }

    #[test]
    fn parse_offset_and_named_target() {
        let parsed: Action = "RightClick(target_name='save_icon').offset(x=5, y=0)"
            .parse()
            .unwrap();
        assert_eq!(parsed.target, Some(Target::Named("save_icon".into())));
        assert_eq!(parsed.offset, Offset { dx: 5, dy: 0 });
        assert!(!parsed.done);
    }

    #[test]
    fn rendered_complex_action_parses_back() {
        let action = Action::targeted(
            ActionKind::WaitFor {
                timeout_secs: Some(30),
            },
            "Invoice",
        )
        .right("Number")
        .offset(0, 8)
        .committed();
        let parsed: Action = action.render().parse().unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn values_with_both_quote_kinds_parse_back() {
        let action = Action::send_keys(r#"He said "it's done""#).committed();
        let rendered = action.render();
        assert_eq!(rendered, r#"SendKeys(keys='He said "it\'s done"').do()"#);
        assert_eq!(rendered.parse::<Action>().unwrap(), action);

        let apostrophe = Action::left_click("O'Brien").below("Name");
        assert_eq!(apostrophe.render(), r#"LeftClick(target="O'Brien").below('Name')"#);
        assert_eq!(apostrophe.render().parse::<Action>().unwrap(), apostrophe);
    }

    #[test]
    fn backslashes_survive_render_and_raw_input() {
        let action = Action::activate_window(r"C:\Temp\");
        assert_eq!(action.render().parse::<Action>().unwrap(), action);

        let raw: Action = r"ActivateWindow(window_name='C:\Temp\new')".parse().unwrap();
        assert_eq!(raw, Action::activate_window(r"C:\Temp\new"));
    }

    #[test]
    fn try_map_text_rewrites_values_only() {
        let mut action: Action = "LeftClick(target='{{a}}').below('{{b}}').offset(x=3, y=0).do()"
            .parse()
            .unwrap();
        action
            .try_map_text(|value| Ok::<_, ()>(value.replace("{{a}}", "OK').offset(x=500, y=0").replace("{{b}}", "Menu")))
            .unwrap();

        assert_eq!(action.target, Some(Target::Text("OK').offset(x=500, y=0".into())));
        assert_eq!(action.anchors, vec![Anchor::new(AnchorRelation::Below, "Menu")]);
        assert_eq!(action.offset, Offset { dx: 3, dy: 0 });

        let mut keys = Action::send_keys("{{x}}");
        keys.try_map_text(|_| Ok::<_, ()>("typed".to_string())).unwrap();
        assert_eq!(keys.kind, ActionKind::SendKeys { keys: "typed".into() });
    }

    #[test]
    fn parse_rejects_unknown_kind_and_modifier() {
        assert_eq!(
            "Hover(target='x').do()".parse::<Action>().unwrap_err(),
            ActionParseError::UnknownKind("Hover".into())
        );
        assert_eq!(
            "LeftClick(target='x').near('y')".parse::<Action>().unwrap_err(),
            ActionParseError::UnknownModifier("near".into())
        );
        assert!(matches!(
            "SendKeys().do()".parse::<Action>().unwrap_err(),
            ActionParseError::MissingArgument { arg: "keys", .. }
        ));
        assert!(matches!(
            "LeftClick(target='x'".parse::<Action>().unwrap_err(),
            ActionParseError::Malformed(_)
        ));
    }

    #[test]
    fn validate_requires_target_for_clicks() {
        let action = Action::new(ActionKind::LeftClick);
        assert_eq!(
            action.validate(),
            Err(ActionValidationError::MissingTarget("LeftClick"))
        );
    }

    #[test]
    fn validate_rejects_multi_word_anchor() {
        let action = Action::left_click("OK").below("Are you sure");
        assert_eq!(
            action.validate(),
            Err(ActionValidationError::AnchorNotSingleWord("Are you sure".into()))
        );
    }

    #[test]
    fn validate_rejects_anchors_on_untargeted_kind() {
        let action = Action::send_keys("abc").below("Name");
        assert_eq!(
            action.validate(),
            Err(ActionValidationError::UnexpectedTarget("SendKeys"))
        );
        assert!(Action::send_keys("abc").validate().is_ok());
    }

    #[test]
    fn action_json_is_flat() {
        let json = serde_json::to_value(Action::left_click("OK").below("Name")).unwrap();
        assert_eq!(json["kind"], "LeftClick");
        assert_eq!(json["target"]["text"], "OK");
        assert_eq!(json["anchors"][0]["relation"], "below");
    }
}
