//! TOML flow scripts: the states to register and the steps to run.
//!
//! ```toml
//! name = "post-invoice"
//! group = "accounting"
//!
//! [[states]]
//! id = "invoice_list"
//! description = "Invoice list with the New button in the toolbar"
//! variant = "expected"
//! screenshots = ["refs/invoice_list.png"]
//!
//! [[steps]]
//! name = "open new invoice"
//! actions = ["LeftClick(target='New').below('Invoices').do()"]
//! expect = ["invoice_form"]
//!
//! [steps.recovery]
//! goal = "Open an empty invoice form"
//! ```
//!
//! Quoted values in action strings may reference run data as `{{field.path}}`.
//! The action string is parsed first and placeholders are filled into the
//! parsed values, so run data can never change the shape of an action.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use shared_types::{Action, ActionParseError, ActionValidationError};

use crate::states::{State, StateError, StateRegistry, StateVariant};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid flow script: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("step '{step}' action {index}: {source}")]
    Action {
        step: String,
        index: usize,
        #[source]
        source: ActionParseError,
    },
    #[error("step '{step}' action {index}: {source}")]
    InvalidAction {
        step: String,
        index: usize,
        #[source]
        source: ActionValidationError,
    },
    #[error("step '{step}' references {reason}")]
    Placeholder { step: String, reason: String },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowScript {
    pub name: String,
    /// Device group used when the CLI does not override it.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub states: Vec<StateEntry>,
    pub steps: Vec<StepEntry>,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateEntry {
    pub id: String,
    pub description: String,
    #[serde(default = "default_variant")]
    pub variant: StateVariant,
    #[serde(default)]
    pub screenshots: Vec<String>,
}

fn default_variant() -> StateVariant {
    StateVariant::Expected
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepEntry {
    pub name: String,
    /// Equivalent alternatives, tried in order.
    pub actions: Vec<String>,
    #[serde(default)]
    pub expect: Vec<String>,
    #[serde(default)]
    pub loading_timeout_secs: Option<u64>,
    #[serde(default)]
    pub recovery: Option<RecoveryPlan>,
    /// Escalate to an operator when the step cannot be completed.
    #[serde(default = "default_true")]
    pub escalate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryPlan {
    pub goal: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A step with its action strings resolved against run data.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub actions: Vec<Action>,
    pub expect: Vec<String>,
    pub loading_timeout: Option<Duration>,
    pub recovery: Option<RecoveryPlan>,
    pub escalate: bool,
}

impl FlowScript {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::parse(&text, base_dir)
    }

    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ScriptError> {
        let mut script: FlowScript = toml::from_str(text)?;
        script.base_dir = base_dir.into();
        Ok(script)
    }

    /// Structural checks that need no device: unique states, known
    /// expectations, parseable and valid actions.
    pub fn validate(&self) -> Result<(), ScriptError> {
        let registry = self.registry()?;
        if self.steps.is_empty() {
            return Err(ScriptError::Invalid(format!("flow '{}' has no steps", self.name)));
        }
        for entry in &self.steps {
            if entry.actions.is_empty() {
                return Err(ScriptError::Invalid(format!(
                    "step '{}' has no actions",
                    entry.name
                )));
            }
            registry.select(&entry.expect)?;
            for (index, raw) in entry.actions.iter().enumerate() {
                let action: Action = raw.parse().map_err(|source| ScriptError::Action {
                    step: entry.name.clone(),
                    index,
                    source,
                })?;
                if !raw.contains("{{") {
                    action.validate().map_err(|source| ScriptError::InvalidAction {
                        step: entry.name.clone(),
                        index,
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Register every declared state; relative screenshot paths resolve
    /// against the script's directory.
    pub fn registry(&self) -> Result<StateRegistry, ScriptError> {
        let mut registry = StateRegistry::new();
        for entry in &self.states {
            let mut state = State::new(entry.id.clone(), entry.description.clone(), entry.variant.clone());
            for reference in &entry.screenshots {
                state = state.with_screenshot(self.resolve_reference(reference));
            }
            registry.register(state)?;
        }
        Ok(registry)
    }

    /// Steps with placeholders filled from `data`.
    pub fn steps(&self, data: &Value) -> Result<Vec<Step>, ScriptError> {
        self.steps.iter().map(|entry| entry.resolve(data)).collect()
    }

    fn resolve_reference(&self, reference: &str) -> String {
        if reference.contains("://") || reference.starts_with("data:") || Path::new(reference).is_absolute() {
            return reference.to_string();
        }
        self.base_dir.join(reference).to_string_lossy().into_owned()
    }
}

impl StepEntry {
    fn resolve(&self, data: &Value) -> Result<Step, ScriptError> {
        let actions = self
            .actions
            .iter()
            .enumerate()
            .map(|(index, template)| {
                let mut action = template.parse::<Action>().map_err(|source| ScriptError::Action {
                    step: self.name.clone(),
                    index,
                    source,
                })?;
                action
                    .try_map_text(|value| fill_placeholders(value, data))
                    .map_err(|reason| ScriptError::Placeholder {
                        step: self.name.clone(),
                        reason,
                    })?;
                Ok(action)
            })
            .collect::<Result<Vec<_>, ScriptError>>()?;

        Ok(Step {
            name: self.name.clone(),
            actions,
            expect: self.expect.clone(),
            loading_timeout: self.loading_timeout_secs.map(Duration::from_secs),
            recovery: self.recovery.clone(),
            escalate: self.escalate,
        })
    }
}

/// Replace `{{a.b.c}}` with the string form of `data.a.b.c`.
pub fn fill_placeholders(template: &str, data: &Value) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
        let path = after[..end].trim();
        let pointer = format!("/{}", path.replace('.', "/"));
        let value = data
            .pointer(&pointer)
            .ok_or_else(|| format!("missing run data field '{path}'"))?;
        match value {
            Value::String(s) => out.push_str(s),
            Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
