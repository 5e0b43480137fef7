//! Screen-state catalog and state checks.
//!
//! States are registered explicitly at startup (usually from the flow script)
//! and handed to the oracle as candidates for classification.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ScreenSource;
use crate::oracle::{OracleError, StateOracle};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateVariant {
    Expected,
    Loading,
    Unexpected,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub description: String,
    /// URLs or local image paths, in prompt order.
    #[serde(default)]
    pub example_screenshots: Vec<String>,
    pub variant: StateVariant,
}

impl State {
    pub fn new(id: impl Into<String>, description: impl Into<String>, variant: StateVariant) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            example_screenshots: Vec::new(),
            variant,
        }
    }

    pub fn expected(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, StateVariant::Expected)
    }

    pub fn loading(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, StateVariant::Loading)
    }

    pub fn unexpected(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(id, description, StateVariant::Unexpected)
    }

    pub fn with_screenshot(mut self, reference: impl Into<String>) -> Self {
        self.example_screenshots.push(reference.into());
        self
    }

    pub fn candidate(&self) -> StateCandidate {
        StateCandidate {
            id: self.id.clone(),
            description: self.description.clone(),
        }
    }
}

/// `{id, description}` pair used in classification prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCandidate {
    pub id: String,
    pub description: String,
}

impl StateCandidate {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub state_id: String,
    pub description: String,
    pub variant: StateVariant,
}

impl ClassificationResult {
    pub fn is_expected(&self) -> bool {
        self.variant == StateVariant::Expected
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state '{0}' is already registered")]
    Duplicate(String),
    #[error("unknown state '{0}'")]
    Unknown(String),
}

#[derive(Debug, Clone, Default)]
pub struct StateRegistry {
    states: Vec<State>,
    index: HashMap<String, usize>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, state: State) -> Result<(), StateError> {
        if self.index.contains_key(&state.id) {
            return Err(StateError::Duplicate(state.id));
        }
        self.index.insert(state.id.clone(), self.states.len());
        self.states.push(state);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&State> {
        self.index.get(id).map(|&i| &self.states[i])
    }

    /// All states in registration order.
    pub fn candidates(&self) -> Vec<StateCandidate> {
        self.states.iter().map(State::candidate).collect()
    }

    /// Resolve ids to states, preserving the given order.
    pub fn select<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<State>, StateError> {
        ids.iter()
            .map(|id| {
                self.get(id.as_ref())
                    .cloned()
                    .ok_or_else(|| StateError::Unknown(id.as_ref().to_string()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }
}

/// Candidate states for a check: given up front or produced at call time.
pub enum StateSource<'a> {
    Fixed(Vec<State>),
    Deferred(Box<dyn Fn() -> Vec<State> + Send + Sync + 'a>),
}

impl<'a> StateSource<'a> {
    pub fn deferred(producer: impl Fn() -> Vec<State> + Send + Sync + 'a) -> Self {
        Self::Deferred(Box::new(producer))
    }

    pub fn resolve(&self) -> Vec<State> {
        match self {
            Self::Fixed(states) => states.clone(),
            Self::Deferred(producer) => producer(),
        }
    }
}

impl From<Vec<State>> for StateSource<'_> {
    fn from(states: Vec<State>) -> Self {
        Self::Fixed(states)
    }
}

/// Check that the screen is in an expected state, waiting out one loading
/// screen.
///
/// `Expected` on the first check returns `true` immediately. `Loading` sleeps
/// `recheck` and verifies exactly once more; only `Expected` then counts.
pub async fn ensure_state(
    oracle: &StateOracle,
    screen: &mut dyn ScreenSource,
    states: StateSource<'_>,
    recheck: Duration,
) -> Result<bool, OracleError> {
    let states = states.resolve();
    let first = oracle.verify_state(screen, &states).await?;
    match first.variant {
        StateVariant::Expected => return Ok(true),
        StateVariant::Loading => {}
        _ => {
            tracing::info!(state = %first.state_id, variant = ?first.variant, "Screen not in expected state");
            return Ok(false);
        }
    }

    tracing::info!(state = %first.state_id, wait_secs = recheck.as_secs(), "Screen loading, rechecking once");
    tokio::time::sleep(recheck).await;

    let second = oracle.verify_state(screen, &states).await?;
    if !second.is_expected() {
        tracing::info!(state = %second.state_id, variant = ?second.variant, "Screen not in expected state after loading");
    }
    Ok(second.is_expected())
}
