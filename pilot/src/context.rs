//! Process-wide execution context for the open session.
//!
//! Holds the run's correlation id and the leased device while a session is
//! open so log lines and device requests can be tied back to the run. The
//! session publishes on open and clears on close.

use std::sync::RwLock;

use once_cell::sync::Lazy;

static CURRENT: Lazy<RwLock<Option<RunScope>>> = Lazy::new(|| RwLock::new(None));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    pub correlation_id: String,
    pub device_id: String,
    pub device_name: String,
}

pub fn publish(scope: RunScope) {
    let mut guard = CURRENT.write().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = guard.as_ref() {
        tracing::warn!(
            previous = %previous.correlation_id,
            next = %scope.correlation_id,
            "Replacing an execution context that was never cleared"
        );
    }
    *guard = Some(scope);
}

pub fn current() -> Option<RunScope> {
    CURRENT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn correlation_id() -> Option<String> {
    current().map(|scope| scope.correlation_id)
}

/// Clear the context if it still belongs to `correlation_id`.
pub fn clear(correlation_id: &str) {
    let mut guard = CURRENT.write().unwrap_or_else(|e| e.into_inner());
    if guard
        .as_ref()
        .is_some_and(|scope| scope.correlation_id == correlation_id)
    {
        *guard = None;
    }
}
