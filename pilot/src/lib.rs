//! Pilot - remote GUI automation core
//!
//! Drives a leased remote desktop over a WebSocket device agent, checks the
//! screen with a vision model, corrects course when the screen drifts from the
//! goal and, as a last resort, hands the step to a human operator.

pub mod config;
pub mod context;
pub mod device;
pub mod executor;
pub mod operator;
pub mod oracle;
pub mod pipeline;
pub mod recovery;
pub mod results;
pub mod script;
pub mod session;
pub mod states;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use executor::{ActionError, ActionExecutor, Disposition, Screen, ScreenSource};
pub use pipeline::{run_blocking, Automation, Pipeline, PipelineError, RunContext, ScriptedFlow, Services, StepReport};
pub use session::{Session, SessionController, SessionError};
pub use states::{ensure_state, State, StateRegistry, StateVariant};
