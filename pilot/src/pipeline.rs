//! Run pipeline: one session per run, steps driven through fallback,
//! recovery and escalation.
//!
//! ```text
//! try_actions ── ok ──> ensure_state ── true ──> Completed
//!      │                    │
//!   retryable             false
//!      └──────────┬─────────┘
//!                 v
//!        course correction (max turns) ── reached ──> Recovered
//!                 │              └── interrupt ──> Interrupted (fatal)
//!             exhausted
//!                 v
//!        operator escalation ── performed ──> Escalated
//!                 └── raise / timeout / disabled ──> StepFailed
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use shared_types::{ActionKind, RunOutcome, RunPayload};

use crate::config::Config;
use crate::executor::{ActionError, ActionExecutor, Disposition, Timeouts};
use crate::operator::{EscalationRequest, OperatorEscalation};
use crate::oracle::{HttpModelGateway, OracleError, SharedModelGateway, StateOracle};
use crate::recovery::CourseCorrector;
use crate::script::{FlowScript, RecoveryPlan, ScriptError, Step};
use crate::session::{Session, SessionController, SessionError};
use crate::states::{ensure_state, StateError, StateRegistry};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("step '{step}' failed: {diagnostic}")]
    StepFailed { step: String, diagnostic: String },
    #[error("run interrupted: {observation}")]
    Interrupted { observation: String },
    #[error(transparent)]
    Automation(#[from] anyhow::Error),
    #[error("cannot start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// How a step reached its goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepReport {
    Completed { action_index: usize },
    Recovered { turns: usize },
    Escalated,
}

enum Correction {
    Reached { turns: usize },
    Exhausted { diagnostic: String },
}

/// The body of a run, executed inside an open session.
#[async_trait]
pub trait Automation: Send + Sync {
    /// Device group to allocate from.
    fn group(&self, payload: &RunPayload) -> String;

    async fn run(&self, ctx: &mut RunContext<'_>, payload: &RunPayload) -> Result<Value, PipelineError>;
}

/// Shared collaborators for every run of a pipeline.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub oracle: Arc<StateOracle>,
    pub registry: Arc<StateRegistry>,
    pub recovery_gateway: SharedModelGateway,
    pub escalation: Option<Arc<OperatorEscalation>>,
}

impl Services {
    pub fn new(config: Config, gateway: SharedModelGateway, registry: StateRegistry) -> Self {
        let oracle = StateOracle::from_config(gateway.clone(), &config);
        Self {
            config: Arc::new(config),
            oracle: Arc::new(oracle),
            registry: Arc::new(registry),
            recovery_gateway: gateway,
            escalation: None,
        }
    }

    pub fn with_escalation(mut self, escalation: OperatorEscalation) -> Self {
        self.escalation = Some(Arc::new(escalation));
        self
    }
}

/// Everything a run body needs while its session is open.
pub struct RunContext<'s> {
    executor: ActionExecutor<'s>,
    services: Services,
    run_id: String,
    client: Option<String>,
}

impl<'s> RunContext<'s> {
    pub fn new(session: &'s mut Session, services: Services, payload: &RunPayload) -> Self {
        let timeouts = Timeouts::from_config(&services.config);
        Self {
            executor: ActionExecutor::new(session, timeouts),
            services,
            run_id: payload.run_id.clone(),
            client: payload.client_name.clone(),
        }
    }

    pub fn executor(&mut self) -> &mut ActionExecutor<'s> {
        &mut self.executor
    }

    pub fn oracle(&self) -> &StateOracle {
        &self.services.oracle
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.services.registry
    }

    /// `ensure_state` against registered states; `recheck` defaults to the
    /// configured loading wait.
    pub async fn ensure(&mut self, expect: &[String], recheck: Option<Duration>) -> Result<bool, PipelineError> {
        let states = self.services.registry.select(expect)?;
        let recheck = recheck.unwrap_or(self.services.config.loading_recheck);
        Ok(ensure_state(&self.services.oracle, &mut self.executor, states.into(), recheck).await?)
    }

    /// Drive one step through fallback, recovery and escalation.
    pub async fn execute_step(&mut self, step: &Step) -> Result<StepReport, PipelineError> {
        tracing::info!(step = %step.name, alternatives = step.actions.len(), "Executing step");
        let mut actions = step.actions.clone();

        let diagnostic = match self.executor.try_actions(&mut actions).await {
            Ok(index) if step.expect.is_empty() => return Ok(StepReport::Completed { action_index: index }),
            Ok(index) => match self.ensure(&step.expect, step.loading_timeout).await {
                Ok(true) => return Ok(StepReport::Completed { action_index: index }),
                Ok(false) => format!(
                    "{} succeeded but the screen is not in any of {:?}",
                    actions[index], step.expect
                ),
                Err(e) => format!("state check after {} failed: {e}", actions[index]),
            },
            Err(e) if e.disposition() == Disposition::Fatal => {
                tracing::error!(step = %step.name, error = %e, "Fatal action failure");
                return Err(e.into());
            }
            Err(e) => e.to_string(),
        };
        tracing::warn!(step = %step.name, diagnostic = %diagnostic, "Step did not reach its goal");

        let diagnostic = match &step.recovery {
            Some(plan) => match self.correct_course(plan, &step.expect, &diagnostic).await? {
                Correction::Reached { turns } => return Ok(StepReport::Recovered { turns }),
                Correction::Exhausted { diagnostic } => diagnostic,
            },
            None => diagnostic,
        };

        self.escalate_or_fail(step, diagnostic).await
    }

    /// Let the course corrector propose actions until the expected state is
    /// reached, it reports the goal reached, or the turn budget runs out.
    async fn correct_course(
        &mut self,
        plan: &RecoveryPlan,
        expect: &[String],
        diagnostic: &str,
    ) -> Result<Correction, PipelineError> {
        let max_turns = self.services.config.recovery_max_turns;
        let mut corrector = CourseCorrector::from_config(
            self.services.recovery_gateway.clone(),
            &self.services.config,
            plan.goal.clone(),
        )
        .with_custom_instructions(plan.instructions.clone());
        corrector.add_feedback(format!("The previous attempt failed: {diagnostic}"));
        let mut last = diagnostic.to_string();

        for turn in 1..=max_turns {
            let proposals = match corrector.get_corrective_actions(&mut self.executor).await {
                Ok(proposals) => proposals,
                Err(e) => {
                    tracing::warn!(turn, error = %e, "Course correction unavailable");
                    last = format!("course correction failed: {e}");
                    break;
                }
            };
            corrector.reset_feedback();

            for proposal in proposals {
                if proposal.interrupt {
                    tracing::error!(turn, observation = %proposal.observation, "Course correction interrupted the run");
                    return Err(PipelineError::Interrupted {
                        observation: proposal.observation,
                    });
                }

                let mut action = proposal.proposed_action;
                let goal_claimed = matches!(action.kind, ActionKind::NoAction);
                if !goal_claimed {
                    match self.executor.perform(&mut action).await {
                        Ok(_) => {}
                        Err(e) if e.disposition() == Disposition::Fatal => return Err(e.into()),
                        Err(e) => {
                            last = format!("{action} failed: {e}");
                            corrector.add_feedback(last.clone());
                            continue;
                        }
                    }
                }

                if expect.is_empty() {
                    if goal_claimed {
                        return Ok(Correction::Reached { turns: turn });
                    }
                    continue;
                }
                match self.ensure(expect, None).await {
                    Ok(true) => return Ok(Correction::Reached { turns: turn }),
                    Ok(false) => {
                        last = format!(
                            "after {action} the screen is still not in any of {expect:?}; observed: {}",
                            proposal.observation
                        );
                        corrector.add_feedback(format!("{action} did not reach the goal"));
                    }
                    Err(e) => {
                        last = format!("state check after {action} failed: {e}");
                        corrector.add_feedback(last.clone());
                    }
                }
            }
        }

        tracing::warn!(turns = corrector.turns().len(), diagnostic = %last, "Course correction exhausted");
        Ok(Correction::Exhausted { diagnostic: last })
    }

    /// Hand the step to an operator when enabled; `performed` suppresses the
    /// failure, anything else propagates it.
    async fn escalate_or_fail(&mut self, step: &Step, diagnostic: String) -> Result<StepReport, PipelineError> {
        let escalation = match &self.services.escalation {
            Some(escalation) if step.escalate && self.services.config.use_operator => escalation.clone(),
            _ => {
                return Err(PipelineError::StepFailed {
                    step: step.name.clone(),
                    diagnostic,
                })
            }
        };

        let request = EscalationRequest {
            title: format!("Step '{}' failed", step.name),
            description: diagnostic.clone(),
            timeout: self.services.config.operator_timeout(),
            run_id: Some(self.run_id.clone()),
            client: self.client.clone(),
            attachments: Vec::new(),
        };
        if escalation.create_issue_and_wait(request).await {
            tracing::info!(step = %step.name, "Operator performed the step");
            return Ok(StepReport::Escalated);
        }
        Err(PipelineError::StepFailed {
            step: step.name.clone(),
            diagnostic: format!("{diagnostic}; operator did not resolve the issue"),
        })
    }
}

pub struct Pipeline {
    sessions: SessionController,
    services: Services,
}

impl Pipeline {
    pub fn new(sessions: SessionController, services: Services) -> Self {
        Self { sessions, services }
    }

    /// Production wiring: HTTP device manager, WebSocket transport, HTTP
    /// model gateway, and the operator queue when `USE_OPERATOR` is set.
    pub fn from_config(config: Config, registry: StateRegistry) -> Self {
        let gateway: SharedModelGateway = Arc::new(HttpModelGateway::new(
            config.oracle.base_url.clone(),
            config.oracle.api_key_env.clone(),
        ));
        let sessions = SessionController::from_config(&config);
        let mut services = Services::new(config, gateway, registry);
        if services.config.use_operator {
            let escalation = OperatorEscalation::from_config(&services.config);
            services = services.with_escalation(escalation);
        }
        Self::new(sessions, services)
    }

    /// Run `automation` in a fresh session and fold the result into an
    /// outcome. The session is released on every path.
    pub async fn run(&self, automation: Arc<dyn Automation>, payload: RunPayload) -> RunOutcome {
        let run_id = payload.run_id.clone();
        match self.execute(automation, payload).await {
            Ok(data) => {
                tracing::info!(run_id = %run_id, "Run succeeded");
                RunOutcome::succeeded(data)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Run failed");
                RunOutcome::failed(e.to_string())
            }
        }
    }

    pub async fn execute(&self, automation: Arc<dyn Automation>, payload: RunPayload) -> Result<Value, PipelineError> {
        let group = automation.group(&payload);
        let correlation_id = payload.run_id.clone();
        let services = self.services.clone();

        self.sessions
            .with_session(&group, &correlation_id, move |session| {
                async move {
                    let mut ctx = RunContext::new(session, services, &payload);
                    automation.run(&mut ctx, &payload).await
                }
                .boxed()
            })
            .await
    }
}

/// Synchronous entry point: a current-thread runtime for exactly one run,
/// shut down before returning.
pub fn run_blocking(
    pipeline: &Pipeline,
    automation: Arc<dyn Automation>,
    payload: RunPayload,
) -> Result<RunOutcome, PipelineError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(PipelineError::Runtime)?;
    let outcome = runtime.block_on(pipeline.run(automation, payload));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(outcome)
}

/// A flow script as a run body.
pub struct ScriptedFlow {
    script: FlowScript,
    group: Option<String>,
}

impl ScriptedFlow {
    pub fn new(script: FlowScript) -> Self {
        Self { script, group: None }
    }

    /// Allocate from `group` instead of the script's group.
    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }
}

#[async_trait]
impl Automation for ScriptedFlow {
    fn group(&self, _payload: &RunPayload) -> String {
        self.group
            .clone()
            .or_else(|| self.script.group.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    async fn run(&self, ctx: &mut RunContext<'_>, payload: &RunPayload) -> Result<Value, PipelineError> {
        let steps = self.script.steps(&payload.structured_data)?;
        let mut reports = Vec::with_capacity(steps.len());
        for step in &steps {
            let report = ctx.execute_step(step).await?;
            tracing::info!(step = %step.name, report = ?report, "Step done");
            reports.push(json!({ "step": step.name, "report": report }));
        }
        Ok(json!({ "flow": self.script.name, "steps": reports }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AgentBehavior, FakeAgent, FakeOperatorQueue, ScriptedGateway};
    use crate::states::State;
    use shared_types::{Action, IssueResolution};

    fn registry() -> StateRegistry {
        let mut registry = StateRegistry::new();
        registry.register(State::expected("invoice_list", "Invoice list")).unwrap();
        registry.register(State::unexpected("error", "Error dialog")).unwrap();
        registry
    }

    fn services(gateway: &ScriptedGateway, config: Config) -> Services {
        Services::new(config, Arc::new(gateway.clone()), registry())
    }

    fn payload() -> RunPayload {
        RunPayload {
            run_id: "run-test".into(),
            client_name: Some("acme".into()),
            ..RunPayload::default()
        }
    }

    fn step(actions: Vec<Action>) -> Step {
        Step {
            name: "save".into(),
            actions,
            expect: Vec::new(),
            loading_timeout: None,
            recovery: None,
            escalate: true,
        }
    }

    fn state(id: &str) -> Value {
        json!({"id": id, "description": id})
    }

    fn correction(action: &str, interrupt: bool) -> Value {
        json!({
            "action_string": action,
            "action_comment": "",
            "observation": "dialog blocks the form",
            "interrupt_process": interrupt
        })
    }

    #[test]
    fn from_config_wires_operator_only_when_enabled() {
        let without = Pipeline::from_config(Config::default(), registry());
        assert!(without.services.escalation.is_none());

        let config = Config {
            use_operator: true,
            ..Config::default()
        };
        let with = Pipeline::from_config(config, registry());
        assert!(with.services.escalation.is_some());
        assert!(with.services.config.use_operator);
    }

    #[tokio::test(start_paused = true)]
    async fn first_working_alternative_completes_step() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![]);
        let mut ctx = RunContext::new(&mut session, services(&gateway, Config::default()), &payload());

        let report = ctx
            .execute_step(&step(vec![Action::left_click("Save"), Action::press_keys("Ctrl+S")]))
            .await
            .unwrap();

        assert_eq!(report, StepReport::Completed { action_index: 1 });
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expected_state_is_checked_after_actions() {
        let (mut session, _agent) = FakeAgent::session(vec![]);
        let gateway = ScriptedGateway::new(vec![Ok(state("invoice_list"))]);
        let mut ctx = RunContext::new(&mut session, services(&gateway, Config::default()), &payload());
        let mut step = step(vec![Action::left_click("Save")]);
        step.expect = vec!["invoice_list".into()];

        let report = ctx.execute_step(&step).await.unwrap();

        assert_eq!(report, StepReport::Completed { action_index: 0 });
        assert_eq!(gateway.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reaches_expected_state() {
        let (mut session, agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![
            Ok(correction("LeftClick(target='Invoices').do()", false)),
            Ok(state("invoice_list")),
        ]);
        let mut ctx = RunContext::new(&mut session, services(&gateway, Config::default()), &payload());
        let mut step = step(vec![Action::left_click("Save")]);
        step.expect = vec!["invoice_list".into()];
        step.recovery = Some(RecoveryPlan {
            goal: "Return to the invoice list".into(),
            instructions: None,
        });

        let report = ctx.execute_step(&step).await.unwrap();

        assert_eq!(report, StepReport::Recovered { turns: 1 });
        let first_call = &gateway.calls()[0];
        assert!(first_call.messages[2].text().contains("not found"));
        let performed: Vec<_> = agent
            .sent()
            .into_iter()
            .filter(|r| matches!(r.command, shared_types::DeviceCommand::Perform { .. }))
            .collect();
        assert_eq!(performed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_bypasses_escalation() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![Ok(correction("NoAction().do()", true))]);
        let queue = FakeOperatorQueue::with_statuses(vec![IssueResolution::Performed]);
        let config = Config {
            use_operator: true,
            ..Config::default()
        };
        let services = services(&gateway, config).with_escalation(OperatorEscalation::new(Arc::new(queue.clone())));
        let mut ctx = RunContext::new(&mut session, services, &payload());
        let mut step = step(vec![Action::left_click("Save")]);
        step.recovery = Some(RecoveryPlan {
            goal: "Save the invoice".into(),
            instructions: None,
        });

        let err = ctx.execute_step(&step).await.unwrap_err();

        assert!(matches!(err, PipelineError::Interrupted { ref observation } if observation == "dialog blocks the form"));
        assert!(queue.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_step_escalates_when_enabled() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![]);
        let queue = FakeOperatorQueue::with_statuses(vec![IssueResolution::Pending, IssueResolution::Performed]);
        let config = Config {
            use_operator: true,
            ..Config::default()
        };
        let services = services(&gateway, config).with_escalation(OperatorEscalation::new(Arc::new(queue.clone())));
        let mut ctx = RunContext::new(&mut session, services, &payload());

        let report = ctx.execute_step(&step(vec![Action::left_click("Save")])).await.unwrap();

        assert_eq!(report, StepReport::Escalated);
        let created = queue.created();
        assert_eq!(created[0].title, "Step 'save' failed");
        assert!(created[0].description.contains("not found"));
        assert_eq!(created[0].client_name.as_deref(), Some("acme"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_operator_propagates_last_diagnostic() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![]);
        let queue = FakeOperatorQueue::with_statuses(vec![IssueResolution::Performed]);
        let services = services(&gateway, Config::default()).with_escalation(OperatorEscalation::new(Arc::new(queue.clone())));
        let mut ctx = RunContext::new(&mut session, services, &payload());

        let err = ctx.execute_step(&step(vec![Action::left_click("Save")])).await.unwrap_err();

        assert!(matches!(err, PipelineError::StepFailed { ref diagnostic, .. } if diagnostic.contains("not found")));
        assert!(queue.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn raised_issue_propagates_failure() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![]);
        let queue = FakeOperatorQueue::with_statuses(vec![IssueResolution::Raise]);
        let config = Config {
            use_operator: true,
            ..Config::default()
        };
        let services = services(&gateway, config).with_escalation(OperatorEscalation::new(Arc::new(queue)));
        let mut ctx = RunContext::new(&mut session, services, &payload());

        let err = ctx.execute_step(&step(vec![Action::left_click("Save")])).await.unwrap_err();

        assert!(matches!(err, PipelineError::StepFailed { ref diagnostic, .. } if diagnostic.contains("operator did not resolve")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_action_is_fatal_without_escalation() {
        let (mut session, agent) = FakeAgent::session(vec![]);
        let gateway = ScriptedGateway::new(vec![]);
        let queue = FakeOperatorQueue::with_statuses(vec![IssueResolution::Performed]);
        let config = Config {
            use_operator: true,
            ..Config::default()
        };
        let services = services(&gateway, config).with_escalation(OperatorEscalation::new(Arc::new(queue.clone())));
        let mut ctx = RunContext::new(&mut session, services, &payload());

        let err = ctx
            .execute_step(&step(vec![Action::left_click("OK").below("two words")]))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Action(ActionError::InvalidAction { .. })));
        assert!(agent.sent().is_empty());
        assert!(queue.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_without_expectations_stops_on_no_action() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Fail("not found".into())]);
        let gateway = ScriptedGateway::new(vec![
            Ok(correction("PressKeys(keys='Escape').do()", false)),
            Ok(correction("NoAction().do()", false)),
        ]);
        let mut ctx = RunContext::new(&mut session, services(&gateway, Config::default()), &payload());
        let mut step = step(vec![Action::left_click("Save")]);
        step.recovery = Some(RecoveryPlan {
            goal: "Close the dialog".into(),
            instructions: Some("Escape closes dialogs".into()),
        });

        let report = ctx.execute_step(&step).await.unwrap();

        assert_eq!(report, StepReport::Recovered { turns: 2 });
    }
}
