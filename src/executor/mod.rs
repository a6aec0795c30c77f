//! Milestone and plan execution.
//!
//! [`RunContext`] bundles the collaborators every loop needs (agent, check
//! runner, observer, pause gate, abort flag, execution log) so nothing is
//! held in ambient state. [`invoke`] is the single path to the agent: it
//! wraps the call in the post-execution auditor, forwards live events and
//! updates the session's counters and resume token.

pub mod milestone;
pub mod plan;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent::{AgentError, AgentRequest, AgentRunner, StreamEvent};
use crate::audit::{AuditedRun, SecurityEvent, run_audited};
use crate::budget;
use crate::checks::CheckRunner;
use crate::log::{ExecutionLog, LogEvent};
use crate::observer::Observer;
use crate::pause::PauseController;
use crate::session::Session;

pub use milestone::{MilestoneOutcome, execute_milestone};
pub use plan::{PlanSummary, run_plan};

/// Tunables that are not part of the persisted session config.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub agent_timeout: Duration,
    pub qa_timeout: Duration,
    pub qa_enabled: bool,
    pub qa_auto_fix: bool,
    pub allowed_tools: Vec<String>,
    pub max_budget_per_prompt: Option<f64>,
    pub env: Vec<(String, String)>,
    pub git_isolation: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(30 * 60),
            qa_timeout: Duration::from_secs(10 * 60),
            qa_enabled: true,
            qa_auto_fix: true,
            allowed_tools: Vec::new(),
            max_budget_per_prompt: None,
            env: Vec::new(),
            git_isolation: true,
        }
    }
}

/// Collaborators threaded through every executor call.
pub struct RunContext<'a> {
    pub project_root: PathBuf,
    pub agent: &'a dyn AgentRunner,
    pub checks: &'a dyn CheckRunner,
    pub observer: &'a dyn Observer,
    pub pause: PauseController,
    pub abort: Arc<AtomicBool>,
    pub log: Option<&'a ExecutionLog>,
    pub options: ExecutorOptions,
}

impl<'a> RunContext<'a> {
    pub fn new(
        project_root: impl Into<PathBuf>,
        agent: &'a dyn AgentRunner,
        checks: &'a dyn CheckRunner,
        observer: &'a dyn Observer,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            agent,
            checks,
            observer,
            pause: PauseController::new(),
            abort: Arc::new(AtomicBool::new(false)),
            log: None,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_pause(mut self, pause: PauseController) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_log(mut self, log: &'a ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Append to the execution log. Log failures never stop a run.
    pub fn record(&self, event: LogEvent) {
        if let Some(log) = self.log {
            if let Err(e) = log.log(event) {
                warn!(error = %e, "failed to write execution log");
            }
        }
    }

    /// Surface a security event to the observer and the log.
    pub fn security(&self, event: &SecurityEvent) {
        self.observer.security_event(event);
        self.record(LogEvent::Security {
            kind: event.kind.to_string(),
            message: event.message.clone(),
            command: event.command.clone(),
        });
    }
}

/// Which loop issued an agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Milestone,
    Fix,
    Qa,
    QaFix,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Milestone => "milestone",
            Phase::Fix => "fix",
            Phase::Qa => "qa",
            Phase::QaFix => "qa_fix",
        }
    }
}

/// Run one prompt through the audited agent.
///
/// Counts the prompt and its reported cost (unless the process never
/// started), adopts the returned resume token and reports progress.
pub fn invoke(
    ctx: &RunContext<'_>,
    session: &mut Session,
    prompt: String,
    phase: Phase,
    timeout: Duration,
) -> AuditedRun {
    let mut request = AgentRequest::new(prompt, ctx.project_root.clone());
    request.resume_token = session.state.session_id.clone();
    request.max_budget_usd = ctx.options.max_budget_per_prompt;
    request.allowed_tools = ctx.options.allowed_tools.clone();
    request.env = ctx.options.env.clone();
    request.timeout = Some(timeout);
    request.abort = Some(Arc::clone(&ctx.abort));

    debug!(phase = phase.as_str(), agent = ctx.agent.name(), "invoking agent");

    let mut on_event = |event: StreamEvent| {
        ctx.observer.agent_event(&event);
        ctx.record(LogEvent::AgentOutput {
            line: event.text().to_string(),
        });
    };
    let mut on_security = |event: SecurityEvent| ctx.security(&event);
    let run = run_audited(ctx.agent, &request, &mut on_event, &mut on_security);

    match &run.response {
        Ok(response) => {
            session.state.record_prompt(response.cost.total_usd);
            if let Some(token) = &response.session_id {
                session.state.session_id = Some(token.clone());
            }
            ctx.record(LogEvent::AgentInvoked {
                phase: phase.as_str().to_string(),
                success: response.success,
                cost_usd: response.cost.total_usd,
                num_turns: response.num_turns,
                duration_ms: response.duration_ms,
                error: response.errors.first().cloned(),
            });
        }
        Err(e) => {
            if !matches!(e, AgentError::Spawn { .. }) {
                session.state.record_prompt(0.0);
            }
            ctx.record(LogEvent::AgentInvoked {
                phase: phase.as_str().to_string(),
                success: false,
                cost_usd: 0.0,
                num_turns: 0,
                duration_ms: 0,
                error: Some(e.to_string()),
            });
        }
    }

    ctx.observer.progress(
        budget::estimated_cost(&session.state),
        session.config.max_cost,
        session.state.prompt_count,
    );
    run
}

/// Run the budget and prompt-count gates. Returns the blocking message, if
/// any; warnings are surfaced and logged.
pub fn gate(ctx: &RunContext<'_>, session: &Session) -> Option<String> {
    let check = budget::check_budget(&session.state, &session.config);
    if !check.ok {
        return check.message;
    }
    if let Some(message) = check.message {
        ctx.observer.warning(&message);
        ctx.record(LogEvent::BudgetWarning { message });
    }
    let prompts = budget::check_prompt_limit(&session.state, &session.config);
    if !prompts.ok {
        return prompts.message;
    }
    None
}
