//! Milestone executor: one milestone to success, failure or needs-replan.
//!
//! Each iteration gates on budget and prompt count, prompts the agent, runs
//! the check suite and, when checks fail, asks the agent for a targeted fix
//! before looping. Invocation errors consume an iteration but never end the
//! loop early; only the budget gate, a rejected sensitive change or an abort
//! do.

use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::audit::{AuditedRun, SecurityEvent, SecurityEventKind};
use crate::checks::{all_passed, failing, format_failure_feedback};
use crate::log::LogEvent;
use crate::prompt::{derive_learning, fix_prompt, milestone_prompt};
use crate::session::{ExecutionMode, HistoryKind, MilestoneStatus, Session};

use super::{Phase, RunContext, gate, invoke};

/// Reason reported when the abort flag ends a milestone.
pub const ABORTED: &str = "aborted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilestoneOutcome {
    Success,
    /// Stopped by the budget gate, a rejected change or an abort. Retryable
    /// on resume.
    Failed { reason: String },
    /// Every iteration was used without passing checks. Needs a human or a
    /// new plan before going further.
    NeedsReplan { reason: String },
}

impl MilestoneOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MilestoneOutcome::Success => "success",
            MilestoneOutcome::Failed { .. } => "failed",
            MilestoneOutcome::NeedsReplan { .. } => "needs_replan",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            MilestoneOutcome::Success => None,
            MilestoneOutcome::Failed { reason } | MilestoneOutcome::NeedsReplan { reason } => {
                Some(reason)
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MilestoneOutcome::Success)
    }
}

/// Run one milestone through the retry loop.
pub fn execute_milestone(
    ctx: &RunContext<'_>,
    session: &mut Session,
    milestone_id: &str,
    session_rules: &str,
) -> MilestoneOutcome {
    let Some(milestone) = session.milestone(milestone_id).cloned() else {
        return MilestoneOutcome::Failed {
            reason: format!("unknown milestone {milestone_id}"),
        };
    };

    session.set_status(milestone_id, MilestoneStatus::InProgress);
    session.state.current_milestone = Some(milestone_id.to_string());
    session.state.mode = ExecutionMode::Executing;

    let max_iterations = session.config.max_iterations_per_milestone.max(1);
    for attempt in 1..=max_iterations {
        if ctx.is_aborted() {
            return aborted(session, milestone_id);
        }
        if let Some(reason) = gate(ctx, session) {
            return failed(session, milestone_id, reason);
        }

        info!(milestone = milestone_id, attempt, max_iterations, "milestone attempt");
        ctx.record(LogEvent::MilestoneAttempt {
            id: milestone_id.to_string(),
            attempt,
        });

        let prompt = milestone_prompt(
            &milestone,
            &session.goal,
            &session.state.learnings,
            session_rules,
            attempt,
        );
        let run = invoke(ctx, session, prompt, Phase::Milestone, ctx.options.agent_timeout);
        match &run.response {
            Err(AgentError::Aborted) => return aborted(session, milestone_id),
            Err(e) => {
                warn!(milestone = milestone_id, attempt, error = %e, "agent invocation failed");
                ctx.observer
                    .warning(&format!("agent invocation failed (attempt {attempt}): {e}"));
                continue;
            }
            Ok(response) if !response.success => {
                warn!(
                    milestone = milestone_id,
                    errors = ?response.errors,
                    "agent reported an error; checking its work anyway"
                );
            }
            Ok(_) => {}
        }
        if let Err(reason) = approve_changes(ctx, session, &run) {
            return failed(session, milestone_id, reason);
        }

        let results = ctx.checks.run_checks(&ctx.project_root);
        ctx.observer.checks_complete(&results);
        let failing_names: Vec<String> = failing(&results).iter().map(|r| r.name.clone()).collect();
        ctx.record(LogEvent::ChecksRun {
            passed: all_passed(&results),
            failing: failing_names.clone(),
        });

        if all_passed(&results) {
            session.set_status(milestone_id, MilestoneStatus::Completed);
            session.state.mark_completed(milestone_id);
            session.state.current_milestone = None;
            info!(milestone = milestone_id, attempt, "milestone complete");
            return MilestoneOutcome::Success;
        }

        debug!(milestone = milestone_id, failing = ?failing_names, "checks failed");
        session.state.failed_attempts += 1;
        if let Some(learning) = derive_learning(&format_failure_feedback(&results)) {
            if session.state.add_learning(learning) {
                debug!(learning, "recorded learning");
            }
        }

        if let Some(reason) = gate(ctx, session) {
            return failed(session, milestone_id, reason);
        }
        let fix = invoke(
            ctx,
            session,
            fix_prompt(&milestone, &results, session_rules),
            Phase::Fix,
            ctx.options.agent_timeout,
        );
        match &fix.response {
            Err(AgentError::Aborted) => return aborted(session, milestone_id),
            Err(e) => warn!(milestone = milestone_id, error = %e, "fix invocation failed"),
            Ok(_) => {
                if let Err(reason) = approve_changes(ctx, session, &fix) {
                    return failed(session, milestone_id, reason);
                }
            }
        }
    }

    session.set_status(milestone_id, MilestoneStatus::Failed);
    session.state.current_milestone = None;
    let reason = format!("checks still failing after {max_iterations} attempt(s)");
    warn!(milestone = milestone_id, "{reason}");
    MilestoneOutcome::NeedsReplan { reason }
}

/// Ask before keeping changes to sensitive files, when configured to.
fn approve_changes(ctx: &RunContext<'_>, session: &mut Session, run: &AuditedRun) -> Result<(), String> {
    let Some(report) = &run.report else {
        return Ok(());
    };
    if !report.needs_approval() || !session.config.require_approval_for_sensitive {
        return Ok(());
    }

    let mut touched = report.sensitive_files.clone();
    if report.env_modified && touched.is_empty() {
        touched.push(".env".to_string());
    }
    let question = format!(
        "The agent changed sensitive files ({}). Keep these changes and continue?",
        touched.join(", ")
    );
    session.state.mode = ExecutionMode::WaitingUser;
    session.state.note(HistoryKind::Question, question.clone());
    let answer = ctx.observer.confirm(&question, false);
    session
        .state
        .note(HistoryKind::Answer, if answer { "yes" } else { "no" });
    session.state.mode = ExecutionMode::Executing;
    ctx.record(LogEvent::UserDecision {
        question,
        answer,
    });

    if answer {
        ctx.security(&SecurityEvent::new(
            SecurityEventKind::Approved,
            format!("sensitive changes approved: {}", touched.join(", ")),
        ));
        Ok(())
    } else {
        ctx.security(&SecurityEvent::new(
            SecurityEventKind::Blocked,
            format!("sensitive changes rejected: {}", touched.join(", ")),
        ));
        Err("sensitive changes rejected".to_string())
    }
}

fn failed(session: &mut Session, milestone_id: &str, reason: String) -> MilestoneOutcome {
    warn!(milestone = milestone_id, reason = %reason, "milestone failed");
    session.set_status(milestone_id, MilestoneStatus::Failed);
    session.state.current_milestone = None;
    MilestoneOutcome::Failed { reason }
}

/// An aborted milestone goes back to pending so a resume picks it up.
fn aborted(session: &mut Session, milestone_id: &str) -> MilestoneOutcome {
    info!(milestone = milestone_id, "milestone aborted");
    session.set_status(milestone_id, MilestoneStatus::Pending);
    session.state.current_milestone = None;
    MilestoneOutcome::Failed {
        reason: ABORTED.to_string(),
    }
}
