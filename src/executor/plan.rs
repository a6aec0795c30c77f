//! Plan executor: walk the milestones in list order, honouring
//! dependencies, pause and abort, persisting state around every
//! transition.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{SecurityEvent, SecurityEventKind};
use crate::git::{self, DiffSummary, GitIsolation};
use crate::log::LogEvent;
use crate::qa::run_qa;
use crate::safety::safety_rules;
use crate::session::{ExecutionMode, HistoryKind, MilestoneStatus, Session};
use crate::state;

use super::RunContext;
use super::milestone::{MilestoneOutcome, execute_milestone};

/// Reason given for milestones whose dependencies have not completed.
pub const DEPENDENCIES_NOT_MET: &str = "dependencies not met";

/// What happened to one milestone during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MilestoneReport {
    pub id: String,
    pub outcome: String,
    pub reason: Option<String>,
}

/// End-of-run summary handed to the observer.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub goal: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub needs_replan: usize,
    pub skipped: usize,
    pub pending: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub failed_attempts: u32,
    pub total_cost: f64,
    pub prompt_count: u32,
    pub learnings: Vec<String>,
    /// State is left on disk for `fsd resume`.
    pub state_saved: bool,
    pub aborted: bool,
    pub git_diff: Option<DiffSummary>,
    pub milestones: Vec<MilestoneReport>,
}

impl PlanSummary {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} milestones completed", self.completed, self.total)?;
        for (n, label) in [
            (self.needs_replan, "need replanning"),
            (self.failed, "failed"),
            (self.skipped, "skipped"),
            (self.pending, "pending"),
        ] {
            if n > 0 {
                write!(f, ", {n} {label}")?;
            }
        }
        let secs = self.elapsed.as_secs();
        write!(
            f,
            "; ${:.2} over {} prompt(s), {} failed attempt(s), {}m {}s",
            self.total_cost,
            self.prompt_count,
            self.failed_attempts,
            secs / 60,
            secs % 60
        )
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Run every runnable milestone of `session`.
///
/// Only a full completion clears persisted state and finishes git
/// isolation. Any other exit leaves both in place for a later resume.
pub fn run_plan(ctx: &RunContext<'_>, session: &mut Session) -> PlanSummary {
    let started = Instant::now();
    let resumed = session.state.prompt_count > 0 || !session.state.completed_milestones.is_empty();
    let total = session.milestones.len();

    ctx.observer.start(&session.goal);
    ctx.record(LogEvent::SessionStarted {
        goal: session.goal.clone(),
        milestones: total,
        resumed,
    });
    ctx.observer.show_plan(&session.milestones);
    let blockers = unknown_dependencies(session);
    if !blockers.is_empty() {
        ctx.observer.show_blockers(&blockers);
    }

    let mut isolation = setup_isolation(ctx, session);
    let mut rules = String::new();
    if let Some(branch) = isolation
        .as_ref()
        .filter(|iso| iso.is_active())
        .and_then(|iso| iso.session_branch())
    {
        rules.push_str(&git::isolation_rules(branch));
        rules.push('\n');
    }
    rules.push_str(safety_rules());

    session.state.mode = ExecutionMode::Executing;
    let mut reports = Vec::new();
    let mut completed_this_run: u32 = 0;
    let mut aborted = false;
    let ids: Vec<String> = session.milestones.iter().map(|m| m.id.clone()).collect();

    for (index, id) in ids.iter().enumerate() {
        wait_if_paused(ctx, session);
        if ctx.is_aborted() {
            aborted = true;
            break;
        }

        let Some(milestone) = session.milestone(id).cloned() else {
            continue;
        };
        if milestone.status == MilestoneStatus::Completed || session.state.is_completed(id) {
            continue;
        }

        let unmet = milestone.unmet_dependencies(&session.state.completed_milestones);
        if !unmet.is_empty() {
            info!(milestone = %id, unmet = ?unmet, "skipping milestone");
            session.set_status(id, MilestoneStatus::Skipped);
            session.state.note(
                HistoryKind::Skip,
                format!("{id}: {DEPENDENCIES_NOT_MET} ({})", unmet.join(", ")),
            );
            ctx.observer.milestone_skipped(&milestone, DEPENDENCIES_NOT_MET);
            ctx.record(LogEvent::MilestoneSkipped {
                id: id.clone(),
                reason: DEPENDENCIES_NOT_MET.to_string(),
            });
            reports.push(MilestoneReport {
                id: id.clone(),
                outcome: "skipped".into(),
                reason: Some(DEPENDENCIES_NOT_MET.into()),
            });
            continue;
        }

        ctx.observer.milestone_start(&milestone, index, total);
        ctx.record(LogEvent::MilestoneStarted {
            id: id.clone(),
            title: milestone.title.clone(),
        });
        session.set_status(id, MilestoneStatus::InProgress);
        session.state.current_milestone = Some(id.clone());
        persist(ctx, session);

        let outcome = execute_milestone(ctx, session, id, &rules);
        persist(ctx, session);
        ctx.record(LogEvent::MilestoneFinished {
            id: id.clone(),
            outcome: outcome.label().to_string(),
            reason: outcome.reason().map(str::to_string),
        });

        if ctx.is_aborted() && !outcome.is_success() {
            aborted = true;
            break;
        }
        reports.push(MilestoneReport {
            id: id.clone(),
            outcome: outcome.label().to_string(),
            reason: outcome.reason().map(str::to_string),
        });

        match &outcome {
            MilestoneOutcome::Success => {
                ctx.observer.milestone_complete(&milestone);
                completed_this_run += 1;

                if ctx.options.qa_enabled {
                    wait_if_paused(ctx, session);
                    if ctx.is_aborted() {
                        aborted = true;
                        break;
                    }
                    let qa = run_qa(ctx, session, id, &rules);
                    if !qa.is_pass() {
                        session.state.note(
                            HistoryKind::Note,
                            format!("{id}: QA {} ({})", qa.status, qa.summary_line()),
                        );
                    }
                    persist(ctx, session);
                }

                let interval = session.config.checkpoint_interval;
                let more_to_do = index + 1 < total;
                if interval > 0 && completed_this_run % interval == 0 && more_to_do {
                    ctx.security(&SecurityEvent::new(
                        SecurityEventKind::Checkpoint,
                        format!("checkpoint after {completed_this_run} completed milestone(s)"),
                    ));
                    wait_if_paused(ctx, session);
                    if !ask(ctx, session, "Checkpoint reached. Continue with the next milestone?", true) {
                        persist(ctx, session);
                        break;
                    }
                }
            }
            MilestoneOutcome::Failed { reason } | MilestoneOutcome::NeedsReplan { reason } => {
                ctx.observer.milestone_failed(&milestone, reason);
                session.state.note(
                    HistoryKind::Failure,
                    format!("{id}: {} ({reason})", outcome.label()),
                );
                let what = if matches!(outcome, MilestoneOutcome::NeedsReplan { .. }) {
                    "needs replanning"
                } else {
                    "failed"
                };
                let question = format!(
                    "Milestone \"{}\" {what}. Continue with the next milestone?",
                    milestone.title
                );
                let answer = ask(ctx, session, &question, false);
                persist(ctx, session);
                if !answer {
                    break;
                }
            }
        }
    }

    finish(ctx, session, isolation.as_mut(), started, reports, aborted)
}

fn setup_isolation(ctx: &RunContext<'_>, session: &mut Session) -> Option<GitIsolation> {
    if !ctx.options.git_isolation {
        return None;
    }
    let iso = match &session.git {
        Some(saved) if saved.is_isolated() => git::resume_isolation(&ctx.project_root, saved),
        _ => git::start_isolation(&ctx.project_root, &session.goal),
    };
    for w in &iso.warnings {
        ctx.observer.warning(w);
    }
    session.git = Some(iso.state().clone());
    if let Some(branch) = iso.session_branch().filter(|_| iso.is_active()) {
        ctx.observer.git_branch(branch);
        ctx.record(LogEvent::GitIsolation {
            action: "isolated".into(),
            detail: branch.to_string(),
        });
    }
    Some(iso)
}

fn finish(
    ctx: &RunContext<'_>,
    session: &mut Session,
    isolation: Option<&mut GitIsolation>,
    started: Instant,
    milestones: Vec<MilestoneReport>,
    aborted: bool,
) -> PlanSummary {
    session.state.current_milestone = None;
    let mut git_diff = None;
    let state_saved;

    if session.all_completed() {
        session.state.mode = ExecutionMode::Completed;
        if let Err(e) = state::clear(&ctx.project_root) {
            warn!(error = %e, "failed to clear session state");
        }
        state_saved = false;
        if let Some(iso) = isolation.filter(|iso| iso.is_active()) {
            match iso.finish() {
                Ok(diff) => {
                    ctx.observer.git_complete(diff.as_ref());
                    ctx.record(LogEvent::GitIsolation {
                        action: "finished".into(),
                        detail: diff
                            .as_ref()
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "push block removed".into()),
                    });
                    git_diff = diff;
                }
                Err(e) => ctx
                    .observer
                    .error(&format!("failed to finish git isolation: {e:#}")),
            }
        }
    } else {
        session.state.mode = if aborted {
            ExecutionMode::Paused
        } else {
            ExecutionMode::WaitingUser
        };
        state_saved = persist(ctx, session);
    }

    let count = |status| session.count(status);
    let needs_replan = milestones
        .iter()
        .filter(|r| r.outcome == "needs_replan")
        .count();
    let summary = PlanSummary {
        goal: session.goal.clone(),
        total: session.milestones.len(),
        completed: count(MilestoneStatus::Completed),
        failed: count(MilestoneStatus::Failed).saturating_sub(needs_replan),
        needs_replan,
        skipped: count(MilestoneStatus::Skipped),
        pending: count(MilestoneStatus::Pending) + count(MilestoneStatus::InProgress),
        elapsed: started.elapsed(),
        failed_attempts: session.state.failed_attempts,
        total_cost: session.state.total_cost,
        prompt_count: session.state.prompt_count,
        learnings: session.state.learnings.clone(),
        state_saved,
        aborted,
        git_diff,
        milestones,
    };

    info!(summary = %summary, "session finished");
    ctx.record(LogEvent::SessionEnded {
        completed: summary.completed,
        total: summary.total,
        state_saved,
    });
    ctx.observer.complete(&summary);
    summary
}

/// Block while paused. The mode reflects the pause in saved state.
fn wait_if_paused(ctx: &RunContext<'_>, session: &mut Session) {
    if !ctx.pause.is_paused() {
        return;
    }
    let previous = session.state.mode;
    session.state.mode = ExecutionMode::Paused;
    persist(ctx, session);
    ctx.observer.warning("paused; waiting for resume");
    ctx.pause.wait_if_paused();
    session.state.mode = previous;
}

fn ask(ctx: &RunContext<'_>, session: &mut Session, question: &str, default: bool) -> bool {
    let previous = session.state.mode;
    session.state.mode = ExecutionMode::WaitingUser;
    session.state.note(HistoryKind::Question, question);
    let answer = ctx.observer.confirm(question, default);
    session
        .state
        .note(HistoryKind::Answer, if answer { "yes" } else { "no" });
    session.state.mode = previous;
    ctx.record(LogEvent::UserDecision {
        question: question.to_string(),
        answer,
    });
    answer
}

/// Save state, reporting failures. Returns whether the save succeeded.
fn persist(ctx: &RunContext<'_>, session: &Session) -> bool {
    match state::save(&ctx.project_root, session) {
        Ok(path) => {
            ctx.record(LogEvent::StateSaved {
                path: path.display().to_string(),
            });
            true
        }
        Err(e) => {
            ctx.observer
                .error(&format!("failed to save session state: {e:#}"));
            false
        }
    }
}

fn unknown_dependencies(session: &Session) -> Vec<String> {
    let mut blockers = Vec::new();
    for m in &session.milestones {
        for dep in &m.dependencies {
            if session.milestone(dep).is_none() {
                blockers.push(format!("{} depends on unknown milestone {dep}", m.id));
            }
        }
    }
    blockers
}
