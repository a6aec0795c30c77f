//! Lifecycle callbacks for an FSD session.
//!
//! The executors never print. Everything a user might see goes through an
//! [`Observer`]: the terminal [`ConsoleObserver`], a headless runner, or the
//! recording double used in tests.

use std::io::IsTerminal;

use dialoguer::Confirm;
use tracing::warn;

use crate::agent::StreamEvent;
use crate::audit::{SecurityEvent, SecurityEventKind};
use crate::checks::CheckResult;
use crate::executor::plan::PlanSummary;
use crate::git::DiffSummary;
use crate::qa::{QaIssue, QaResult};
use crate::session::Milestone;

/// Receives session lifecycle events. Every method has a no-op default so
/// implementations only override what they render.
///
/// Methods take `&self`; implementations that record use interior
/// mutability.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    fn start(&self, goal: &str) {}
    fn planning_start(&self) {}
    fn planning_complete(&self, milestones: &[Milestone]) {}
    fn show_plan(&self, milestones: &[Milestone]) {}
    fn show_blockers(&self, blockers: &[String]) {}

    fn milestone_start(&self, milestone: &Milestone, index: usize, total: usize) {}
    fn milestone_complete(&self, milestone: &Milestone) {}
    fn milestone_failed(&self, milestone: &Milestone, reason: &str) {}
    fn milestone_skipped(&self, milestone: &Milestone, reason: &str) {}

    fn qa_start(&self, milestone: &Milestone) {}
    fn qa_complete(&self, milestone: &Milestone, result: &QaResult) {}
    fn qa_issue(&self, issue: &QaIssue) {}

    fn progress(&self, cost: f64, max_cost: f64, prompts: u32) {}
    fn git_branch(&self, branch: &str) {}
    fn git_complete(&self, diff: Option<&DiffSummary>) {}

    /// A redacted line from the running agent.
    fn agent_event(&self, event: &StreamEvent) {}
    fn security_event(&self, event: &SecurityEvent) {}
    fn checks_complete(&self, results: &[CheckResult]) {}
    fn warning(&self, message: &str) {}

    /// Ask the user a yes/no question. Headless implementations return
    /// `default`.
    fn confirm(&self, question: &str, default: bool) -> bool {
        default
    }

    fn complete(&self, summary: &PlanSummary) {}
    fn error(&self, message: &str) {}
}

/// Observer that discards everything and answers every question with its
/// default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// How [`ConsoleObserver`] answers confirmation questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Prompt on a terminal, fall back to the default otherwise.
    Ask,
    /// Always answer yes (`--yes`).
    AssumeYes,
    /// Never prompt; take each question's default.
    Defaults,
}

/// Terminal observer with `[fsd]` prefixed output on stderr.
pub struct ConsoleObserver {
    mode: ConfirmMode,
    show_agent_output: bool,
}

impl ConsoleObserver {
    pub fn new(mode: ConfirmMode) -> Self {
        Self {
            mode,
            show_agent_output: true,
        }
    }

    /// Hide the agent's streamed text and tool lines.
    pub fn quiet_agent(mut self) -> Self {
        self.show_agent_output = false;
        self
    }

    fn say(&self, message: &str) {
        eprintln!("\x1b[36m[fsd]\x1b[0m {message}");
    }

    fn alert(&self, message: &str) {
        eprintln!("\x1b[33m[fsd]\x1b[0m {message}");
    }
}

impl Observer for ConsoleObserver {
    fn start(&self, goal: &str) {
        self.say(&format!("● starting: {goal}"));
    }

    fn planning_start(&self) {
        self.say("● loading plan");
    }

    fn planning_complete(&self, milestones: &[Milestone]) {
        self.say(&format!("● plan ready: {} milestone(s)", milestones.len()));
    }

    fn show_plan(&self, milestones: &[Milestone]) {
        for (i, m) in milestones.iter().enumerate() {
            let deps = if m.dependencies.is_empty() {
                String::new()
            } else {
                format!(" (after {})", m.dependencies.join(", "))
            };
            eprintln!("  {:>2}. [{}] {} {}{deps}", i + 1, m.status, m.id, m.title);
        }
    }

    fn show_blockers(&self, blockers: &[String]) {
        for b in blockers {
            self.alert(&format!("⚠ blocker: {b}"));
        }
    }

    fn milestone_start(&self, milestone: &Milestone, index: usize, total: usize) {
        self.say(&format!(
            "→ milestone {}/{}: {} ({})",
            index + 1,
            total,
            milestone.title,
            milestone.id
        ));
    }

    fn milestone_complete(&self, milestone: &Milestone) {
        self.say(&format!("✓ milestone complete: {}", milestone.title));
    }

    fn milestone_failed(&self, milestone: &Milestone, reason: &str) {
        self.alert(&format!("✗ milestone failed: {} ({reason})", milestone.title));
    }

    fn milestone_skipped(&self, milestone: &Milestone, reason: &str) {
        self.alert(&format!("○ milestone skipped: {} ({reason})", milestone.title));
    }

    fn qa_start(&self, milestone: &Milestone) {
        self.say(&format!("● QA: verifying {}", milestone.title));
    }

    fn qa_complete(&self, _milestone: &Milestone, result: &QaResult) {
        self.say(&format!(
            "{} QA {}: {}",
            if result.is_pass() { "✓" } else { "⚠" },
            result.status,
            result.summary_line()
        ));
    }

    fn qa_issue(&self, issue: &QaIssue) {
        self.alert(&format!("  [{}] {}", issue.severity, issue.description));
    }

    fn progress(&self, cost: f64, max_cost: f64, prompts: u32) {
        self.say(&format!("  cost ${cost:.2} / ${max_cost:.2}, {prompts} prompt(s)"));
    }

    fn git_branch(&self, branch: &str) {
        self.say(&format!("● working on branch {branch} (push blocked)"));
    }

    fn git_complete(&self, diff: Option<&DiffSummary>) {
        match diff {
            Some(d) => self.say(&format!("✓ {d}")),
            None => self.say("✓ git isolation finished"),
        }
    }

    fn agent_event(&self, event: &StreamEvent) {
        if !self.show_agent_output {
            return;
        }
        match event {
            StreamEvent::Text(text) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    eprintln!("    {line}");
                }
            }
            StreamEvent::ToolUse(call) => eprintln!("    \x1b[2m{}\x1b[0m", call.display()),
        }
    }

    fn security_event(&self, event: &SecurityEvent) {
        let icon = match event.kind {
            SecurityEventKind::Warning => "⚠",
            SecurityEventKind::Blocked => "✗",
            SecurityEventKind::Checkpoint => "●",
            SecurityEventKind::Approved => "✓",
        };
        match &event.command {
            Some(cmd) => self.alert(&format!("{icon} {}: {cmd}", event.message)),
            None => self.alert(&format!("{icon} {}", event.message)),
        }
    }

    fn checks_complete(&self, results: &[CheckResult]) {
        let summary: Vec<String> = results
            .iter()
            .map(|r| {
                let mark = if r.skipped {
                    "-"
                } else if r.passed {
                    "✓"
                } else {
                    "✗"
                };
                format!("{mark} {}", r.name)
            })
            .collect();
        self.say(&format!("  checks: {}", summary.join("  ")));
    }

    fn warning(&self, message: &str) {
        self.alert(&format!("⚠ {message}"));
    }

    fn confirm(&self, question: &str, default: bool) -> bool {
        match self.mode {
            ConfirmMode::AssumeYes => true,
            ConfirmMode::Defaults => default,
            ConfirmMode::Ask => {
                if !std::io::stdin().is_terminal() {
                    return default;
                }
                match Confirm::new()
                    .with_prompt(question)
                    .default(default)
                    .interact()
                {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(error = %e, "confirmation prompt failed, using default");
                        default
                    }
                }
            }
        }
    }

    fn complete(&self, summary: &PlanSummary) {
        eprintln!();
        self.say(&format!("session finished: {summary}"));
        for l in &summary.learnings {
            eprintln!("    learned: {l}");
        }
        if summary.state_saved {
            self.say("state saved; run `fsd resume` to continue");
        }
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m[fsd]\x1b[0m ✗ {message}");
    }
}
