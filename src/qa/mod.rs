//! QA verification loop.
//!
//! After a milestone passes its checks the agent is asked to verify the
//! milestone's goal on its own terms and write a fixed-format markdown report
//! to `.claude/qa-report-<id>.md`. The report is parsed into a [`QaResult`];
//! critical issues trigger a bounded fix cycle.
//!
//! Report format:
//!
//! ```text
//! ## Result
//! PASS | FAIL
//! ## Summary
//! - Tests run: 4
//! - Passed: 3
//! - Failed: 1
//! ## What Was Tested
//! - ...
//! ## Issues Found
//! - [critical|major|minor] description
//!   Evidence: ...
//! ## Console Errors
//! ## Network Failures
//! ## Recommendations
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::executor::{Phase, RunContext, gate, invoke};
use crate::log::LogEvent;
use crate::paths;
use crate::safety::redact_lines;
use crate::session::{ExecutionMode, HistoryKind, Milestone, Session};

/// QA runs plus fixes allowed per milestone.
pub const MAX_QA_ATTEMPTS: u32 = 3;

const RESULT_HEADER: &str = "## Result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaStatus {
    Pass,
    Fail,
    /// No parseable report. Never treated as a pass.
    Incomplete,
}

impl fmt::Display for QaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QaStatus::Pass => "PASS",
            QaStatus::Fail => "FAIL",
            QaStatus::Incomplete => "INCOMPLETE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Some(Severity::Critical),
            "major" | "high" => Some(Severity::Major),
            "minor" | "low" => Some(Severity::Minor),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QaIssue {
    pub severity: Severity,
    pub description: String,
    pub evidence: Option<String>,
}

/// Counts from the `## Summary` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QaSummary {
    pub tests_run: u32,
    pub passed: u32,
    pub failed: u32,
    /// Summary prose that was not a count.
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QaResult {
    pub status: QaStatus,
    pub summary: QaSummary,
    pub tested: Vec<String>,
    pub issues: Vec<QaIssue>,
    pub console_errors: Vec<String>,
    pub network_failures: Vec<String>,
    pub recommendations: Vec<String>,
}

impl QaResult {
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            status: QaStatus::Incomplete,
            summary: QaSummary {
                notes: reason.into(),
                ..QaSummary::default()
            },
            tested: Vec::new(),
            issues: Vec::new(),
            console_errors: Vec::new(),
            network_failures: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == QaStatus::Pass
    }

    pub fn critical_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .count()
    }

    pub fn has_critical(&self) -> bool {
        self.critical_count() > 0
    }

    /// One-line human summary.
    pub fn summary_line(&self) -> String {
        if self.status == QaStatus::Incomplete {
            return if self.summary.notes.is_empty() {
                "no QA report produced".to_string()
            } else {
                self.summary.notes.clone()
            };
        }
        let mut parts = Vec::new();
        if self.summary.tests_run > 0 {
            parts.push(format!(
                "{}/{} passed",
                self.summary.passed, self.summary.tests_run
            ));
        }
        parts.push(format!(
            "{} issue(s), {} critical",
            self.issues.len(),
            self.critical_count()
        ));
        parts.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Report parsing
// ---------------------------------------------------------------------------

/// Parse a QA report. Returns `None` when there is no `## Result` section.
///
/// Missing sections parse to empty lists. Any critical issue forces
/// [`QaStatus::Fail`] whatever the declared result.
pub fn parse_report(text: &str) -> Option<QaResult> {
    let start = text.find(RESULT_HEADER)?;
    let sections = split_sections(&text[start..]);

    let declared = sections
        .get("result")
        .and_then(|lines| lines.iter().map(|l| l.trim()).find(|l| !l.is_empty()))
        .map(|line| {
            let upper = line.to_ascii_uppercase();
            if upper.contains("FAIL") {
                QaStatus::Fail
            } else if upper.contains("PASS") {
                QaStatus::Pass
            } else {
                QaStatus::Incomplete
            }
        })
        .unwrap_or(QaStatus::Incomplete);

    let issues = sections
        .get("issues found")
        .map(|lines| parse_issues(lines))
        .unwrap_or_default();

    let status = if issues.iter().any(|i| i.severity == Severity::Critical) {
        QaStatus::Fail
    } else {
        declared
    };

    let bullets_of = |name: &str| {
        sections
            .get(name)
            .map(|lines| bullets(lines))
            .unwrap_or_default()
    };

    Some(QaResult {
        status,
        summary: sections
            .get("summary")
            .map(|lines| parse_summary(lines))
            .unwrap_or_default(),
        tested: bullets_of("what was tested"),
        issues,
        console_errors: bullets_of("console errors"),
        network_failures: bullets_of("network failures"),
        recommendations: bullets_of("recommendations"),
    })
}

/// Read the report file, fall back to the agent's final output, then to an
/// incomplete result.
pub fn read_result(report_path: &Path, agent_output: &str) -> QaResult {
    match std::fs::read_to_string(report_path) {
        Ok(content) => {
            if let Some(result) = parse_report(&redact_lines(&content)) {
                debug!(path = %report_path.display(), "parsed QA report file");
                return result;
            }
            warn!(path = %report_path.display(), "QA report file has no result section");
        }
        Err(e) => debug!(path = %report_path.display(), error = %e, "no QA report file"),
    }
    if let Some(result) = parse_report(agent_output) {
        debug!("parsed QA report from agent output");
        return result;
    }
    QaResult::incomplete("agent produced no QA report")
}

fn split_sections(text: &str) -> HashMap<String, Vec<&str>> {
    let mut sections: HashMap<String, Vec<&str>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if let Some(header) = line.trim_start().strip_prefix("## ") {
            // `## Result: PASS` carries its body on the header line.
            let (name, inline) = header.split_once(':').unwrap_or((header, ""));
            let key = name.trim().to_ascii_lowercase();
            let lines = sections.entry(key.clone()).or_default();
            if !inline.trim().is_empty() {
                lines.push(inline);
            }
            current = Some(key);
            continue;
        }
        if let Some(key) = &current {
            if let Some(lines) = sections.get_mut(key) {
                lines.push(line);
            }
        }
    }
    sections
}

fn bullet_text(line: &str) -> Option<&str> {
    let t = line.trim_start();
    t.strip_prefix("- ")
        .or_else(|| t.strip_prefix("* "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn is_placeholder(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().trim_end_matches('.'),
        "none" | "n/a" | "none found" | "no issues" | "no issues found"
    )
}

fn bullets(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| bullet_text(l))
        .filter(|b| !is_placeholder(b))
        .map(str::to_string)
        .collect()
}

fn parse_issues(lines: &[&str]) -> Vec<QaIssue> {
    let mut issues: Vec<QaIssue> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if let Some(evidence) = trimmed.strip_prefix("Evidence:") {
            if let Some(last) = issues.last_mut() {
                let evidence = evidence.trim();
                if !evidence.is_empty() {
                    last.evidence = Some(evidence.to_string());
                }
            }
            continue;
        }
        let Some(text) = bullet_text(line) else {
            continue;
        };
        if is_placeholder(text) {
            continue;
        }
        let (severity, description) = match text
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
        {
            Some((tag, rest)) => match Severity::parse(tag) {
                Some(sev) => (sev, rest.trim()),
                None => (Severity::Major, text),
            },
            None => (Severity::Major, text),
        };
        issues.push(QaIssue {
            severity,
            description: description.to_string(),
            evidence: None,
        });
    }
    issues
}

fn parse_summary(lines: &[&str]) -> QaSummary {
    let mut summary = QaSummary::default();
    let mut notes = Vec::new();
    for line in lines {
        let text = bullet_text(line).unwrap_or(line.trim());
        if text.is_empty() {
            continue;
        }
        let count = text
            .split_once(':')
            .and_then(|(label, value)| Some((label, value.trim().parse::<u32>().ok()?)));
        match count {
            Some((label, n)) => match label.trim().to_ascii_lowercase().as_str() {
                "tests run" | "total" | "total tests" => summary.tests_run = n,
                "passed" => summary.passed = n,
                "failed" => summary.failed = n,
                _ => notes.push(text),
            },
            None => notes.push(text),
        }
    }
    summary.notes = notes.join(" ");
    summary
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// Prompt asking the agent to verify a milestone and write the report.
pub fn qa_prompt(milestone: &Milestone, goal: &str, report_path: &Path, session_rules: &str) -> String {
    let mut prompt = format!("# QA: {}\n\n", milestone.title);
    match &milestone.qa_goal {
        Some(qa_goal) if !qa_goal.trim().is_empty() => {
            prompt.push_str(&format!("Verify that: {}\n\n", qa_goal.trim()));
        }
        _ => {
            prompt.push_str(&format!(
                "Verify that the milestone \"{}\" works as intended.\n\n",
                milestone.title
            ));
        }
    }
    if !goal.trim().is_empty() {
        prompt.push_str(&format!("Overall goal: {}\n\n", goal.trim()));
    }
    if !milestone.success_criteria.is_empty() {
        prompt.push_str("Success criteria:\n");
        for c in &milestone.success_criteria {
            prompt.push_str(&format!("- {c}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Decide for yourself how to test this: run the app, call its interfaces, \
         exercise edge cases. Do not change application code during QA.\n\n",
    );
    prompt.push_str(&format!(
        "When done, write your report to `{}` using exactly this structure:\n\n",
        report_path.display()
    ));
    prompt.push_str(
        "## Result\nPASS or FAIL\n\n\
         ## Summary\n- Tests run: N\n- Passed: N\n- Failed: N\n\n\
         ## What Was Tested\n- one bullet per scenario\n\n\
         ## Issues Found\n- [critical|major|minor] description\n  Evidence: what you observed\n\n\
         ## Console Errors\n- one bullet per error\n\n\
         ## Network Failures\n- one bullet per failed request\n\n\
         ## Recommendations\n- one bullet per recommendation\n\n",
    );
    if !session_rules.trim().is_empty() {
        prompt.push_str(session_rules.trim_end());
        prompt.push('\n');
    }
    prompt
}

/// Prompt asking the agent to fix the issues a QA run found.
pub fn qa_fix_prompt(milestone: &Milestone, result: &QaResult, session_rules: &str) -> String {
    let mut prompt = format!(
        "QA of \"{}\" found the issues below. Fix them, starting with the critical ones. \
         Do not start unrelated work.\n\n",
        milestone.title
    );
    for (i, issue) in result.issues.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{}] {}\n",
            i + 1,
            issue.severity,
            issue.description
        ));
        if let Some(evidence) = &issue.evidence {
            prompt.push_str(&format!("   Evidence: {evidence}\n"));
        }
    }
    for (title, items) in [
        ("Console errors", &result.console_errors),
        ("Network failures", &result.network_failures),
    ] {
        if !items.is_empty() {
            prompt.push_str(&format!("\n{title}:\n"));
            for item in items {
                prompt.push_str(&format!("- {item}\n"));
            }
        }
    }
    prompt.push('\n');
    if !session_rules.trim().is_empty() {
        prompt.push_str(session_rules.trim_end());
        prompt.push('\n');
    }
    prompt
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Verify a completed milestone, fixing critical issues up to
/// [`MAX_QA_ATTEMPTS`] times. Always returns a result; failures are never
/// promoted to a pass.
pub fn run_qa(
    ctx: &RunContext<'_>,
    session: &mut Session,
    milestone_id: &str,
    session_rules: &str,
) -> QaResult {
    let Some(milestone) = session.milestone(milestone_id).cloned() else {
        return QaResult::incomplete(format!("unknown milestone {milestone_id}"));
    };
    ctx.observer.qa_start(&milestone);
    let previous_mode = session.state.mode;
    session.state.mode = ExecutionMode::Reviewing;

    let report_path = paths::qa_report_file(&ctx.project_root, milestone_id);
    let mut result = QaResult::incomplete("QA did not run");

    for attempt in 1..=MAX_QA_ATTEMPTS {
        if ctx.is_aborted() {
            break;
        }
        if let Some(reason) = gate(ctx, session) {
            ctx.observer.warning(&format!("QA stopped: {reason}"));
            break;
        }

        if report_path.exists() {
            if let Err(e) = std::fs::remove_file(&report_path) {
                warn!(path = %report_path.display(), error = %e, "failed to remove stale QA report");
            }
        }

        info!(milestone = milestone_id, attempt, "running QA");
        let prompt = qa_prompt(&milestone, &session.goal, &report_path, session_rules);
        let run = invoke(ctx, session, prompt, Phase::Qa, ctx.options.qa_timeout);
        let output = match &run.response {
            Ok(response) => response.output.clone(),
            Err(e) => {
                warn!(milestone = milestone_id, error = %e, "QA invocation failed");
                String::new()
            }
        };

        result = read_result(&report_path, &output);
        for issue in &result.issues {
            ctx.observer.qa_issue(issue);
        }

        if result.status != QaStatus::Fail || !result.has_critical() {
            break;
        }
        if attempt == MAX_QA_ATTEMPTS || !ctx.options.qa_auto_fix {
            break;
        }

        let question = format!(
            "QA found {} critical issue(s) in \"{}\". Let the agent fix them?",
            result.critical_count(),
            milestone.title
        );
        session.state.note(HistoryKind::Question, question.clone());
        let answer = ctx.observer.confirm(&question, true);
        session
            .state
            .note(HistoryKind::Answer, if answer { "yes" } else { "no" });
        ctx.record(LogEvent::UserDecision { question, answer });
        if !answer {
            break;
        }

        if let Some(reason) = gate(ctx, session) {
            ctx.observer.warning(&format!("QA fix skipped: {reason}"));
            break;
        }
        let prompt = qa_fix_prompt(&milestone, &result, session_rules);
        let fix = invoke(ctx, session, prompt, Phase::QaFix, ctx.options.agent_timeout);
        if let Err(e) = &fix.response {
            warn!(milestone = milestone_id, error = %e, "QA fix invocation failed");
        }
    }

    session.state.mode = previous_mode;
    ctx.record(LogEvent::QaFinished {
        id: milestone_id.to_string(),
        status: result.status.to_string(),
        issues: result.issues.len(),
        critical: result.critical_count(),
    });
    ctx.observer.qa_complete(&milestone, &result);
    result
}
