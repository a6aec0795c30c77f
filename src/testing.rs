//! Scenario doubles for exercising the executors without a real agent.
//!
//! Compiled for unit tests and, through the `scenario-test` feature, for the
//! integration tests under `tests/`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use crate::agent::{AgentError, AgentRequest, AgentResponse, AgentRunner, StreamEvent};
use crate::audit::SecurityEvent;
use crate::checks::{CheckResult, CheckRunner};
use crate::executor::plan::PlanSummary;
use crate::git::DiffSummary;
use crate::observer::Observer;
use crate::qa::{QaIssue, QaResult};
use crate::session::Milestone;

type Hook = Box<dyn Fn(&AgentRequest, usize) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Agent that replays a script of responses. Once the script runs out every
/// call succeeds with an empty response.
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentResponse, AgentError>>>,
    events: Vec<StreamEvent>,
    hook: Option<Hook>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<Result<AgentResponse, AgentError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            events: Vec::new(),
            hook: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Stream these events on every call.
    pub fn with_events(mut self, events: Vec<StreamEvent>) -> Self {
        self.events = events;
        self
    }

    /// Run `hook` with the request and zero-based call index before
    /// responding, e.g. to touch files in the project.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentRequest, usize) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(
        &self,
        request: &AgentRequest,
        on_event: &mut dyn FnMut(StreamEvent),
    ) -> Result<AgentResponse, AgentError> {
        let index = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len() - 1
        };
        if let Some(hook) = &self.hook {
            hook(request, index);
        }
        for event in &self.events {
            on_event(event.clone());
        }
        lock(&self.script).pop_front().unwrap_or_else(|| {
            Ok(AgentResponse {
                success: true,
                ..AgentResponse::default()
            })
        })
    }
}

/// Check runner returning canned results. The last entry repeats.
pub struct StaticChecks {
    sequence: Mutex<VecDeque<Vec<CheckResult>>>,
    calls: Mutex<usize>,
}

impl StaticChecks {
    pub fn passing() -> Self {
        Self::sequence(vec![Vec::new()])
    }

    /// One failing check named `name` with `output`, forever.
    pub fn failing(name: &str, output: &str) -> Self {
        Self::sequence(vec![vec![CheckResult {
            name: name.to_string(),
            passed: false,
            output: Some(output.to_string()),
            skipped: false,
            exit_code: Some(1),
        }]])
    }

    pub fn sequence(results: Vec<Vec<CheckResult>>) -> Self {
        Self {
            sequence: Mutex::new(results.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

impl CheckRunner for StaticChecks {
    fn run_checks(&self, _project_root: &Path) -> Vec<CheckResult> {
        *lock(&self.calls) += 1;
        let mut sequence = lock(&self.sequence);
        if sequence.len() > 1 {
            sequence.pop_front().unwrap_or_default()
        } else {
            sequence.front().cloned().unwrap_or_default()
        }
    }
}

/// Observer that records callbacks as `name:detail` strings and answers
/// questions from a queue, falling back to each question's default.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
    questions: Mutex<Vec<String>>,
    answers: Mutex<VecDeque<bool>>,
    warnings: Mutex<Vec<String>>,
    security: Mutex<Vec<SecurityEvent>>,
    progress: Mutex<usize>,
    summary: Mutex<Option<PlanSummary>>,
}

impl RecordingObserver {
    pub fn answering(answers: Vec<bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            ..Self::default()
        }
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.questions).clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        lock(&self.warnings).clone()
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        lock(&self.security).clone()
    }

    pub fn progress_calls(&self) -> usize {
        *lock(&self.progress)
    }

    pub fn summary(&self) -> Option<PlanSummary> {
        lock(&self.summary).clone()
    }
}

impl Observer for RecordingObserver {
    fn start(&self, goal: &str) {
        self.push(format!("start:{goal}"));
    }

    fn show_blockers(&self, blockers: &[String]) {
        for b in blockers {
            self.push(format!("blocker:{b}"));
        }
    }

    fn milestone_start(&self, milestone: &Milestone, index: usize, total: usize) {
        self.push(format!("milestone_start:{}:{}/{}", milestone.id, index + 1, total));
    }

    fn milestone_complete(&self, milestone: &Milestone) {
        self.push(format!("milestone_complete:{}", milestone.id));
    }

    fn milestone_failed(&self, milestone: &Milestone, reason: &str) {
        self.push(format!("milestone_failed:{}:{reason}", milestone.id));
    }

    fn milestone_skipped(&self, milestone: &Milestone, reason: &str) {
        self.push(format!("milestone_skipped:{}:{reason}", milestone.id));
    }

    fn qa_start(&self, milestone: &Milestone) {
        self.push(format!("qa_start:{}", milestone.id));
    }

    fn qa_complete(&self, milestone: &Milestone, result: &QaResult) {
        self.push(format!("qa_complete:{}:{}", milestone.id, result.status));
    }

    fn qa_issue(&self, issue: &QaIssue) {
        self.push(format!("qa_issue:{}", issue.severity));
    }

    fn progress(&self, _cost: f64, _max_cost: f64, _prompts: u32) {
        *lock(&self.progress) += 1;
    }

    fn git_branch(&self, branch: &str) {
        self.push(format!("git_branch:{branch}"));
    }

    fn git_complete(&self, diff: Option<&DiffSummary>) {
        let commits = diff.map(|d| d.commits).unwrap_or_default();
        self.push(format!("git_complete:{commits}"));
    }

    fn security_event(&self, event: &SecurityEvent) {
        lock(&self.security).push(event.clone());
    }

    fn warning(&self, message: &str) {
        lock(&self.warnings).push(message.to_string());
    }

    fn confirm(&self, question: &str, default: bool) -> bool {
        lock(&self.questions).push(question.to_string());
        lock(&self.answers).pop_front().unwrap_or(default)
    }

    fn complete(&self, summary: &PlanSummary) {
        self.push("complete".to_string());
        *lock(&self.summary) = Some(summary.clone());
    }

    fn error(&self, message: &str) {
        self.push(format!("error:{message}"));
    }
}
