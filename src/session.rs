//! Session data model: milestones, run-time state, limits and git provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::SavedSession;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Failed => "failed",
            MilestoneStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Rough size class assigned by the planner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneSize {
    Small,
    #[default]
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "success_criteria")]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub size: MilestoneSize,
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "qa_goal")]
    pub qa_goal: Option<String>,
    #[serde(default)]
    pub status: MilestoneStatus,
}

impl Milestone {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            success_criteria: Vec::new(),
            size: MilestoneSize::default(),
            dependencies: Vec::new(),
            qa_goal: None,
            status: MilestoneStatus::Pending,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Dependency ids not yet present in `completed`.
    pub fn unmet_dependencies<'a>(&'a self, completed: &[String]) -> Vec<&'a str> {
        self.dependencies
            .iter()
            .filter(|dep| !completed.iter().any(|c| c == *dep))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Planning,
    Executing,
    Reviewing,
    WaitingUser,
    Paused,
    Completed,
}

/// One timestamped line of the interaction history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub kind: HistoryKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Question,
    Answer,
    Skip,
    Failure,
    Note,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub mode: ExecutionMode,
    pub current_milestone: Option<String>,
    pub completed_milestones: Vec<String>,
    /// Attempts whose checks failed. Agent invocation errors are not counted.
    pub failed_attempts: u32,
    pub total_cost: f64,
    pub prompt_count: u32,
    pub learnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            mode: ExecutionMode::Planning,
            current_milestone: None,
            completed_milestones: Vec::new(),
            failed_attempts: 0,
            total_cost: 0.0,
            prompt_count: 0,
            learnings: Vec::new(),
            started_at: Utc::now(),
            session_id: None,
            history: Vec::new(),
        }
    }

    /// Add to cumulative cost. Negative or non-finite amounts are ignored so
    /// the total never decreases.
    pub fn record_cost(&mut self, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            self.total_cost += usd;
        }
    }

    /// Count one agent invocation and its reported cost.
    pub fn record_prompt(&mut self, usd: f64) {
        self.prompt_count = self.prompt_count.saturating_add(1);
        self.record_cost(usd);
    }

    /// Append a learning unless an identical one is already recorded.
    /// Returns `true` if it was new.
    pub fn add_learning(&mut self, learning: impl Into<String>) -> bool {
        let learning = learning.into();
        let trimmed = learning.trim();
        if trimmed.is_empty() || self.learnings.iter().any(|l| l == trimmed) {
            return false;
        }
        self.learnings.push(trimmed.to_string());
        true
    }

    pub fn mark_completed(&mut self, milestone_id: &str) {
        if !self.completed_milestones.iter().any(|c| c == milestone_id) {
            self.completed_milestones.push(milestone_id.to_string());
        }
    }

    pub fn is_completed(&self, milestone_id: &str) -> bool {
        self.completed_milestones.iter().any(|c| c == milestone_id)
    }

    pub fn note(&mut self, kind: HistoryKind, text: impl Into<String>) {
        self.history.push(HistoryEntry {
            at: Utc::now(),
            kind,
            text: text.into(),
        });
    }
}

/// Limits fixed at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsdConfig {
    pub max_cost: f64,
    pub max_iterations_per_milestone: u32,
    pub max_total_prompts: u32,
    pub checkpoint_interval: u32,
    pub require_approval_for_sensitive: bool,
    pub auto_resume: bool,
}

impl Default for FsdConfig {
    fn default() -> Self {
        Self {
            max_cost: 10.0,
            max_iterations_per_milestone: 5,
            max_total_prompts: 100,
            checkpoint_interval: 0,
            require_approval_for_sensitive: true,
            auto_resume: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    pub is_repo: bool,
    pub original_branch: Option<String>,
    pub session_branch: Option<String>,
}

impl GitState {
    pub fn not_a_repo() -> Self {
        Self::default()
    }

    /// True when a session branch is active and the push block applies.
    pub fn is_isolated(&self) -> bool {
        self.is_repo && self.session_branch.is_some()
    }
}

/// One FSD run, owned by the plan executor for its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub goal: String,
    pub milestones: Vec<Milestone>,
    pub state: ExecutionState,
    pub config: FsdConfig,
    pub git: Option<GitState>,
}

impl Session {
    pub fn new(goal: impl Into<String>, milestones: Vec<Milestone>, config: FsdConfig) -> Self {
        Self {
            goal: goal.into(),
            milestones,
            state: ExecutionState::new(),
            config,
            git: None,
        }
    }

    /// Rebuild a session from a persisted envelope.
    ///
    /// Milestones left `in_progress` by an interrupted run go back to
    /// `pending` so they are picked up again.
    pub fn from_saved(saved: SavedSession) -> Self {
        let mut milestones = saved.milestones;
        for m in &mut milestones {
            if m.status == MilestoneStatus::InProgress {
                m.status = MilestoneStatus::Pending;
            }
        }
        let mut state = saved.state;
        state.current_milestone = None;
        Self {
            goal: saved.goal,
            milestones,
            state,
            config: saved.config,
            git: saved.git_state,
        }
    }

    pub fn milestone(&self, id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == id)
    }

    pub fn milestone_mut(&mut self, id: &str) -> Option<&mut Milestone> {
        self.milestones.iter_mut().find(|m| m.id == id)
    }

    pub fn set_status(&mut self, id: &str, status: MilestoneStatus) {
        if let Some(m) = self.milestone_mut(id) {
            m.status = status;
        }
    }

    pub fn all_completed(&self) -> bool {
        self.milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Completed)
    }

    pub fn has_incomplete(&self) -> bool {
        !self.all_completed()
    }

    pub fn count(&self, status: MilestoneStatus) -> usize {
        self.milestones.iter().filter(|m| m.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_monotonic() {
        let mut state = ExecutionState::new();
        state.record_cost(1.25);
        state.record_cost(-5.0);
        state.record_cost(f64::NAN);
        state.record_cost(0.75);
        assert!((state.total_cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn record_prompt_counts_and_adds_cost() {
        let mut state = ExecutionState::new();
        state.record_prompt(0.3);
        state.record_prompt(0.0);
        assert_eq!(state.prompt_count, 2);
        assert!((state.total_cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn learnings_are_deduplicated() {
        let mut state = ExecutionState::new();
        assert!(state.add_learning("Always verify imports"));
        assert!(!state.add_learning("Always verify imports"));
        assert!(!state.add_learning("  Always verify imports  "));
        assert!(!state.add_learning("   "));
        assert_eq!(state.learnings.len(), 1);
    }

    #[test]
    fn unmet_dependencies_lists_missing_ids() {
        let m = Milestone::new("m3", "third").with_dependencies(["m1", "m2"]);
        let done = vec!["m1".to_string()];
        assert_eq!(m.unmet_dependencies(&done), vec!["m2"]);
        let done = vec!["m1".to_string(), "m2".to_string()];
        assert!(m.unmet_dependencies(&done).is_empty());
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let mut state = ExecutionState::new();
        state.mark_completed("m1");
        state.mark_completed("m1");
        assert_eq!(state.completed_milestones, vec!["m1"]);
        assert!(state.is_completed("m1"));
    }

    #[test]
    fn milestone_serializes_camel_case() {
        let mut m = Milestone::new("m1", "Setup");
        m.success_criteria = vec!["builds".into()];
        m.qa_goal = Some("app starts".into());
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"successCriteria\""));
        assert!(json.contains("\"qaGoal\""));
        assert!(json.contains("\"status\":\"pending\""));
    }

    #[test]
    fn milestone_deserializes_with_defaults() {
        let m: Milestone = serde_json::from_str(r#"{"id":"a","title":"A"}"#).unwrap();
        assert_eq!(m.status, MilestoneStatus::Pending);
        assert_eq!(m.size, MilestoneSize::Medium);
        assert!(m.dependencies.is_empty());
    }

    #[test]
    fn session_counts_and_completion() {
        let mut session = Session::new(
            "goal",
            vec![Milestone::new("a", "A"), Milestone::new("b", "B")],
            FsdConfig::default(),
        );
        assert!(session.has_incomplete());
        session.set_status("a", MilestoneStatus::Completed);
        assert_eq!(session.count(MilestoneStatus::Completed), 1);
        session.set_status("b", MilestoneStatus::Completed);
        assert!(session.all_completed());
    }

    #[test]
    fn git_state_isolation_requires_branch() {
        assert!(!GitState::not_a_repo().is_isolated());
        let git = GitState {
            is_repo: true,
            original_branch: Some("main".into()),
            session_branch: Some("fsd/x".into()),
        };
        assert!(git.is_isolated());
    }
}
