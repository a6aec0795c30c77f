//! External coding agent boundary.
//!
//! The executor never assumes how an agent satisfies a prompt. It hands over
//! an [`AgentRequest`], receives live [`StreamEvent`]s through a callback and
//! gets back an [`AgentResponse`] with cost and the resume token for the next
//! call. [`claude::ClaudeCodeRunner`] drives the Claude Code CLI.

pub mod claude;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::safety::is_dangerous_command;

/// Longest tool rendering shown on a console line.
pub const MAX_DISPLAY_LEN: usize = 200;

/// One live event from a running agent, already rendered for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Assistant prose.
    Text(String),
    /// A tool invocation.
    ToolUse(ToolCall),
}

/// A tool invocation as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    /// Redacted single-line rendering, e.g. `$ cargo test` or
    /// `Reading src/main.rs...`.
    pub rendered: String,
    /// Dangerous-command rule hit by the raw shell command, if any.
    pub flagged: Option<&'static str>,
}

impl ToolCall {
    /// `raw_command` is classified as given, before any redaction or
    /// display truncation.
    pub fn new(rendered: String, raw_command: Option<&str>) -> Self {
        let flagged = raw_command.and_then(|cmd| {
            let verdict = is_dangerous_command(cmd);
            verdict
                .dangerous
                .then(|| verdict.label.unwrap_or("dangerous command"))
        });
        Self { rendered, flagged }
    }

    /// Rendering cut to [`MAX_DISPLAY_LEN`] characters.
    pub fn display(&self) -> String {
        if self.rendered.chars().count() <= MAX_DISPLAY_LEN {
            return self.rendered.clone();
        }
        let cut: String = self.rendered.chars().take(MAX_DISPLAY_LEN).collect();
        format!("{cut}...")
    }
}

impl From<&str> for ToolCall {
    /// Build from a rendering alone; a `$ ` rendering is classified as the
    /// command it carries.
    fn from(rendered: &str) -> Self {
        Self::new(rendered.to_string(), rendered.strip_prefix("$ "))
    }
}

impl StreamEvent {
    pub fn text(&self) -> &str {
        match self {
            StreamEvent::Text(s) => s,
            StreamEvent::ToolUse(call) => &call.rendered,
        }
    }

    /// Shell command carried by a `$ <command>` rendering.
    pub fn shell_command(&self) -> Option<&str> {
        match self {
            StreamEvent::ToolUse(call) => call.rendered.strip_prefix("$ "),
            StreamEvent::Text(_) => None,
        }
    }

    /// File path carried by a `Reading/Writing/Editing <path>...` rendering.
    pub fn file_path(&self) -> Option<&str> {
        let StreamEvent::ToolUse(call) = self else {
            return None;
        };
        ["Reading ", "Writing ", "Editing "]
            .iter()
            .find_map(|prefix| call.rendered.strip_prefix(prefix))
            .map(|rest| rest.strip_suffix("...").unwrap_or(rest))
    }
}

/// Everything needed for one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    /// Continue a prior agent conversation.
    pub resume_token: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub allowed_tools: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub abort: Option<Arc<AtomicBool>>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostBreakdown {
    pub total_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub per_model: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    /// Final assistant text, redacted.
    pub output: String,
    /// Resume token for the next invocation.
    pub session_id: Option<String>,
    pub cost: CostBreakdown,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("agent invocation aborted")]
    Aborted,
    #[error("agent i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

/// Anything that can run a prompt to completion.
pub trait AgentRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run `request`, reporting live events through `on_event`.
    ///
    /// Blocks until the agent exits, the timeout elapses or the abort flag
    /// is raised.
    fn execute(
        &self,
        request: &AgentRequest,
        on_event: &mut dyn FnMut(StreamEvent),
    ) -> Result<AgentResponse, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _accepts_dyn(_runner: &dyn AgentRunner) {}
        let runner = claude::ClaudeCodeRunner::new(None);
        _accepts_dyn(&runner);
    }

    #[test]
    fn shell_command_extraction() {
        let ev = StreamEvent::ToolUse("$ cargo test".into());
        assert_eq!(ev.shell_command(), Some("cargo test"));
        assert_eq!(StreamEvent::Text("$ nope".into()).shell_command(), None);
    }

    #[test]
    fn file_path_extraction() {
        let ev = StreamEvent::ToolUse("Reading /home/u/.ssh/id_rsa...".into());
        assert_eq!(ev.file_path(), Some("/home/u/.ssh/id_rsa"));
        let ev = StreamEvent::ToolUse("Editing src/lib.rs...".into());
        assert_eq!(ev.file_path(), Some("src/lib.rs"));
        assert_eq!(StreamEvent::ToolUse("Using WebFetch".into()).file_path(), None);
    }

    #[test]
    fn display_cuts_long_renderings_only() {
        let long = format!("$ echo {}", "a".repeat(300));
        let call = ToolCall::from(long.as_str());
        assert_eq!(call.rendered, long);
        assert_eq!(call.display().chars().count(), MAX_DISPLAY_LEN + 3);
        assert!(call.display().ends_with("..."));
        assert_eq!(ToolCall::from("$ ls").display(), "$ ls");
    }

    #[test]
    fn abort_flag_is_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let req = AgentRequest {
            abort: Some(flag.clone()),
            ..AgentRequest::new("p", "/tmp")
        };
        assert!(!req.is_aborted());
        flag.store(true, Ordering::SeqCst);
        assert!(req.is_aborted());
    }

    #[test]
    fn timeout_error_renders_seconds() {
        let err = AgentError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "agent timed out after 90s");
    }
}
