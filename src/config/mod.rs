use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checks::CheckCommand;
use crate::executor::ExecutorOptions;
use crate::session::FsdConfig;

const CONFIG_FILENAME: &str = "fsd.toml";
const CONFIG_DIR: &str = ".claude";

/// Session limits. Copied into every new session's [`FsdConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_milestone: u32,
    #[serde(default = "default_max_total_prompts")]
    pub max_total_prompts: u32,
    /// Ask for confirmation after every N completed milestones. 0 disables.
    #[serde(default)]
    pub checkpoint_interval: u32,
    #[serde(default = "default_true")]
    pub require_approval_for_sensitive: bool,
    #[serde(default)]
    pub auto_resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_qa_timeout_secs")]
    pub qa_timeout_secs: u64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Per-invocation spend cap passed to the agent.
    #[serde(default)]
    pub max_budget_per_prompt: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_fix: bool,
}

/// Check commands. An empty `commands` list means auto-detect.
///
/// ```toml
/// [[checks.commands]]
/// name = "test"
/// command = "cargo test --workspace"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    #[serde(default)]
    pub commands: Vec<CheckCommand>,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_true")]
    pub isolation: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_cost() -> f64 {
    10.0
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_total_prompts() -> u32 {
    100
}

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    30 * 60
}

fn default_qa_timeout_secs() -> u64 {
    10 * 60
}

fn default_check_timeout_secs() -> u64 {
    10 * 60
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cost: default_max_cost(),
            max_iterations_per_milestone: default_max_iterations(),
            max_total_prompts: default_max_total_prompts(),
            checkpoint_interval: 0,
            require_approval_for_sensitive: true,
            auto_resume: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            extra_args: Vec::new(),
            timeout_secs: default_agent_timeout_secs(),
            qa_timeout_secs: default_qa_timeout_secs(),
            allowed_tools: Vec::new(),
            max_budget_per_prompt: None,
        }
    }
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_fix: true,
        }
    }
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { isolation: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub qa: QaConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.claude/fsd.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn to_fsd_config(&self) -> FsdConfig {
        FsdConfig {
            max_cost: self.limits.max_cost,
            max_iterations_per_milestone: self.limits.max_iterations_per_milestone,
            max_total_prompts: self.limits.max_total_prompts,
            checkpoint_interval: self.limits.checkpoint_interval,
            require_approval_for_sensitive: self.limits.require_approval_for_sensitive,
            auto_resume: self.limits.auto_resume,
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            agent_timeout: Duration::from_secs(self.agent.timeout_secs),
            qa_timeout: Duration::from_secs(self.agent.qa_timeout_secs),
            qa_enabled: self.qa.enabled,
            qa_auto_fix: self.qa.auto_fix,
            allowed_tools: self.agent.allowed_tools.clone(),
            max_budget_per_prompt: self.agent.max_budget_per_prompt,
            env: Vec::new(),
            git_isolation: self.git.isolation,
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.checks.timeout_secs)
    }
}
