//! Automated checks (build / typecheck / test / lint) run after each agent
//! attempt.
//!
//! A check whose own program or script does not exist (no such npm script,
//! tool not installed) counts as passed: absence is not failure. Any other
//! non-zero exit is a failure. The checks
//! run concurrently and all finish before a verdict is returned.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::safety::redact_lines;

/// Names of the auto-detected checks, in reporting order.
pub const CHECK_NAMES: [&str; 4] = ["build", "typecheck", "test", "lint"];

const MAX_FEEDBACK_BYTES: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Combined, redacted output. `None` for checks that did not apply.
    pub output: Option<String>,
    /// The command was inapplicable and counted as a pass.
    pub skipped: bool,
    pub exit_code: Option<i32>,
}

impl CheckResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            output: None,
            skipped: true,
            exit_code: None,
        }
    }
}

/// A named shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCommand {
    pub name: String,
    pub command: String,
}

impl CheckCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Runs the project's verification suite.
pub trait CheckRunner: Send + Sync {
    fn run_checks(&self, project_root: &Path) -> Vec<CheckResult>;
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

pub fn failing(results: &[CheckResult]) -> Vec<&CheckResult> {
    results.iter().filter(|r| !r.passed).collect()
}

/// Shell-based runner: explicit commands, or detection from project files.
#[derive(Debug, Clone)]
pub struct ShellCheckRunner {
    commands: Option<Vec<CheckCommand>>,
    timeout: Duration,
    abort: Option<Arc<AtomicBool>>,
}

impl ShellCheckRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            commands: None,
            timeout,
            abort: None,
        }
    }

    /// Use these commands instead of auto-detection.
    pub fn with_commands(mut self, commands: Vec<CheckCommand>) -> Self {
        if !commands.is_empty() {
            self.commands = Some(commands);
        }
        self
    }

    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// The checks for `project_root`; `None` command means inapplicable.
    pub fn plan(&self, project_root: &Path) -> Vec<(String, Option<String>)> {
        match &self.commands {
            Some(cmds) => cmds
                .iter()
                .map(|c| (c.name.clone(), Some(c.command.clone())))
                .collect(),
            None => detect_checks(project_root),
        }
    }
}

impl CheckRunner for ShellCheckRunner {
    fn run_checks(&self, project_root: &Path) -> Vec<CheckResult> {
        let plan = self.plan(project_root);
        info!(
            root = %project_root.display(),
            checks = plan.len(),
            "running automated checks"
        );

        let results: Vec<CheckResult> = thread::scope(|scope| {
            let handles: Vec<_> = plan
                .iter()
                .map(|(name, command)| {
                    let abort = self.abort.clone();
                    scope.spawn(move || match command {
                        None => CheckResult::skipped(name.clone()),
                        Some(cmd) => run_check(name, cmd, project_root, self.timeout, abort)
                            .unwrap_or_else(|e| CheckResult {
                                name: name.clone(),
                                passed: false,
                                output: Some(format!("failed to run `{cmd}`: {e:#}")),
                                skipped: false,
                                exit_code: None,
                            }),
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(plan.iter())
                .map(|(h, (name, _))| {
                    h.join().unwrap_or_else(|_| CheckResult {
                        name: name.clone(),
                        passed: false,
                        output: Some("check runner thread panicked".to_string()),
                        skipped: false,
                        exit_code: None,
                    })
                })
                .collect()
        });

        for r in &results {
            debug!(name = %r.name, passed = r.passed, skipped = r.skipped, "check finished");
        }
        results
    }
}

/// Detect build/typecheck/test/lint commands from project manifests.
pub fn detect_checks(project_root: &Path) -> Vec<(String, Option<String>)> {
    let package_json = project_root.join("package.json");
    if package_json.is_file() {
        let scripts = read_npm_scripts(&package_json);
        let pm = package_manager(project_root);
        return CHECK_NAMES
            .iter()
            .map(|name| {
                let cmd = scripts
                    .iter()
                    .any(|s| s == name)
                    .then(|| format!("{pm} run {name}"));
                (name.to_string(), cmd)
            })
            .collect();
    }

    if project_root.join("Cargo.toml").is_file() {
        return vec![
            ("build".into(), Some("cargo build --quiet".into())),
            ("typecheck".into(), Some("cargo check --quiet --all-targets".into())),
            ("test".into(), Some("cargo test --quiet".into())),
            ("lint".into(), Some("cargo clippy --quiet --all-targets".into())),
        ];
    }

    CHECK_NAMES.iter().map(|n| (n.to_string(), None)).collect()
}

fn read_npm_scripts(package_json: &Path) -> Vec<String> {
    let parsed = std::fs::read_to_string(package_json)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
    let Some(value) = parsed else {
        warn!(path = %package_json.display(), "unreadable package.json; npm checks skipped");
        return Vec::new();
    };
    value
        .get("scripts")
        .and_then(serde_json::Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn package_manager(project_root: &Path) -> &'static str {
    if project_root.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if project_root.join("yarn.lock").exists() {
        "yarn"
    } else if project_root.join("bun.lockb").exists() || project_root.join("bun.lock").exists() {
        "bun"
    } else {
        "npm"
    }
}

/// True when the check's own program (or package script) does not exist.
///
/// Exit 127 is the shell's "command not found". Otherwise the output must
/// name the check program itself; errors about other missing files or
/// tools are real failures.
fn is_inapplicable(command: &str, exit_code: Option<i32>, output: &str) -> bool {
    if exit_code == Some(127) {
        return true;
    }
    let lower = output.to_ascii_lowercase();
    if lower.lines().count() > 10 {
        return false;
    }
    let Some(program) = command.split_whitespace().next() else {
        return false;
    };
    let program = program.rsplit('/').next().unwrap_or(program).to_ascii_lowercase();
    match program.as_str() {
        "npm" | "pnpm" | "yarn" => lower.contains("missing script"),
        "bun" => lower.contains("script not found"),
        "cargo" => lower.contains("no such command"),
        _ => {
            lower.contains(&format!("{program}: not found"))
                || lower.contains(&format!("{program}: command not found"))
        }
    }
}

fn run_check(
    name: &str,
    command: &str,
    work_dir: &Path,
    timeout: Duration,
    abort: Option<Arc<AtomicBool>>,
) -> Result<CheckResult> {
    debug!(name, command, "running check");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute check command: {command}"))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait().context("failed to wait for check")? {
            break status;
        }
        let aborted = abort.as_ref().is_some_and(|a| a.load(Ordering::SeqCst));
        if aborted || started.elapsed() >= timeout {
            timed_out = !aborted;
            warn!(name, aborted, "check interrupted; killing");
            let _ = child.kill();
            break child.wait().context("failed to wait for killed check")?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = String::from_utf8_lossy(&stdout_handle.join().unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_handle.join().unwrap_or_default()).to_string();
    let mut combined = if stderr.is_empty() {
        stdout
    } else {
        format!("{stdout}\n--- stderr ---\n{stderr}")
    };
    if timed_out {
        combined.push_str(&format!("\n[check timed out after {}s]", timeout.as_secs()));
    }
    let combined = redact_lines(&combined);
    let exit_code = status.code();

    if !status.success() && !timed_out && is_inapplicable(command, exit_code, &combined) {
        debug!(name, "check not applicable; counted as passed");
        return Ok(CheckResult {
            name: name.to_string(),
            passed: true,
            output: Some(combined),
            skipped: true,
            exit_code,
        });
    }

    Ok(CheckResult {
        name: name.to_string(),
        passed: status.success() && !timed_out,
        output: Some(combined),
        skipped: false,
        exit_code,
    })
}

/// Keep the tail of long output; the end usually holds the error.
pub fn truncate_tail(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut start = output.len() - max_bytes;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...(truncated)...\n{}", &output[start..])
}

/// Summarise only the failing checks for a fix prompt.
pub fn format_failure_feedback(results: &[CheckResult]) -> String {
    let mut feedback = String::new();
    for r in failing(results) {
        feedback.push_str(&format!("### {} failed", r.name));
        if let Some(code) = r.exit_code {
            feedback.push_str(&format!(" (exit code {code})"));
        }
        feedback.push('\n');
        let output = r.output.as_deref().unwrap_or("");
        feedback.push_str("```\n");
        feedback.push_str(truncate_tail(output.trim(), MAX_FEEDBACK_BYTES).as_str());
        feedback.push_str("\n```\n\n");
    }
    feedback
}
