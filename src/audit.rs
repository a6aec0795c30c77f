//! Post-execution audit: hash the project tree around every agent call.
//!
//! The agent process is not sandboxed, so comparing content hashes before
//! and after an invocation is the only way to see what it really touched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::agent::{AgentError, AgentRequest, AgentResponse, AgentRunner, StreamEvent};
use crate::safety::{is_forbidden_path, redact_secrets};

/// Directories never walked: VCS metadata, dependencies, build output.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "coverage",
    "__pycache__",
    ".venv",
    "venv",
    "vendor",
    ".turbo",
    ".cache",
];

/// Path prefixes of files under `.claude/` written by the session itself.
const OWN_ARTIFACTS: &[&str] = &[
    ".claude/fsd-logs",
    ".claude/fsd-state.json",
    ".claude/fsd-pause",
    ".claude/qa-report-",
];

const SENSITIVE_TOKENS: &[&str] = &[".env", ".ssh", "credentials", "secret", "token", "password"];

/// Relative path (forward slashes) to hex content hash.
pub type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    Warning,
    Blocked,
    Checkpoint,
    Approved,
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityEventKind::Warning => "warning",
            SecurityEventKind::Blocked => "blocked",
            SecurityEventKind::Checkpoint => "checkpoint",
            SecurityEventKind::Approved => "approved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub message: String,
    pub command: Option<String>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            command: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(SecurityEventKind::Warning, message)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(redact_secrets(&command.into()));
        self
    }
}

/// Hash every regular file under `root`, skipping dependency and build dirs.
pub fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut out = Snapshot::new();
    walk(root, root, &mut out)?;
    debug!(root = %root.display(), files = out.len(), "snapshot taken");
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Snapshot) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if file_type.is_symlink() {
            continue;
        }
        let rel = relative_key(root, &path);
        if OWN_ARTIFACTS.iter().any(|a| rel.starts_with(a)) {
            continue;
        }
        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            match hash_file(&path) {
                Ok(h) => {
                    out.insert(rel, h);
                }
                // vanished or unreadable mid-walk; the next snapshot catches up
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable file"),
            }
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Differences between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub modified: Vec<String>,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub env_modified: bool,
    pub claude_md_modified: bool,
    pub sensitive_files: Vec<String>,
}

impl AuditReport {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.created.is_empty() && self.deleted.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.modified.len() + self.created.len() + self.deleted.len()
    }

    /// True when a human should approve before the session continues.
    pub fn needs_approval(&self) -> bool {
        self.env_modified || !self.sensitive_files.is_empty()
    }

    /// Warnings worth surfacing to the observer.
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        let mut events = Vec::new();
        if self.env_modified {
            events.push(SecurityEvent::warning(
                "environment file changed during agent run",
            ));
        }
        if self.claude_md_modified {
            events.push(SecurityEvent::warning(
                "CLAUDE.md changed during agent run; review agent instructions",
            ));
        }
        if !self.sensitive_files.is_empty() {
            events.push(SecurityEvent::warning(format!(
                "sensitive files touched: {}",
                self.sensitive_files.join(", ")
            )));
        }
        events
    }
}

pub fn is_sensitive(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    SENSITIVE_TOKENS.iter().any(|t| lower.contains(t))
}

fn is_env_file(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.to_ascii_lowercase().contains(".env"))
}

fn is_claude_md(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.eq_ignore_ascii_case("CLAUDE.md"))
}

/// Compare two snapshots.
pub fn diff(before: &Snapshot, after: &Snapshot) -> AuditReport {
    let mut report = AuditReport::default();
    for (path, hash) in after {
        match before.get(path) {
            Some(old) if old == hash => {}
            Some(_) => report.modified.push(path.clone()),
            None => report.created.push(path.clone()),
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            report.deleted.push(path.clone());
        }
    }

    let changed = report.modified.iter().chain(report.created.iter());
    for path in changed {
        if is_env_file(path) {
            report.env_modified = true;
        }
        if is_claude_md(path) {
            report.claude_md_modified = true;
        }
    }
    report.sensitive_files = report
        .modified
        .iter()
        .chain(report.created.iter())
        .chain(report.deleted.iter())
        .filter(|p| is_sensitive(p))
        .cloned()
        .collect();
    report.sensitive_files.sort();
    report
}

/// Flag dangerous commands and forbidden paths in a live agent event.
pub fn inspect_event(event: &StreamEvent) -> Option<SecurityEvent> {
    if let StreamEvent::ToolUse(call) = event {
        if let Some(label) = call.flagged {
            let command = event.shell_command().unwrap_or(&call.rendered);
            return Some(
                SecurityEvent::warning(format!("agent ran a flagged command: {label}"))
                    .with_command(command),
            );
        }
    }
    if let Some(path) = event.file_path() {
        if is_forbidden_path(path) {
            return Some(SecurityEvent::warning(format!(
                "agent accessed a forbidden path: {path}"
            )));
        }
    }
    None
}

/// Result of one audited agent invocation.
#[derive(Debug)]
pub struct AuditedRun {
    pub response: Result<AgentResponse, AgentError>,
    /// `None` when a snapshot could not be taken.
    pub report: Option<AuditReport>,
}

/// Run the agent between two snapshots, inspecting every live event.
///
/// Security findings go to `on_security` as they happen; file-level
/// findings are emitted after the agent exits.
pub fn run_audited(
    runner: &dyn AgentRunner,
    request: &AgentRequest,
    on_event: &mut dyn FnMut(StreamEvent),
    on_security: &mut dyn FnMut(SecurityEvent),
) -> AuditedRun {
    let before = match snapshot(&request.cwd) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "pre-run snapshot failed; audit disabled for this call");
            None
        }
    };

    let response = runner.execute(request, &mut |event| {
        if let Some(sec) = inspect_event(&event) {
            on_security(sec);
        }
        on_event(event);
    });

    let report = before.and_then(|before| match snapshot(&request.cwd) {
        Ok(after) => Some(diff(&before, &after)),
        Err(e) => {
            warn!(error = %e, "post-run snapshot failed");
            None
        }
    });
    if let Some(report) = &report {
        debug!(
            modified = report.modified.len(),
            created = report.created.len(),
            deleted = report.deleted.len(),
            sensitive = report.sensitive_files.len(),
            "post-run audit"
        );
        for event in report.security_events() {
            on_security(event);
        }
    }

    AuditedRun { response, report }
}
