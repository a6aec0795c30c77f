//! Durable session snapshots at `.claude/fsd-state.json`.
//!
//! The envelope is versioned; anything unreadable (missing file, bad JSON,
//! other schema version) loads as "no saved session" instead of an error.
//! Writes go to a sibling temp file and are renamed into place so a reader
//! never observes a torn file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths;
use crate::session::{ExecutionState, FsdConfig, GitState, Milestone, MilestoneStatus, Session};

/// Schema version of the on-disk envelope.
pub const STATE_VERSION: u32 = 1;

/// Saves older than this are not offered for resume.
pub const STALE_AFTER_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub goal: String,
    pub milestones: Vec<Milestone>,
    pub state: ExecutionState,
    pub config: FsdConfig,
    pub git_state: Option<GitState>,
}

impl SavedSession {
    pub fn from_session(session: &Session, saved_at: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at,
            goal: session.goal.clone(),
            milestones: session.milestones.clone(),
            state: session.state.clone(),
            config: session.config.clone(),
            git_state: session.git.clone(),
        }
    }

    pub fn has_incomplete(&self) -> bool {
        self.milestones
            .iter()
            .any(|m| m.status != MilestoneStatus::Completed)
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.saved_at
    }
}

/// Last issued save timestamp in microseconds; keeps `saved_at` strictly
/// increasing even when two saves land in the same clock tick.
static LAST_SAVE_MICROS: AtomicI64 = AtomicI64::new(0);

fn next_save_time() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_SAVE_MICROS.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_SAVE_MICROS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

/// Persist the whole session. Returns the canonical state file path.
pub fn save(project_root: &Path, session: &Session) -> Result<PathBuf> {
    let path = paths::state_file(project_root);
    let envelope = SavedSession::from_session(session, next_save_time());
    let json =
        serde_json::to_string_pretty(&envelope).context("failed to serialize session state")?;
    write_atomic(&path, &json)?;
    debug!(path = %path.display(), saved_at = %envelope.saved_at, "session state saved");
    Ok(path)
}

/// Load the saved session, or `None` when there is nothing usable.
pub fn load(project_root: &Path) -> Option<SavedSession> {
    let path = paths::state_file(project_root);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read session state");
            }
            return None;
        }
    };

    // Check the version before committing to the full schema.
    let version = serde_json::from_str::<serde_json::Value>(&contents)
        .ok()
        .and_then(|v| v.get("version").and_then(serde_json::Value::as_u64));
    match version {
        Some(v) if v == u64::from(STATE_VERSION) => {}
        Some(v) => {
            warn!(found = v, expected = STATE_VERSION, "ignoring session state with other version");
            return None;
        }
        None => {
            warn!(path = %path.display(), "ignoring malformed session state");
            return None;
        }
    }

    match serde_json::from_str::<SavedSession>(&contents) {
        Ok(saved) => Some(saved),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed session state");
            None
        }
    }
}

/// True when a fresh save exists with at least one milestone left to do.
pub fn is_resumable(project_root: &Path) -> bool {
    match load(project_root) {
        Some(saved) => saved.age() < Duration::hours(STALE_AFTER_HOURS) && saved.has_incomplete(),
        None => false,
    }
}

/// Delete the saved session. Missing file is not an error.
pub fn clear(project_root: &Path) -> Result<()> {
    let path = paths::state_file(project_root);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "session state cleared");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace state {}", path.display()))?;
    Ok(())
}
