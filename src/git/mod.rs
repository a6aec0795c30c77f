//! Git branch isolation for an FSD session.
//!
//! A session runs on its own `fsd/<slug>-<timestamp>` branch with a
//! `pre-push` hook that refuses every push. Finishing the session removes
//! the hook (restoring any hook it displaced) and reports what changed
//! relative to the original branch so a human can review before pushing.
//!
//! Lifecycle: `Uninitialized -> Isolated -> Completed`. Any failure while
//! setting up leaves the session running without isolation.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::session::GitState;

const HOOK_NAME: &str = "pre-push";
const HOOK_BACKUP_NAME: &str = "pre-push.fsd-backup";
const HOOK_MARKER: &str = "# fsd-push-block";
const BRANCH_PREFIX: &str = "fsd/";
const MAX_SLUG_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationPhase {
    Uninitialized,
    Isolated,
    Completed,
}

/// Changes on the session branch relative to the original branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub original_branch: String,
    pub session_branch: String,
    pub commits: u32,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} commit(s) on {} vs {}: {} file(s) changed, +{} -{}",
            self.commits,
            self.session_branch,
            self.original_branch,
            self.files_changed,
            self.insertions,
            self.deletions
        )
    }
}

#[derive(Debug, Clone)]
pub struct GitIsolation {
    repo_root: Option<PathBuf>,
    state: GitState,
    phase: IsolationPhase,
    /// Non-fatal problems found while setting up (dirty tree, branch failure).
    pub warnings: Vec<String>,
}

impl GitIsolation {
    fn disabled(state: GitState, warnings: Vec<String>) -> Self {
        Self {
            repo_root: None,
            state,
            phase: IsolationPhase::Uninitialized,
            warnings,
        }
    }

    pub fn state(&self) -> &GitState {
        &self.state
    }

    pub fn phase(&self) -> IsolationPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == IsolationPhase::Isolated
    }

    pub fn session_branch(&self) -> Option<&str> {
        self.state.session_branch.as_deref()
    }

    /// Remove the push block and summarise the session's changes.
    ///
    /// Returns `None` when isolation was never active.
    pub fn finish(&mut self) -> Result<Option<DiffSummary>> {
        if self.phase != IsolationPhase::Isolated {
            return Ok(None);
        }
        let Some(repo_root) = self.repo_root.clone() else {
            return Ok(None);
        };

        remove_push_block(&repo_root)?;
        self.phase = IsolationPhase::Completed;

        let (Some(original), Some(session)) = (
            self.state.original_branch.clone(),
            self.state.session_branch.clone(),
        ) else {
            return Ok(None);
        };
        let summary = diff_summary(&repo_root, &original, &session)?;
        info!(summary = %summary, "git isolation finished");
        Ok(Some(summary))
    }
}

/// Create the session branch and install the push block.
///
/// Never fails: a missing repository or a failed branch creation yields an
/// inactive isolation with the reason in `warnings`.
pub fn start_isolation(project_root: &Path, goal: &str) -> GitIsolation {
    let Some(repo_root) = resolve_repo_root(project_root) else {
        debug!(root = %project_root.display(), "not a git repository; isolation disabled");
        return GitIsolation::disabled(GitState::not_a_repo(), Vec::new());
    };

    let mut warnings = Vec::new();
    match has_uncommitted_changes(&repo_root) {
        Ok(true) => warnings.push(
            "working tree has uncommitted changes; they will be carried onto the session branch"
                .to_string(),
        ),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to inspect working tree"),
    }

    let original = match current_branch_or_commit(&repo_root) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "cannot determine current branch; isolation disabled");
            warnings.push(format!("git isolation disabled: {e}"));
            return GitIsolation::disabled(
                GitState {
                    is_repo: true,
                    ..GitState::default()
                },
                warnings,
            );
        }
    };

    let branch = match create_session_branch(&repo_root, goal) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to create session branch; isolation disabled");
            warnings.push(format!("git isolation disabled: {e}"));
            return GitIsolation::disabled(
                GitState {
                    is_repo: true,
                    original_branch: Some(original),
                    session_branch: None,
                },
                warnings,
            );
        }
    };

    if let Err(e) = install_push_block(&repo_root) {
        warn!(error = %e, "failed to install pre-push hook");
        warnings.push(format!("push block not installed: {e}"));
    }

    info!(original = %original, branch = %branch, "git isolation started");
    GitIsolation {
        repo_root: Some(repo_root),
        state: GitState {
            is_repo: true,
            original_branch: Some(original),
            session_branch: Some(branch),
        },
        phase: IsolationPhase::Isolated,
        warnings,
    }
}

/// Re-enter isolation for a resumed session: check out the saved session
/// branch if needed and make sure the push block is in place.
pub fn resume_isolation(project_root: &Path, saved: &GitState) -> GitIsolation {
    if !saved.is_isolated() {
        return GitIsolation::disabled(saved.clone(), Vec::new());
    }
    let Some(repo_root) = resolve_repo_root(project_root) else {
        return GitIsolation::disabled(
            saved.clone(),
            vec!["saved session used git isolation but this is no longer a repository".into()],
        );
    };
    let Some(branch) = saved.session_branch.as_deref() else {
        return GitIsolation::disabled(saved.clone(), Vec::new());
    };

    let mut warnings = Vec::new();
    let on_branch = current_branch_or_commit(&repo_root).ok();
    if on_branch.as_deref() != Some(branch) {
        match run_git(&repo_root, ["checkout", "-q", branch]) {
            Ok(out) if out.status.success() => {
                info!(branch = %branch, "checked out session branch for resume");
            }
            Ok(out) => {
                let msg = format!(
                    "failed to check out session branch {branch}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                warn!("{msg}");
                warnings.push(msg);
                return GitIsolation::disabled(saved.clone(), warnings);
            }
            Err(e) => {
                warnings.push(format!("failed to check out session branch {branch}: {e}"));
                return GitIsolation::disabled(saved.clone(), warnings);
            }
        }
    }

    if let Err(e) = install_push_block(&repo_root) {
        warn!(error = %e, "failed to re-install pre-push hook");
        warnings.push(format!("push block not installed: {e}"));
    }

    GitIsolation {
        repo_root: Some(repo_root),
        state: saved.clone(),
        phase: IsolationPhase::Isolated,
        warnings,
    }
}

/// Rules appended to every agent prompt while isolation is active.
pub fn isolation_rules(branch: &str) -> String {
    format!(
        "## Git Isolation\n\
         You are working on the isolated branch `{branch}`. While this session runs:\n\
         - Do NOT run `git push` in any form; pushes are blocked by a hook and will fail.\n\
         - Do NOT force-push or rewrite published history.\n\
         - Do NOT merge or rebase into main, master, develop or any release branch.\n\
         - Do NOT run `git reset --hard`, `git clean -fd` or `git checkout -- .`.\n\
         - Do NOT switch branches or delete `{branch}`.\n\
         - Committing to `{branch}` is allowed; a human reviews and pushes afterwards.\n"
    )
}

fn hook_script() -> String {
    format!(
        "#!/bin/sh\n\
         {HOOK_MARKER}\n\
         echo \"fsd: push blocked while an FSD session is running on this branch.\" >&2\n\
         echo \"fsd: review the session branch, then push manually once the session ends.\" >&2\n\
         exit 1\n"
    )
}

fn hooks_dir(repo_root: &Path) -> Result<PathBuf> {
    let output = run_git(repo_root, ["rev-parse", "--git-path", "hooks"])?;
    if !output.status.success() {
        bail!(
            "failed to locate hooks directory: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if raw.is_empty() {
        bail!("git rev-parse returned empty hooks path");
    }
    let path = PathBuf::from(raw);
    Ok(if path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    })
}

fn is_our_hook(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|c| c.contains(HOOK_MARKER))
        .unwrap_or(false)
}

fn install_push_block(repo_root: &Path) -> Result<()> {
    let dir = hooks_dir(repo_root)?;
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let hook = dir.join(HOOK_NAME);
    let backup = dir.join(HOOK_BACKUP_NAME);

    if hook.exists() {
        if is_our_hook(&hook) {
            debug!(hook = %hook.display(), "push block already installed");
            return Ok(());
        }
        if !backup.exists() {
            fs::rename(&hook, &backup).with_context(|| {
                format!("failed to back up existing hook {}", hook.display())
            })?;
            debug!(backup = %backup.display(), "existing pre-push hook backed up");
        }
    }

    fs::write(&hook, hook_script())
        .with_context(|| format!("failed to write {}", hook.display()))?;
    make_executable(&hook)?;
    debug!(hook = %hook.display(), "push block installed");
    Ok(())
}

fn remove_push_block(repo_root: &Path) -> Result<()> {
    let dir = hooks_dir(repo_root)?;
    let hook = dir.join(HOOK_NAME);
    let backup = dir.join(HOOK_BACKUP_NAME);

    if hook.exists() {
        if !is_our_hook(&hook) {
            warn!(hook = %hook.display(), "pre-push hook was replaced during the session; leaving it");
            return Ok(());
        }
        fs::remove_file(&hook).with_context(|| format!("failed to remove {}", hook.display()))?;
    }
    if backup.exists() {
        fs::rename(&backup, &hook)
            .with_context(|| format!("failed to restore {}", backup.display()))?;
        debug!(hook = %hook.display(), "original pre-push hook restored");
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn create_session_branch(repo_root: &Path, goal: &str) -> Result<String> {
    let base = format!(
        "{BRANCH_PREFIX}{}-{}",
        slugify(goal),
        Utc::now().format("%Y%m%d-%H%M%S")
    );
    let mut branch = base.clone();
    let mut n = 2;
    while branch_exists(repo_root, &branch)? {
        branch = format!("{base}-{n}");
        n += 1;
    }

    let output = run_git(repo_root, ["checkout", "-q", "-b", branch.as_str()])?;
    if !output.status.success() {
        bail!(
            "git checkout -b {} failed: {}",
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(branch)
}

fn slugify(goal: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;

    for c in goal.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    let slug = out.trim_matches('-').to_string();
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}

fn resolve_repo_root(project_root: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .current_dir(project_root)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

fn has_uncommitted_changes(repo_root: &Path) -> Result<bool> {
    let output = run_git(repo_root, ["status", "--porcelain"])?;
    if !output.status.success() {
        bail!(
            "git status failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

/// Current branch name, or the HEAD commit when detached.
fn current_branch_or_commit(repo_root: &Path) -> Result<String> {
    let output = run_git(repo_root, ["branch", "--show-current"])?;
    if !output.status.success() {
        bail!(
            "failed to determine current branch: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !branch.is_empty() {
        return Ok(branch);
    }

    let output = run_git(repo_root, ["rev-parse", "HEAD"])?;
    if !output.status.success() {
        bail!(
            "repository has no commits: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let ref_name = format!("refs/heads/{branch}");
    let output = run_git(
        repo_root,
        ["show-ref", "--verify", "--quiet", ref_name.as_str()],
    )?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => bail!(
            "failed to check branch '{}': {}",
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

fn diff_summary(repo_root: &Path, original: &str, session: &str) -> Result<DiffSummary> {
    let range = format!("{original}..{session}");
    let output = run_git(repo_root, ["rev-list", "--count", range.as_str()])?;
    if !output.status.success() {
        bail!(
            "failed to count session commits: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let commits = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .unwrap_or(0);

    // Working tree against the original branch, so uncommitted agent edits count too.
    let output = run_git(repo_root, ["diff", "--shortstat", original])?;
    if !output.status.success() {
        bail!(
            "failed to diff against {}: {}",
            original,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let (files_changed, insertions, deletions) =
        parse_shortstat(&String::from_utf8_lossy(&output.stdout));

    Ok(DiffSummary {
        original_branch: original.to_string(),
        session_branch: session.to_string(),
        commits,
        files_changed,
        insertions,
        deletions,
    })
}

/// Parse ` 3 files changed, 10 insertions(+), 2 deletions(-)`.
fn parse_shortstat(line: &str) -> (u32, u32, u32) {
    let mut files = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for part in line.trim().split(',') {
        let part = part.trim();
        let Some((num, rest)) = part.split_once(' ') else {
            continue;
        };
        let Ok(n) = num.parse::<u32>() else {
            continue;
        };
        if rest.starts_with("file") {
            files = n;
        } else if rest.starts_with("insertion") {
            insertions = n;
        } else if rest.starts_with("deletion") {
            deletions = n;
        }
    }
    (files, insertions, deletions)
}

fn run_git<I, S>(repo_root: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git in {}", repo_root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(repo: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn init_repo() -> Option<tempfile::TempDir> {
        if !git_available() {
            return None;
        }

        let tmp = tempfile::tempdir().unwrap();
        git(tmp.path(), &["init", "-q"]);
        git(tmp.path(), &["config", "user.email", "fsd-test@example.com"]);
        git(tmp.path(), &["config", "user.name", "FSD Test"]);

        fs::write(tmp.path().join("README.md"), "init\n").unwrap();
        git(tmp.path(), &["add", "README.md"]);
        git(tmp.path(), &["commit", "-q", "-m", "init"]);

        Some(tmp)
    }

    fn hook_path(repo: &Path) -> PathBuf {
        hooks_dir(repo).unwrap().join(HOOK_NAME)
    }

    #[test]
    fn slugify_normalizes_goal() {
        assert_eq!(slugify("Add OAuth login!"), "add-oauth-login");
        assert_eq!(slugify("///"), "session");
        assert!(slugify(&"x".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn parse_shortstat_reads_all_fields() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)\n"),
            (3, 10, 2)
        );
        assert_eq!(parse_shortstat(" 1 file changed, 1 insertion(+)"), (1, 1, 0));
        assert_eq!(parse_shortstat(""), (0, 0, 0));
    }

    #[test]
    fn isolation_rules_name_branch_and_forbid_push() {
        let rules = isolation_rules("fsd/x-1");
        assert!(rules.contains("fsd/x-1"));
        assert!(rules.contains("git push"));
        assert!(rules.contains("force-push"));
        assert!(rules.contains("reset --hard"));
        assert!(rules.contains("main"));
    }

    #[test]
    fn non_repo_disables_isolation() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let iso = start_isolation(tmp.path(), "goal");
        assert!(!iso.state().is_repo);
        assert!(!iso.is_active());
    }

    #[test]
    fn start_creates_branch_and_blocks_push() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let original = git(tmp.path(), &["branch", "--show-current"]);

        let iso = start_isolation(tmp.path(), "Add login page");
        assert!(iso.is_active());
        let branch = iso.session_branch().unwrap().to_string();
        assert!(branch.starts_with("fsd/add-login-page-"), "branch: {branch}");
        assert_eq!(git(tmp.path(), &["branch", "--show-current"]), branch);
        assert_eq!(iso.state().original_branch.as_deref(), Some(original.as_str()));

        let hook = hook_path(tmp.path());
        assert!(is_our_hook(&hook));
        let status = Command::new("sh").arg(&hook).status().unwrap();
        assert!(!status.success(), "hook must refuse the push");
    }

    #[test]
    fn dirty_tree_warns_but_continues() {
        let Some(tmp) = init_repo() else {
            return;
        };
        fs::write(tmp.path().join("README.md"), "changed\n").unwrap();
        let iso = start_isolation(tmp.path(), "goal");
        assert!(iso.is_active());
        assert!(iso.warnings.iter().any(|w| w.contains("uncommitted")));
    }

    #[test]
    fn finish_removes_hook_and_restores_backup() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let hook = hook_path(tmp.path());
        fs::create_dir_all(hook.parent().unwrap()).unwrap();
        let original_hook = "#!/bin/sh\n# team hook\nexit 0\n";
        fs::write(&hook, original_hook).unwrap();

        let mut iso = start_isolation(tmp.path(), "goal");
        assert!(is_our_hook(&hook));

        iso.finish().unwrap();
        assert_eq!(iso.phase(), IsolationPhase::Completed);
        assert_eq!(fs::read_to_string(&hook).unwrap(), original_hook);
        assert!(!hook.with_file_name(HOOK_BACKUP_NAME).exists());
    }

    #[test]
    fn finish_without_prior_hook_leaves_none() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let mut iso = start_isolation(tmp.path(), "goal");
        let hook = hook_path(tmp.path());
        assert!(hook.exists());
        iso.finish().unwrap();
        assert!(!hook.exists());
        // second finish is a no-op
        assert!(iso.finish().unwrap().is_none());
    }

    #[test]
    fn finish_reports_commits_and_stats() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let mut iso = start_isolation(tmp.path(), "goal");
        fs::write(tmp.path().join("new.txt"), "a\nb\n").unwrap();
        git(tmp.path(), &["add", "new.txt"]);
        git(tmp.path(), &["commit", "-q", "-m", "add new"]);

        let summary = iso.finish().unwrap().unwrap();
        assert_eq!(summary.commits, 1);
        assert_eq!(summary.files_changed, 1);
        assert_eq!(summary.insertions, 2);
        assert_eq!(summary.deletions, 0);
    }

    #[test]
    fn resume_checks_out_branch_and_reinstalls_hook() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let mut iso = start_isolation(tmp.path(), "goal");
        let state = iso.state().clone();
        let original = state.original_branch.clone().unwrap();

        // simulate an aborted session whose hook was cleaned up by hand
        iso.finish().unwrap();
        git(tmp.path(), &["checkout", "-q", original.as_str()]);

        let resumed = resume_isolation(tmp.path(), &state);
        assert!(resumed.is_active());
        assert_eq!(
            git(tmp.path(), &["branch", "--show-current"]),
            state.session_branch.unwrap()
        );
        assert!(is_our_hook(&hook_path(tmp.path())));
    }

    #[test]
    fn resume_without_isolation_stays_inactive() {
        let iso = resume_isolation(Path::new("."), &GitState::not_a_repo());
        assert!(!iso.is_active());
    }
}
