use std::path::{Path, PathBuf};

const CLAUDE_DIR: &str = ".claude";
const STATE_FILENAME: &str = "fsd-state.json";
const LOGS_DIR: &str = "fsd-logs";
const PAUSE_MARKER: &str = "fsd-pause";

/// Directory holding all per-project FSD artifacts (`<project>/.claude`).
pub fn claude_dir(project_root: &Path) -> PathBuf {
    project_root.join(CLAUDE_DIR)
}

/// Canonical location of the persisted session envelope.
pub fn state_file(project_root: &Path) -> PathBuf {
    claude_dir(project_root).join(STATE_FILENAME)
}

/// QA report written by the agent for one milestone.
pub fn qa_report_file(project_root: &Path, milestone_id: &str) -> PathBuf {
    claude_dir(project_root).join(format!("qa-report-{}.md", sanitize_id(milestone_id)))
}

/// Directory for JSON-lines execution logs.
pub fn logs_dir(project_root: &Path) -> PathBuf {
    claude_dir(project_root).join(LOGS_DIR)
}

/// Marker file whose presence pauses a running session.
pub fn pause_marker(project_root: &Path) -> PathBuf {
    claude_dir(project_root).join(PAUSE_MARKER)
}

/// Keep milestone ids usable as file name fragments.
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "milestone".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_file_lives_under_claude_dir() {
        let p = state_file(Path::new("/project"));
        assert_eq!(p, PathBuf::from("/project/.claude/fsd-state.json"));
    }

    #[test]
    fn qa_report_uses_milestone_id() {
        let p = qa_report_file(Path::new("/project"), "m-2");
        assert_eq!(p, PathBuf::from("/project/.claude/qa-report-m-2.md"));
    }

    #[test]
    fn qa_report_sanitizes_path_separators() {
        let p = qa_report_file(Path::new("/project"), "../etc/passwd");
        assert_eq!(p.parent().unwrap(), Path::new("/project/.claude"));
        assert!(!p.to_string_lossy().contains(".."));
    }

    #[test]
    fn empty_id_falls_back() {
        let p = qa_report_file(Path::new("/p"), "...");
        assert!(p.ends_with("qa-report-milestone.md"));
    }
}
