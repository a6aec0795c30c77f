//! End-to-end plan runs against scripted agents and checks.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use fsd::checks::CheckResult;
use fsd::executor::{ExecutorOptions, RunContext, run_plan};
use fsd::log::ExecutionLog;
use fsd::plan::Plan;
use fsd::session::{FsdConfig, MilestoneStatus, Session};
use fsd::state;
use fsd::testing::{RecordingObserver, ScriptedAgent, StaticChecks};

const CHAIN_PLAN: &str = r#"{
    "goal": "add search",
    "milestones": [
        {"id": "index", "title": "Build the index"},
        {"id": "api", "title": "Expose the API", "dependencies": ["index"]}
    ]
}"#;

fn offline_options() -> ExecutorOptions {
    ExecutorOptions {
        qa_enabled: false,
        git_isolation: false,
        ..ExecutorOptions::default()
    }
}

fn chain_session(config: FsdConfig) -> Session {
    Plan::from_json(CHAIN_PLAN).unwrap().into_session(config)
}

fn failing_check() -> Vec<CheckResult> {
    vec![CheckResult {
        name: "test".into(),
        passed: false,
        output: Some("thread 'main' panicked at src/index.rs:4".into()),
        skipped: false,
        exit_code: Some(101),
    }]
}

#[test]
fn exhausted_milestone_skips_its_dependents() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::succeeding();
    let checks = StaticChecks::sequence(vec![failing_check()]);
    // yes to "continue with the next milestone?"
    let observer = RecordingObserver::answering(vec![true]);
    let ctx = RunContext::new(tmp.path(), &agent, &checks, &observer).with_options(offline_options());
    let mut session = chain_session(FsdConfig {
        max_iterations_per_milestone: 2,
        ..FsdConfig::default()
    });

    let summary = run_plan(&ctx, &mut session);

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.needs_replan, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed_attempts, 2);
    assert!(summary.state_saved);
    assert_eq!(session.milestones[0].status, MilestoneStatus::Failed);
    assert_eq!(session.milestones[1].status, MilestoneStatus::Skipped);
    assert!(
        observer
            .events()
            .contains(&"milestone_skipped:api:dependencies not met".to_string())
    );
    // one attempt prompt plus one fix prompt per iteration
    assert_eq!(agent.call_count(), 4);
    assert_eq!(session.state.learnings.len(), 1);
    assert!(state::is_resumable(tmp.path()));
}

#[test]
fn full_run_removes_saved_state() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::succeeding();
    let checks = StaticChecks::passing();
    let observer = RecordingObserver::default();
    let ctx = RunContext::new(tmp.path(), &agent, &checks, &observer).with_options(offline_options());
    let mut session = chain_session(FsdConfig::default());

    let summary = run_plan(&ctx, &mut session);

    assert!(summary.all_completed());
    assert_eq!(summary.prompt_count, 2);
    assert!(state::load(tmp.path()).is_none());
    assert!(!state::is_resumable(tmp.path()));
    assert_eq!(observer.summary().map(|s| s.completed), Some(2));
}

#[test]
fn stopped_session_resumes_where_it_left_off() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let agent = ScriptedAgent::succeeding();
        let checks = StaticChecks::sequence(vec![failing_check()]);
        // no answers queued: "continue?" falls back to its default of no
        let observer = RecordingObserver::default();
        let ctx =
            RunContext::new(tmp.path(), &agent, &checks, &observer).with_options(offline_options());
        let mut session = chain_session(FsdConfig {
            max_iterations_per_milestone: 1,
            ..FsdConfig::default()
        });
        let summary = run_plan(&ctx, &mut session);
        assert!(summary.state_saved);
        assert_eq!(summary.pending, 1);
    }

    let saved = state::load(tmp.path()).expect("state saved after stop");
    assert!(saved.has_incomplete());
    let prompts_before = saved.state.prompt_count;
    let mut session = Session::from_saved(saved);

    let agent = ScriptedAgent::succeeding();
    let checks = StaticChecks::passing();
    let observer = RecordingObserver::default();
    let ctx = RunContext::new(tmp.path(), &agent, &checks, &observer).with_options(offline_options());
    let summary = run_plan(&ctx, &mut session);

    assert!(summary.all_completed());
    assert_eq!(summary.prompt_count, prompts_before + 2);
    assert!(!summary.learnings.is_empty(), "learnings survive the restart");
    assert!(state::load(tmp.path()).is_none());
}

#[test]
fn execution_log_records_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::succeeding();
    let checks = StaticChecks::passing();
    let observer = RecordingObserver::default();
    let mut session = chain_session(FsdConfig::default());
    let log = ExecutionLog::for_session(tmp.path(), session.state.started_at).unwrap();
    let ctx = RunContext::new(tmp.path(), &agent, &checks, &observer)
        .with_log(&log)
        .with_options(offline_options());

    run_plan(&ctx, &mut session);

    let contents = fs::read_to_string(log.path()).unwrap();
    let events: Vec<String> = contents
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["event"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(events.first().map(String::as_str), Some("session_started"));
    assert_eq!(events.last().map(String::as_str), Some("session_ended"));
    assert_eq!(events.iter().filter(|e| *e == "agent_invoked").count(), 2);
}

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

fn pre_push_hook(repo: &Path) -> PathBuf {
    let hooks = git(repo, &["rev-parse", "--git-path", "hooks"]);
    repo.join(hooks).join("pre-push")
}

#[test]
fn isolated_run_commits_on_session_branch_and_restores_hooks() {
    let Some(tmp) = init_repo() else {
        return;
    };
    let original_branch = git(tmp.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    let hook = pre_push_hook(tmp.path());
    fs::create_dir_all(hook.parent().unwrap()).unwrap();
    let team_hook = "#!/bin/sh\n# team hook\nexit 0\n";
    fs::write(&hook, team_hook).unwrap();

    let agent = ScriptedAgent::succeeding().with_hook(|request, index| {
        let name = format!("feature-{index}.txt");
        fs::write(request.cwd.join(&name), "work\n").unwrap();
        git(&request.cwd, &["add", name.as_str()]);
        git(&request.cwd, &["commit", "-q", "-m", name.as_str()]);
    });
    let checks = StaticChecks::passing();
    let observer = RecordingObserver::default();
    let options = ExecutorOptions {
        qa_enabled: false,
        ..ExecutorOptions::default()
    };
    let ctx = RunContext::new(tmp.path(), &agent, &checks, &observer).with_options(options);
    let mut session = chain_session(FsdConfig::default());

    let summary = run_plan(&ctx, &mut session);

    assert!(summary.all_completed());
    let diff = summary.git_diff.expect("diff summary for isolated run");
    assert_eq!(diff.original_branch, original_branch);
    assert!(diff.session_branch.starts_with("fsd/"));
    assert_eq!(diff.commits, 2);
    assert_eq!(diff.files_changed, 2);

    let branch = git(tmp.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_eq!(branch, diff.session_branch, "session stays on its branch for review");
    assert_eq!(fs::read_to_string(&hook).unwrap(), team_hook);
    assert!(
        agent
            .requests()
            .iter()
            .all(|r| r.prompt.contains(&diff.session_branch)),
        "every prompt carries the isolation rules"
    );
    assert!(observer.events().contains(&"git_complete:2".to_string()));
}
