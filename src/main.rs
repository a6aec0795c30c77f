mod cli;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use fsd::agent::claude::ClaudeCodeRunner;
use fsd::checks::ShellCheckRunner;
use fsd::config::ProjectConfig;
use fsd::executor::{PlanSummary, RunContext, run_plan};
use fsd::log::ExecutionLog;
use fsd::observer::{ConfirmMode, ConsoleObserver, Observer};
use fsd::pause::PauseController;
use fsd::plan::Plan;
use fsd::session::{MilestoneStatus, Session};
use fsd::{paths, state};

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<32} {value}\n"));
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string())
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Limits\n");
    push_kv(&mut output, "max_cost", format!("${:.2}", config.limits.max_cost));
    push_kv(
        &mut output,
        "max_iterations_per_milestone",
        config.limits.max_iterations_per_milestone,
    );
    push_kv(&mut output, "max_total_prompts", config.limits.max_total_prompts);
    push_kv(&mut output, "checkpoint_interval", config.limits.checkpoint_interval);
    push_kv(
        &mut output,
        "require_approval_for_sensitive",
        config.limits.require_approval_for_sensitive,
    );
    push_kv(&mut output, "auto_resume", config.limits.auto_resume);
    output.push('\n');

    output.push_str("Agent\n");
    push_kv(&mut output, "program", &config.agent.program);
    if config.agent.extra_args.is_empty() {
        push_kv(&mut output, "extra_args", "(none)");
    } else {
        push_kv(&mut output, "extra_args", config.agent.extra_args.join(" "));
    }
    push_kv(&mut output, "timeout", format!("{}s", config.agent.timeout_secs));
    push_kv(&mut output, "qa_timeout", format!("{}s", config.agent.qa_timeout_secs));
    if config.agent.allowed_tools.is_empty() {
        push_kv(&mut output, "allowed_tools", "(agent default)");
    } else {
        push_kv(&mut output, "allowed_tools", config.agent.allowed_tools.join(", "));
    }
    match config.agent.max_budget_per_prompt {
        Some(b) => push_kv(&mut output, "max_budget_per_prompt", format!("${b:.2}")),
        None => push_kv(&mut output, "max_budget_per_prompt", "(none)"),
    }
    output.push('\n');

    output.push_str("QA\n");
    push_kv(&mut output, "enabled", config.qa.enabled);
    push_kv(&mut output, "auto_fix", config.qa.auto_fix);
    output.push('\n');

    output.push_str("Checks\n");
    if config.checks.commands.is_empty() {
        push_kv(&mut output, "commands", "(auto-detect)");
    } else {
        for c in &config.checks.commands {
            push_kv(&mut output, &c.name, &c.command);
        }
    }
    push_kv(&mut output, "timeout", format!("{}s", config.checks.timeout_secs));
    output.push('\n');

    output.push_str("Git\n");
    push_kv(&mut output, "isolation", config.git.isolation);
    output.push('\n');

    output.push_str(&format!("Source: {}\n", config_source_label(config_path)));
    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_status(project_root: &Path, json: bool) -> Result<()> {
    let Some(saved) = state::load(project_root) else {
        if json {
            println!("null");
        } else {
            println!("No saved session.");
        }
        return Ok(());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&saved).context("failed to serialize session")?
        );
        return Ok(());
    }

    let age = saved.age();
    println!("Goal: {}", saved.goal);
    println!(
        "Saved: {} ({}h {}m ago){}",
        saved.saved_at.to_rfc3339(),
        age.num_hours(),
        age.num_minutes() % 60,
        if state::is_resumable(project_root) {
            ", resumable"
        } else {
            ""
        }
    );
    println!(
        "Spend: ${:.2} over {} prompt(s), {} failed attempt(s)",
        saved.state.total_cost, saved.state.prompt_count, saved.state.failed_attempts
    );
    if let Some(branch) = saved.git_state.as_ref().and_then(|g| g.session_branch.as_deref()) {
        println!("Branch: {branch}");
    }
    println!("Milestones:");
    for m in &saved.milestones {
        let mark = match m.status {
            MilestoneStatus::Completed => "✓",
            MilestoneStatus::Failed => "✗",
            MilestoneStatus::Skipped => "○",
            MilestoneStatus::InProgress => "→",
            MilestoneStatus::Pending => " ",
        };
        println!("  [{mark}] {} {} ({})", m.id, m.title, m.status);
    }
    if !saved.state.learnings.is_empty() {
        println!("Learnings:");
        for l in &saved.state.learnings {
            println!("  - {l}");
        }
    }
    Ok(())
}

/// Map the `.claude/fsd-pause` marker onto the pause gate until `done`.
fn spawn_pause_watcher(
    project_root: PathBuf,
    pause: PauseController,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let marker = paths::pause_marker(&project_root);
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            let present = marker.exists();
            if present && !pause.is_paused() {
                info!(marker = %marker.display(), "pause marker found");
                pause.pause();
            } else if !present && pause.is_paused() {
                info!("pause marker removed");
                pause.resume();
            }
            thread::sleep(PAUSE_POLL_INTERVAL);
        }
    })
}

fn execute(
    project_root: &Path,
    config: &ProjectConfig,
    mut session: Session,
    observer: &dyn Observer,
    qa: bool,
    git: bool,
) -> Result<PlanSummary> {
    let log = ExecutionLog::for_session(project_root, session.state.started_at)?;
    info!(log = %log.path().display(), "execution log");

    let abort = Arc::new(AtomicBool::new(false));
    let pause = PauseController::new();
    let handler_flag = Arc::clone(&abort);
    let handler_pause = pause.clone();
    ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            eprintln!("\n[fsd] forced exit");
            std::process::exit(130);
        }
        eprintln!("\n[fsd] stopping after the current step (Ctrl-C again to force)");
        // a paused run must wake up to observe the abort
        handler_pause.reset();
    })
    .context("failed to install Ctrl-C handler")?;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = spawn_pause_watcher(project_root.to_path_buf(), pause.clone(), Arc::clone(&done));

    let agent = ClaudeCodeRunner::new(Some(config.agent.program.clone()))
        .with_extra_args(config.agent.extra_args.clone());
    let checks = ShellCheckRunner::new(config.check_timeout())
        .with_commands(config.checks.commands.clone())
        .with_abort(Arc::clone(&abort));

    let mut options = config.executor_options();
    options.qa_enabled &= qa;
    options.git_isolation &= git;

    let ctx = RunContext::new(project_root, &agent, &checks, observer)
        .with_pause(pause.clone())
        .with_abort(Arc::clone(&abort))
        .with_log(&log)
        .with_options(options);
    let summary = run_plan(&ctx, &mut session);

    done.store(true, Ordering::SeqCst);
    if watcher.join().is_err() {
        warn!("pause watcher panicked");
    }
    Ok(summary)
}

fn resume_saved(
    project_root: &Path,
    config: &ProjectConfig,
    observer: &dyn Observer,
) -> Result<PlanSummary> {
    let Some(saved) = state::load(project_root) else {
        bail!("no saved session to resume (see `fsd status`)");
    };
    if !saved.has_incomplete() {
        bail!("saved session has no incomplete milestones; run `fsd clear`");
    }
    info!(goal = %saved.goal, saved_at = %saved.saved_at, "resuming session");
    let session = Session::from_saved(saved);
    execute(project_root, config, session, observer, true, true)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "fsd=warn",
        0 => "fsd=info",
        1 => "fsd=debug",
        _ => "fsd=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .claude/fsd.toml found, using defaults"),
        }
    }

    let mode = if cli.yes {
        ConfirmMode::AssumeYes
    } else if cli.headless {
        ConfirmMode::Defaults
    } else {
        ConfirmMode::Ask
    };
    let mut observer = ConsoleObserver::new(mode);
    if cli.quiet {
        observer = observer.quiet_agent();
    }

    let summary = match cli.command {
        Command::Run {
            plan,
            max_cost,
            max_prompts,
            no_qa,
            no_git,
            fresh,
        } => {
            if fresh {
                state::clear(&cwd)?;
            } else if state::is_resumable(&cwd) {
                let goal = state::load(&cwd).map(|s| s.goal).unwrap_or_default();
                let resume = config.limits.auto_resume
                    || observer.confirm(
                        &format!("An unfinished session exists (\"{goal}\"). Resume it instead?"),
                        true,
                    );
                if resume {
                    let summary = resume_saved(&cwd, &config, &observer)?;
                    return finish(summary);
                }
                state::clear(&cwd)?;
            }

            observer.planning_start();
            let plan = Plan::load(&plan)?;
            observer.planning_complete(&plan.milestones);

            let mut fsd_config = config.to_fsd_config();
            if let Some(c) = max_cost {
                fsd_config.max_cost = c;
            }
            if let Some(p) = max_prompts {
                fsd_config.max_total_prompts = p;
            }
            let session = plan.into_session(fsd_config);
            execute(&cwd, &config, session, &observer, !no_qa, !no_git)?
        }
        Command::Resume => resume_saved(&cwd, &config, &observer)?,
        Command::Status { json } => return render_status(&cwd, json),
        Command::Clear => {
            state::clear(&cwd)?;
            println!("Cleared saved session.");
            return Ok(());
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            return Ok(());
        }
    };

    finish(summary)
}

fn finish(summary: PlanSummary) -> Result<()> {
    if summary.aborted {
        std::process::exit(130);
    }
    if !summary.all_completed() {
        std::process::exit(1);
    }
    Ok(())
}
