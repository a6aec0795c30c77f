use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fsd",
    about = "Drive a coding agent through a milestone plan with budget, safety and git isolation",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Answer yes to every confirmation question
    #[arg(short = 'y', long, global = true, conflicts_with = "headless")]
    pub yes: bool,

    /// Never prompt; take each question's default answer
    #[arg(long, global = true)]
    pub headless: bool,

    /// Hide the agent's streamed output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a session from a JSON or YAML milestone plan
    Run {
        /// Plan file with `goal` and `milestones`
        plan: PathBuf,

        /// Override the spend ceiling in USD
        #[arg(long)]
        max_cost: Option<f64>,

        /// Override the total prompt ceiling
        #[arg(long)]
        max_prompts: Option<u32>,

        /// Skip the QA pass after each milestone
        #[arg(long)]
        no_qa: bool,

        /// Run on the current branch without a push block
        #[arg(long)]
        no_git: bool,

        /// Discard any saved session instead of offering to resume it
        #[arg(long)]
        fresh: bool,
    },

    /// Resume the saved session in this project
    Resume,

    /// Show the saved session, if any
    Status {
        /// Emit JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Delete the saved session
    Clear,

    /// Show project configuration
    Config {
        /// Emit JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
