//! Command-line interface definition

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "weave",
    about = "Durable orchestration of declarative multi-agent workflows",
    version
)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Session root directory (defaults to WEAVE_DIR or ~/.weave)
    #[arg(long, global = true, env = "WEAVE_SESSIONS_ROOT")]
    pub sessions_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow specification
    Run(RunArgs),

    /// Resume a paused or crashed session
    Resume(ResumeArgs),

    /// Inspect and manage persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Path to the workflow spec (YAML or JSON)
    pub spec: PathBuf,

    /// Input variables as key=value (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Do not persist session checkpoints (pauses are still saved)
    #[arg(long)]
    pub no_session: bool,

    /// Never prompt; return the pause checkpoint on HITL gates
    #[arg(long)]
    pub non_interactive: bool,

    /// Write the final response to a file
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct ResumeArgs {
    /// Session id to resume
    pub session_id: uuid::Uuid,

    /// Response for the pending HITL gate
    #[arg(long)]
    pub hitl_response: Option<String>,

    /// Current spec on disk, to warn when it drifted from the snapshot
    #[arg(long, value_name = "PATH")]
    pub spec: Option<PathBuf>,

    /// Never prompt; return the pause checkpoint on HITL gates
    #[arg(long)]
    pub non_interactive: bool,

    /// Write the final response to a file
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List sessions, newest first
    List {
        /// Filter by status (running, paused, completed, failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one session's metadata and state
    Show { session_id: uuid::Uuid },
    /// Delete a session directory
    Delete { session_id: uuid::Uuid },
    /// Remove sessions older than the given age
    Cleanup {
        /// Age threshold in days
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,
        /// Preserve completed sessions
        #[arg(long)]
        keep_completed: bool,
    },
}
