mod cli;
mod commands;
mod output;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use weave_engine::Engine;
use weave_models::error::{EngineError, Result};
use weave_storage::SessionStore;

use cli::{Cli, Commands};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{} {error}", "error:".red().bold());
            error.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let store = match &cli.sessions_root {
        Some(root) => SessionStore::new(root.clone()),
        None => SessionStore::open_default().map_err(EngineError::from)?,
    };
    let engine = Engine::new(store);

    match cli.command {
        Commands::Run(args) => commands::run::run(&engine, args).await,
        Commands::Resume(args) => commands::resume::run(&engine, args).await,
        Commands::Sessions { command } => commands::sessions::run(&engine, command).await,
    }
}
