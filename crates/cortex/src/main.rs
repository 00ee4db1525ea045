//! cortex - local knowledge agent CLI
//!
//! Thin front end over cortex-core: every subcommand opens the brain,
//! performs one operation and closes it again.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("cortex=info".parse()?))
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("cortex {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = commands::load_config(cli.config.as_deref(), cli.db.as_deref())?;

    match cli.command {
        Commands::Observe(args) => commands::observe::execute(args, config),
        Commands::Episodes { session, limit } => {
            commands::observe::episodes(session.as_deref(), limit, config)
        }
        Commands::Fact(cmd) => commands::fact::execute(cmd, config),
        Commands::Skill(cmd) => commands::skill::execute(cmd, config).await,
        Commands::Sandbox { steps, timeout } => commands::sandbox::execute(steps, timeout, config).await,
        Commands::Replay { id, timeout } => commands::sandbox::replay(id, timeout, config).await,
        Commands::Consolidate {
            older_than_days,
            purge,
            export,
            history,
        } => commands::maintain::consolidate(older_than_days, purge, export, history, config),
        Commands::Stats { json } => commands::maintain::stats(json, config),
        Commands::Insights { command, json } => {
            commands::maintain::insights(command.as_deref(), json, config)
        }
        Commands::Export { path } => commands::maintain::export(&path, config),
        Commands::Version => Ok(()),
    }
}
