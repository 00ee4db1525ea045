//! Observation commands.
//!
//! One invocation is one session: the commands given are recorded in
//! order, so a workflow repeated within them is detected and promoted.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use cortex_core::{CortexConfig, NewEpisode};
use std::io::BufRead;

use super::open_brain;
use crate::cli::ObserveArgs;

/// Execute observe command.
pub fn execute(args: ObserveArgs, config: CortexConfig) -> Result<()> {
    let mut commands = args.commands;
    if args.stdin {
        for line in std::io::stdin().lock().lines() {
            let line = line.context("Failed to read stdin")?;
            if !line.trim().is_empty() {
                commands.push(line);
            }
        }
    }
    if commands.is_empty() {
        bail!("Nothing to observe: pass commands or --stdin");
    }

    let brain = open_brain(config)?;
    let skills_before = brain.list_skills(None)?.len();
    let session_id = brain.start_session(args.context.as_deref())?;

    for command in &commands {
        let episode = NewEpisode {
            event_type: args.event_type.clone(),
            command: Some(command.clone()),
            result: args.result.clone(),
            duration_ms: args.duration,
            context: args.context.clone(),
        };
        brain
            .observe(episode, Some(&session_id))
            .with_context(|| format!("Failed to record: {}", command))?;
    }
    brain.end_session(None)?;

    println!(
        "{} Recorded {} event(s) in session {}",
        "✓".green(),
        commands.len(),
        session_id.dimmed()
    );

    let skills = brain.list_skills(None)?;
    if skills.len() > skills_before {
        println!("{} {} new workflow skill(s) detected", "★".yellow(), skills.len() - skills_before);
    }
    brain.close()?;
    Ok(())
}

/// Show recent observations.
pub fn episodes(session: Option<&str>, limit: usize, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;
    let records = brain.recent_episodes(session, limit)?;

    if records.is_empty() {
        println!("{}", "No observations recorded".yellow());
        return Ok(());
    }

    println!("{}", "Recent Observations".cyan().bold());
    println!("{}", "─".repeat(60));
    for record in records {
        println!(
            "  {} {} {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            format!("[{}]", record.event_type).cyan(),
            record.command.as_deref().unwrap_or("-")
        );
        if let Some(result) = &record.result {
            println!("      → {}", result.dimmed());
        }
    }
    Ok(())
}
