//! Maintenance commands: consolidation, statistics and export.

use anyhow::{Context, Result};
use colored::Colorize;
use cortex_core::{CortexConfig, TierCounts};
use std::path::{Path, PathBuf};

use super::open_brain;

/// Run one consolidation pass, or show the log with `history`.
pub fn consolidate(
    older_than_days: Option<u32>,
    purge: bool,
    export: Option<PathBuf>,
    history: bool,
    config: CortexConfig,
) -> Result<()> {
    let archive_dir = config.archive_dir.clone();
    let brain = open_brain(config)?;

    if history {
        let entries = brain.consolidation_history(20)?;
        if entries.is_empty() {
            println!("{}", "No consolidation runs yet".yellow());
        }
        for entry in entries {
            let status = if entry.status == "completed" {
                entry.status.green()
            } else {
                entry.status.red()
            };
            println!(
                "  {} {:<22} {:<10} {:>6}  {}",
                entry.started_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                entry.phase,
                status,
                entry.records_processed,
                entry.error.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let export_dir = if purge { Some(export.unwrap_or(archive_dir)) } else { None };
    let report = brain
        .consolidate(older_than_days, export_dir.as_deref())
        .context("Consolidation failed")?;

    println!("{}", "Consolidation".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("  Sessions summarized:    {}", report.sessions_summarized);
    println!("  Records archived:       {}", report.records_archived);
    println!("  Records purged:         {}", report.records_purged);
    println!("  Facts merged:           {}", report.facts_merged);
    println!("  Records demoted:        {}", report.records_demoted);
    println!("  Experiments reconciled: {}", report.experiments_reconciled);
    println!("  Duration:               {}ms", report.duration_ms);

    if let Some(phase) = report.failed_phase {
        println!(
            "{} Phase {} failed: {}",
            "✗".red(),
            phase,
            report.error.as_deref().unwrap_or("unknown error")
        );
    } else if report.aborted {
        println!("{} Run aborted", "!".yellow());
    } else if report.is_empty() {
        println!("{} Nothing to consolidate", "✓".green());
    } else {
        println!("{} Consolidation complete", "✓".green());
    }
    brain.close()?;
    Ok(())
}

/// Show memory statistics.
pub fn stats(json: bool, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;
    let stats = brain.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", "Memory Statistics".cyan().bold());
    println!("{}", "─".repeat(40));
    print_tiers("Episodic records", &stats.episodic);
    print_tiers("Facts", &stats.facts);
    print_tiers("Skills", &stats.skills);
    println!("  Sessions:    {}", stats.sessions);
    let sandbox = &stats.sandbox;
    println!(
        "  Experiments: {} ({} passed, {} failed, {} timed out, {} errors, {} open)",
        sandbox.total,
        sandbox.passed.to_string().green(),
        sandbox.failed.to_string().red(),
        sandbox.timed_out.to_string().yellow(),
        sandbox.errors,
        sandbox.open
    );
    if let Some(avg) = sandbox.avg_duration_ms {
        println!("  Avg experiment duration: {:.0}ms", avg);
    }
    if !stats.events_by_type.is_empty() {
        println!();
        println!("  {}", "Events by type".bold());
        for (event_type, count) in &stats.events_by_type {
            println!("    {:<16} {}", event_type, count);
        }
    }
    println!();
    println!(
        "  Cache: {}/{} entries, hit rate {:.1}%",
        stats.cache.entries,
        stats.cache.capacity,
        stats.cache.hit_rate * 100.0
    );
    println!("  Database size: {:.1} KiB", stats.db_size_bytes as f64 / 1024.0);
    match stats.last_consolidation_at {
        Some(at) => println!("  Last consolidation: {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Last consolidation: {}", "never".dimmed()),
    }
    Ok(())
}

/// Show command insights, or the figures for one command.
pub fn insights(command: Option<&str>, json: bool, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;

    if let Some(command) = command {
        let stats = brain.command_stats(Some(command))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }
        let Some(stats) = stats.first() else {
            println!("{} '{}' was never observed", "!".yellow(), command);
            return Ok(());
        };
        println!("{}", stats.command.cyan().bold());
        println!("  Runs:       {}", stats.total);
        println!("  Successful: {}", stats.successful.to_string().green());
        println!("  Failed:     {}", stats.failed.to_string().red());
        match stats.success_rate() {
            Some(rate) => println!("  Success:    {:.1}%", rate * 100.0),
            None => println!("  Success:    {}", "no verdicts".dimmed()),
        }
        if let Some(avg) = stats.avg_duration_ms {
            println!("  Avg time:   {:.0}ms", avg);
        }
        return Ok(());
    }

    let insights = brain.insights()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&insights)?);
        return Ok(());
    }

    println!("{}", "Insights".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("  Observations:    {}", insights.total_observations);
    println!("  Unique commands: {}", insights.unique_commands);
    println!("  Learned skills:  {}", insights.learned_skills);
    if !insights.most_common_commands.is_empty() {
        println!();
        println!("  {}", "Most common".bold());
        for (command, count) in &insights.most_common_commands {
            println!("    {:>5}  {}", count, command);
        }
    }
    print_command_list("Reliable", &insights.reliable_commands, |c| c.green().to_string());
    print_command_list("Problematic", &insights.problematic_commands, |c| c.red().to_string());
    Ok(())
}

fn print_command_list(label: &str, commands: &[String], paint: impl Fn(&str) -> String) {
    if commands.is_empty() {
        return;
    }
    println!();
    println!("  {}", label.bold());
    for command in commands {
        println!("    {}", paint(command));
    }
}

fn print_tiers(label: &str, counts: &TierCounts) {
    println!(
        "  {:<17} {:>6} ({} hot, {} warm, {} cold)",
        format!("{}:", label),
        counts.total(),
        counts.hot.to_string().red(),
        counts.warm.to_string().yellow(),
        counts.cold.to_string().blue()
    );
}

/// Export confident knowledge to `path`.
pub fn export(path: &Path, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;
    let report = brain
        .export_knowledge(path)
        .with_context(|| format!("Failed to export to {}", path.display()))?;
    println!(
        "{} Exported {} fact(s), {} skill(s), {} session summary(ies) to {}",
        "✓".green(),
        report.fact_count,
        report.skill_count,
        report.session_count,
        path.display()
    );
    Ok(())
}
