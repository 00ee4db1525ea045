//! Sandbox command.

use anyhow::{Context, Result};
use colored::Colorize;
use cortex_core::{CortexConfig, ExperimentStatus, SandboxExperiment, SandboxPlan};

use super::open_brain;

/// Execute sandbox command.
pub async fn execute(steps: Vec<String>, timeout: Option<u64>, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;
    let experiment = brain
        .sandbox_run(&SandboxPlan::new(steps), timeout)
        .await
        .context("Sandbox run failed")?;
    print_experiment(&experiment);
    print_logs(&experiment);
    brain.close()?;
    Ok(())
}

/// Re-run an observed command.
pub async fn replay(id: i64, timeout: Option<u64>, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;
    let experiment = brain
        .replay_episode(id, timeout)
        .await
        .with_context(|| format!("Failed to replay record {}", id))?;
    print_experiment(&experiment);
    print_logs(&experiment);
    brain.close()?;
    Ok(())
}

fn print_logs(experiment: &SandboxExperiment) {
    if let Some(logs) = experiment.logs.as_deref().filter(|l| !l.is_empty()) {
        println!("{}", "─".repeat(60));
        print!("{}", logs);
    }
}

pub fn print_experiment(experiment: &SandboxExperiment) {
    let status = match experiment.status {
        ExperimentStatus::Passed => experiment.status.as_str().green(),
        ExperimentStatus::Failed | ExperimentStatus::Error => experiment.status.as_str().red(),
        _ => experiment.status.as_str().yellow(),
    };
    println!(
        "{} Experiment {}: {} in {}ms",
        "▶".cyan(),
        experiment.id,
        status.bold(),
        experiment.duration_ms.unwrap_or(0)
    );
    if let Some(summary) = &experiment.exit_summary {
        println!("  {}", summary);
    }
}
