//! Skill commands.

use anyhow::{Context, Result};
use colored::Colorize;
use cortex_core::{CortexConfig, NewSkill, SkillMemory};

use super::{confidence_display, open_brain};
use crate::cli::{SkillAction, SkillCommand};
use crate::commands::sandbox::print_experiment;

/// Execute skill command.
pub async fn execute(cmd: SkillCommand, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;

    match cmd.action {
        SkillAction::Learn {
            name,
            steps,
            description,
            prerequisites,
            confidence,
        } => {
            let mut skill = NewSkill::new(name.clone(), steps)
                .with_prerequisites(prerequisites)
                .with_confidence(confidence);
            if let Some(description) = description {
                skill = skill.with_description(description);
            }
            let id = brain.learn_skill(skill).context("Failed to store skill")?;
            println!("{} Learned skill {} ({})", "✓".green(), name.cyan(), id);
        }

        SkillAction::Show { name } => match brain.recall_skill(&name)? {
            Some(skill) => print_skill(&skill, true),
            None => println!("{}", format!("No skill named '{}'", name).yellow()),
        },

        SkillAction::List { min_confidence } => {
            let skills = brain.list_skills(min_confidence)?;
            if skills.is_empty() {
                println!("{}", "No skills learned yet".yellow());
            } else {
                println!("{}", "Skills".cyan().bold());
                println!("{}", "─".repeat(60));
                for skill in &skills {
                    print_skill(skill, false);
                }
            }
        }

        SkillAction::Reinforce {
            name,
            failure,
            duration,
        } => {
            let skill = brain
                .reinforce_skill(&name, !failure, duration)
                .with_context(|| format!("Failed to reinforce {}", name))?;
            let outcome = if failure { "failure".red() } else { "success".green() };
            println!(
                "{} Recorded {} for {}: confidence {}",
                "✓".green(),
                outcome,
                name.cyan(),
                confidence_display(skill.confidence)
            );
        }

        SkillAction::Archive { name } => {
            brain.archive_skill(&name)?;
            println!("{} Archived {}", "✓".green(), name.cyan());
        }

        SkillAction::Validate { name, timeout } => {
            let experiment = brain
                .validate_skill(&name, timeout)
                .await
                .with_context(|| format!("Failed to validate {}", name))?;
            print_experiment(&experiment);
            if let Some(skill) = brain.recall_skill(&name)? {
                println!("  Confidence now {}", confidence_display(skill.confidence));
            }
        }
    }

    brain.close()?;
    Ok(())
}

fn print_skill(skill: &SkillMemory, detailed: bool) {
    println!(
        "  {} {} ({} ok / {} failed)",
        skill.skill_name.cyan(),
        confidence_display(skill.confidence),
        skill.success_count,
        skill.failure_count
    );
    if !detailed {
        return;
    }
    if let Some(description) = &skill.description {
        println!("    {}", description.dimmed());
    }
    for (i, step) in skill.steps.iter().enumerate() {
        println!("    {}. {}", i + 1, step);
    }
    if !skill.prerequisites.is_empty() {
        println!("    Requires: {}", skill.prerequisites.join(", "));
    }
    if let Some(avg) = skill.avg_duration_ms {
        println!("    Avg duration: {}ms", avg);
    }
    if let Some(used) = skill.last_used_at {
        println!("    Last used: {}", used.format("%Y-%m-%d %H:%M"));
    }
}
