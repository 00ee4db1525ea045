//! Fact commands.

use anyhow::{Context, Result};
use colored::Colorize;
use cortex_core::{CortexConfig, NewFact, SemanticFact};

use super::{confidence_display, open_brain};
use crate::cli::{FactAction, FactCommand};

/// Execute fact command.
pub fn execute(cmd: FactCommand, config: CortexConfig) -> Result<()> {
    let brain = open_brain(config)?;

    match cmd.action {
        FactAction::Learn {
            topic,
            text,
            confidence,
            source,
            source_type,
            reliability,
        } => {
            let mut fact = NewFact::new(topic, text)
                .with_confidence(confidence)
                .with_reliability(reliability);
            if let Some(source) = source {
                fact = fact.with_source(source, source_type);
            }
            let id = brain.learn_fact(fact).context("Failed to store fact")?;
            println!("{} Learned fact {}", "✓".green(), id);
        }

        FactAction::Recall { topic, limit } => {
            let facts = if limit <= 1 {
                brain.recall_fact(&topic)?.into_iter().collect()
            } else {
                brain.recall_facts(&topic, limit)?
            };
            if facts.is_empty() {
                println!("{}", format!("Nothing known about '{}'", topic).yellow());
            }
            for fact in &facts {
                print_fact(fact);
            }
        }

        FactAction::Corroborate {
            id,
            source,
            disagree,
            reliability,
        } => {
            let fact = brain
                .corroborate_fact(id, &source, !disagree, reliability)
                .with_context(|| format!("Failed to update fact {}", id))?;
            let verb = if disagree { "Contradicted" } else { "Corroborated" };
            println!("{} {} fact {}", "✓".green(), verb, id);
            print_fact(&fact);
        }
    }

    brain.close()?;
    Ok(())
}

fn print_fact(fact: &SemanticFact) {
    println!(
        "  {} {} {}",
        format!("#{}", fact.id).dimmed(),
        confidence_display(fact.confidence),
        fact.fact_text
    );
    println!(
        "      {} reliability {:.2}, +{} / -{}, source: {}",
        fact.topic.cyan(),
        fact.reliability,
        fact.corroborations,
        fact.contradictions,
        fact.source.as_deref().unwrap_or("-")
    );
}
