//! CLI argument definitions using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Cortex - local knowledge agent
///
/// Records activity, learns recurring workflows and keeps facts and skills
/// with confidence scores that evolve through reinforcement.
#[derive(Parser, Debug)]
#[command(name = "cortex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: ~/.cortex/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record commands (or other events) in a new session
    Observe(ObserveArgs),

    /// Show recent observations
    Episodes {
        /// Restrict to one session
        #[arg(short, long)]
        session: Option<String>,

        /// Maximum number of records
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Semantic facts (learn, recall, corroborate)
    Fact(FactCommand),

    /// Skills (learn, show, list, reinforce, archive, validate)
    Skill(SkillCommand),

    /// Run a plan in the sandbox under a deadline
    Sandbox {
        /// Steps, run in order until the first failure
        #[arg(required = true)]
        steps: Vec<String>,

        /// Deadline in milliseconds (default from config)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Re-run the command of an observed record in the sandbox
    Replay {
        /// Episodic record ID
        id: i64,

        /// Deadline in milliseconds (default from config)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Run one consolidation pass
    Consolidate {
        /// Only sessions that ended at least this many days ago
        #[arg(long)]
        older_than_days: Option<u32>,

        /// Export archived records to the archive directory and purge them
        #[arg(long)]
        purge: bool,

        /// Directory for --purge exports (default: archive_dir from config)
        #[arg(long, requires = "purge")]
        export: Option<PathBuf>,

        /// Show recent consolidation log entries instead of running
        #[arg(long)]
        history: bool,
    },

    /// Show memory statistics
    Stats {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show how observed commands fare: reliable, problematic, most used
    Insights {
        /// Per-run figures for one command
        #[arg(long)]
        command: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Export confident knowledge to a JSON file
    Export {
        /// Output file
        path: PathBuf,
    },

    /// Show version
    Version,
}

#[derive(Args, Debug)]
pub struct ObserveArgs {
    /// Commands to record, in order
    pub commands: Vec<String>,

    /// Read one command per line from stdin
    #[arg(long)]
    pub stdin: bool,

    /// Event type
    #[arg(short = 't', long, default_value = "command")]
    pub event_type: String,

    /// Result of the event ("success" or "failure" feed command insights)
    #[arg(short, long)]
    pub result: Option<String>,

    /// Duration in milliseconds
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Free-form context (e.g. working directory)
    #[arg(short, long)]
    pub context: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Fact Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct FactCommand {
    #[command(subcommand)]
    pub action: FactAction,
}

#[derive(Subcommand, Debug)]
pub enum FactAction {
    /// Store a new fact
    Learn {
        /// Topic the fact belongs to
        topic: String,

        /// Fact text
        text: String,

        /// Initial confidence (0.0-1.0)
        #[arg(long, default_value = "0.5")]
        confidence: f64,

        /// Where the fact came from
        #[arg(short, long)]
        source: Option<String>,

        /// Kind of source (documentation, web, observation, ...)
        #[arg(long, default_value = "manual")]
        source_type: String,

        /// Reliability of the source (0.0-1.0)
        #[arg(long, default_value = "0.5")]
        reliability: f64,
    },

    /// Show the best facts for a topic
    Recall {
        /// Topic to look up
        topic: String,

        /// Number of facts
        #[arg(short = 'k', long, default_value = "1")]
        limit: usize,
    },

    /// Report another source agreeing or disagreeing with a fact
    Corroborate {
        /// Fact ID
        id: i64,

        /// Reporting source
        #[arg(short, long)]
        source: String,

        /// The source contradicts the fact
        #[arg(long)]
        disagree: bool,

        /// Reliability of the reporting source (0.0-1.0)
        #[arg(long, default_value = "0.5")]
        reliability: f64,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Skill Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct SkillCommand {
    #[command(subcommand)]
    pub action: SkillAction,
}

#[derive(Subcommand, Debug)]
pub enum SkillAction {
    /// Teach a skill explicitly
    Learn {
        /// Unique skill name
        name: String,

        /// Steps, in order
        #[arg(short, long = "step", required = true)]
        steps: Vec<String>,

        /// What the skill does
        #[arg(short, long)]
        description: Option<String>,

        /// Prerequisites
        #[arg(short, long = "prerequisite")]
        prerequisites: Vec<String>,

        /// Initial confidence (0.0-1.0)
        #[arg(long, default_value = "0.5")]
        confidence: f64,
    },

    /// Show one skill
    Show {
        /// Skill name
        name: String,
    },

    /// List active skills
    List {
        /// Minimum confidence
        #[arg(short, long)]
        min_confidence: Option<f64>,
    },

    /// Record an outcome for a skill
    Reinforce {
        /// Skill name
        name: String,

        /// The skill failed
        #[arg(long)]
        failure: bool,

        /// Duration in milliseconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Archive a skill (kept, but no longer listed)
    Archive {
        /// Skill name
        name: String,
    },

    /// Run a skill's steps in the sandbox and reinforce it with the verdict
    Validate {
        /// Skill name
        name: String,

        /// Deadline in milliseconds (default from config)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}
