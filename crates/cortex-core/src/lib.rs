//! cortex-core - Core library for Cortex
//!
//! A local knowledge agent that records activity, learns workflows from it
//! and keeps what it learns with confidence scores that evolve through
//! reinforcement:
//!
//! - **db**: SQLite persistent store, the source of truth
//! - **cache**: LRU hot cache in front of the store
//! - **pattern**: recurring command sequence detection
//! - **reinforcement**: Laplace-smoothed confidence updates
//! - **sandbox**: deadline-bounded plan execution
//! - **consolidation**: phased summarize/archive/dedup/demote runs
//! - **brain**: the coordinator façade composing all of the above

pub mod brain;
pub mod cache;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod error;
pub mod pattern;
pub mod reinforcement;
pub mod sandbox;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use brain::{Brain, ConsolidationLoop, Promotion, SessionState};
pub use config::CortexConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use sandbox::SandboxPlan;
pub use types::*;
