//! Cortex configuration.
//!
//! Loaded from `~/.cortex/config.toml` when present, otherwise defaults.
//! Every section is optional in the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration for a Brain instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Directory for consolidation exports
    pub archive_dir: PathBuf,

    pub cache: CacheConfig,
    pub patterns: PatternConfig,
    pub sandbox: SandboxConfig,
    pub consolidation: ConsolidationConfig,
}

/// Hot cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries before LRU eviction (default: 1024)
    pub max_entries: usize,
}

/// Pattern detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Occurrences needed before a sequence is promoted (default: 3)
    pub min_occurrences: usize,

    /// Longest subsequence tracked (default: 5)
    pub max_length: usize,

    /// Number of recent observations analyzed (default: 100)
    pub window_size: usize,
}

/// Sandbox execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline when the caller does not pass one (default: 60s)
    pub default_timeout_ms: u64,

    /// Run steps through `sh -c` instead of a split argv (default: false)
    pub use_shell: bool,

    /// Cap on stored logs per experiment (default: 32 KiB)
    pub max_log_bytes: usize,

    /// Working directory for sandboxed steps (default: current directory)
    pub working_dir: Option<PathBuf>,
}

/// Consolidation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Minimum age of an ended session before it is summarized (default: 7)
    pub older_than_days: u32,

    /// Idle time before warm records are demoted to cold (default: 30)
    pub demote_after_days: u32,

    /// Age at which a pending/running experiment is considered stale (default: 1 hour)
    pub stale_experiment_secs: u64,

    /// Background loop interval (default: 1 hour)
    pub interval_secs: u64,

    /// VACUUM after runs that deleted rows (default: true)
    pub compact: bool,
}

impl Default for CortexConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("brain.db"),
            archive_dir: data_dir.join("archive"),
            cache: CacheConfig::default(),
            patterns: PatternConfig::default(),
            sandbox: SandboxConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1024 }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 3,
            max_length: 5,
            window_size: 100,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            use_shell: false,
            max_log_bytes: 32 * 1024,
            working_dir: None,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            older_than_days: 7,
            demote_after_days: 30,
            stale_experiment_secs: 3600, // 1 hour
            interval_secs: 3600,
            compact: true,
        }
    }
}

/// `~/.cortex`, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cortex")
}

impl CortexConfig {
    /// Config rooted at the given database path.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CortexConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = dir.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_patterns(mut self, patterns: PatternConfig) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_consolidation(mut self, consolidation: ConsolidationConfig) -> Self {
        self.consolidation = consolidation;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be greater than 0"));
        }
        if self.patterns.min_occurrences < 2 {
            return Err(invalid("patterns.min_occurrences", "must be at least 2"));
        }
        if self.patterns.max_length < 2 {
            return Err(invalid("patterns.max_length", "must be at least 2"));
        }
        if self.patterns.window_size < self.patterns.max_length {
            return Err(invalid(
                "patterns.window_size",
                "must be at least patterns.max_length",
            ));
        }
        if self.sandbox.default_timeout_ms == 0 {
            return Err(invalid("sandbox.default_timeout_ms", "must be greater than 0"));
        }
        if self.consolidation.interval_secs == 0 {
            return Err(invalid("consolidation.interval_secs", "must be greater than 0"));
        }
        if self.consolidation.stale_experiment_secs == 0 {
            return Err(invalid(
                "consolidation.stale_experiment_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::Config(format!("{field} {message}"))
}
