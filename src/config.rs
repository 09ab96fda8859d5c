//! Ledger configuration, read from `.phase-ledger/ledger.toml`.
//!
//! ```toml
//! [manager]
//! validate_transitions = true
//! strict_monotonic = false
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 500
//! max_delay_ms = 5000
//! backoff_multiplier = 2.0
//!
//! [store]
//! busy_timeout_ms = 5000
//! ```
//!
//! Every key is optional; missing keys take the defaults shown above.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::ManagerOptions;
use crate::retry::RetryConfig;

/// Configuration file name inside the ledger directory.
pub const CONFIG_FILE: &str = "ledger.toml";

/// Default SQLite database file name inside the ledger directory.
pub const DB_FILE: &str = "ledger.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSection {
    /// Enforce the transition table. Turning this off only logs bad edges.
    #[serde(default = "default_validate_transitions")]
    pub validate_transitions: bool,
    /// Reject counter decreases instead of logging them.
    #[serde(default)]
    pub strict_monotonic: bool,
}

fn default_validate_transitions() -> bool {
    true
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            validate_transitions: default_validate_transitions(),
            strict_monotonic: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT.max_attempts
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT.initial_delay.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT.max_delay.as_millis() as u64
}

fn default_backoff_multiplier() -> f64 {
    RetryConfig::DEFAULT.backoff_multiplier
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Root of `ledger.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerToml {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub store: StoreSection,
}

impl LedgerToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ledger.toml")
    }

    /// Load `ledger.toml` from the ledger directory, or defaults if it is absent.
    pub fn load_or_default(ledger_dir: &Path) -> Result<Self> {
        let config_path = ledger_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize ledger.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check for values that parse but make no sense.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let retry = &self.retry;

        if retry.max_attempts == 0 {
            warnings.push(
                "retry.max_attempts is 0: operations will still be attempted once".to_string(),
            );
        }
        if retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier {} is below 1.0: delays will shrink between attempts",
                retry.backoff_multiplier
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            warnings.push(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                retry.initial_delay_ms, retry.max_delay_ms
            ));
        }
        if self.store.busy_timeout_ms == 0 {
            warnings.push(
                "store.busy_timeout_ms is 0: concurrent writers fail immediately instead of waiting"
                    .to_string(),
            );
        }
        if !self.manager.validate_transitions {
            warnings.push(
                "manager.validate_transitions is off: illegal transitions are only logged"
                    .to_string(),
            );
        }

        warnings
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.backoff_multiplier,
        )
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            validate_transitions: self.manager.validate_transitions,
            strict_monotonic: self.manager.strict_monotonic,
            retry: self.retry_config(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }
}

/// Effective configuration for one project: file values plus resolved paths.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub project_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub toml: LedgerToml,
    db_override: Option<PathBuf>,
}

impl LedgerConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let ledger_dir = crate::init::get_ledger_dir(&project_dir);
        let toml = LedgerToml::load_or_default(&ledger_dir)?;
        Ok(Self {
            project_dir,
            ledger_dir,
            toml,
            db_override: None,
        })
    }

    /// Use `path` as the database instead of `.phase-ledger/ledger.db`.
    pub fn with_db_path(mut self, path: Option<PathBuf>) -> Self {
        self.db_override = path;
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.ledger_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_override
            .clone()
            .unwrap_or_else(|| self.ledger_dir.join(DB_FILE))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
