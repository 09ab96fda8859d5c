//! Initialization of the per-project ledger directory.
//!
//! `phase-ledger init` creates:
//!
//! ```text
//! .phase-ledger/
//! ├── ledger.toml      # Manager, retry and store settings (defaults)
//! └── ledger.db        # SQLite phase records, migrated to the current schema
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, DB_FILE, LedgerToml};
use crate::store::SqlitePhaseStore;

/// The name of the ledger directory inside a project.
pub const LEDGER_DIR: &str = ".phase-ledger";

/// Result of initializing a ledger.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.phase-ledger` directory
    pub ledger_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
    /// Schema version of the database after migrations
    pub schema_version: i32,
}

/// Initialize a ledger in `project_dir`.
///
/// Safe to run repeatedly: an existing `ledger.toml` is left alone and the
/// database is only migrated forward.
pub fn init_ledger(project_dir: &Path) -> Result<InitResult> {
    let ledger_dir = get_ledger_dir(project_dir);
    let created = !ledger_dir.exists();

    std::fs::create_dir_all(&ledger_dir)
        .with_context(|| format!("Failed to create directory: {}", ledger_dir.display()))?;

    let config_path = ledger_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        LedgerToml::default().save(&config_path)?;
    }

    let toml = LedgerToml::load(&config_path)?;
    let store = SqlitePhaseStore::open_with_busy_timeout(
        &ledger_dir.join(DB_FILE),
        toml.busy_timeout(),
    )?;
    let schema_version = store.schema_version()?;

    tracing::info!(
        ledger_dir = %ledger_dir.display(),
        created,
        schema_version,
        "Ledger initialized"
    );

    Ok(InitResult {
        ledger_dir,
        created,
        schema_version,
    })
}

/// Check if a project already has a ledger directory.
pub fn is_initialized(project_dir: &Path) -> bool {
    get_ledger_dir(project_dir).exists()
}

/// Get the path to the ledger directory for a project.
pub fn get_ledger_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(LEDGER_DIR)
}
