//! CLI command implementations.
//!
//! | Module    | Commands handled                                      |
//! |-----------|-------------------------------------------------------|
//! | `project` | `Init`                                                |
//! | `phase`   | `Register`, `Status`, `Show`, `Mark`, `Update`, `Reset` |
//! | `config`  | `Config`                                              |

pub mod config;
pub mod phase;
pub mod project;

pub use config::cmd_config;
pub use phase::{cmd_mark, cmd_register, cmd_reset, cmd_show, cmd_status, cmd_update};
pub use project::cmd_init;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use phase_ledger::config::LedgerConfig;
use phase_ledger::manager::{PhaseStateHandle, PhaseStateManager};
use phase_ledger::store::SqlitePhaseStore;

use super::Cli;

/// Open the ledger database and wrap a manager for the selected run.
pub(crate) fn open_handle(cli: &Cli, project_dir: &Path) -> Result<PhaseStateHandle> {
    let config = LedgerConfig::new(project_dir.to_path_buf())?.with_db_path(cli.db.clone());

    if cli.db.is_none() && !phase_ledger::init::is_initialized(project_dir) {
        anyhow::bail!(
            "No ledger found in {}. Run 'phase-ledger init' first.",
            project_dir.display()
        );
    }

    for warning in config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }

    let store =
        SqlitePhaseStore::open_with_busy_timeout(&config.db_path(), config.toml.busy_timeout())?;
    let project_id = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let manager = PhaseStateManager::with_options(
        cli.run.clone(),
        project_dir.display().to_string(),
        project_id,
        Arc::new(store),
        config.toml.manager_options(),
    );
    Ok(PhaseStateHandle::new(manager))
}
