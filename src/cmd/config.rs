//! Configuration view and validation commands: `phase-ledger config`.

use anyhow::Result;

use super::super::ConfigCommands;

fn print_toml(toml: &phase_ledger::config::LedgerToml) {
    println!("[manager]");
    println!(
        "  validate_transitions = {}",
        toml.manager.validate_transitions
    );
    println!("  strict_monotonic = {}", toml.manager.strict_monotonic);
    println!();
    println!("[retry]");
    println!("  max_attempts = {}", toml.retry.max_attempts);
    println!("  initial_delay_ms = {}", toml.retry.initial_delay_ms);
    println!("  max_delay_ms = {}", toml.retry.max_delay_ms);
    println!("  backoff_multiplier = {}", toml.retry.backoff_multiplier);
    println!();
    println!("[store]");
    println!("  busy_timeout_ms = {}", toml.store.busy_timeout_ms);
    println!();
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use phase_ledger::config::{CONFIG_FILE, LedgerToml};
    use phase_ledger::init::get_ledger_dir;

    let ledger_dir = get_ledger_dir(project_dir);
    let config_path = ledger_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Phase Ledger Configuration");
            println!("==========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                LedgerToml::load(&config_path)?
            } else {
                println!("No ledger.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                LedgerToml::default()
            };
            print_toml(&toml);

            let total = toml.retry_config().total_max_wait();
            println!(
                "Worst-case retry wait per operation: {:.1}s",
                total.as_secs_f64()
            );
            println!();
            if !config_path.exists() {
                println!("Run 'phase-ledger config init' to create a ledger.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No ledger.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = LedgerToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("ledger.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !ledger_dir.exists() {
                std::fs::create_dir_all(&ledger_dir)?;
            }

            LedgerToml::default().save(&config_path)?;

            println!("Created ledger.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [manager] validate_transitions, strict_monotonic");
            println!(
                "  - [retry] max_attempts, initial_delay_ms, max_delay_ms, backoff_multiplier"
            );
            println!("  - [store] busy_timeout_ms");
            println!();
        }
    }

    Ok(())
}
