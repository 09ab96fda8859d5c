//! Ledger initialization command.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use phase_ledger::init::init_ledger;

    let result = init_ledger(project_dir)?;

    if result.created {
        println!(
            "Initialized phase ledger at {}",
            result.ledger_dir.display()
        );
        println!();
        println!("Created:");
        println!("  .phase-ledger/");
        println!("  ├── ledger.toml   # Manager, retry and store settings");
        println!("  └── ledger.db     # Phase records (schema v{})", result.schema_version);
        println!();
        println!("Next steps:");
        println!("  1. Run `phase-ledger register <phase>...` to queue phases");
        println!("  2. Run `phase-ledger mark <phase> executing` as work starts");
    } else {
        println!(
            "Phase ledger already initialized at {}",
            result.ledger_dir.display()
        );
        println!("Database schema at v{}.", result.schema_version);
    }

    Ok(())
}
