//! Phase registration, status, transition and counter commands.

use anyhow::Result;
use std::path::Path;

use phase_ledger::errors::PhaseStateError;
use phase_ledger::manager::StateUpdateRequest;
use phase_ledger::phase::{PhaseRecord, PhaseStatus};
use phase_ledger::transitions::rejection_reason;

use super::super::Cli;
use super::open_handle;

fn status_style(status: PhaseStatus) -> console::Style {
    let style = console::Style::new();
    match status {
        PhaseStatus::Complete => style.green(),
        PhaseStatus::Failed => style.red(),
        PhaseStatus::Skipped => style.dim(),
        PhaseStatus::Queued => style.cyan(),
        _ if status.is_active() => style.yellow(),
        _ => style,
    }
}

fn styled_status(status: PhaseStatus) -> console::StyledObject<&'static str> {
    status_style(status).apply_to(status.as_str())
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn cmd_register(cli: &Cli, project_dir: &Path, phases: &[String]) -> Result<()> {
    let handle = open_handle(cli, project_dir)?;
    for phase in phases {
        let record = handle.register(phase).await?;
        println!(
            "{:<20} {} (version {})",
            record.phase_id,
            styled_status(record.status),
            record.version
        );
    }
    Ok(())
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    let handle = open_handle(cli, project_dir)?;
    let records = handle.list_phases().await?;

    println!();
    println!("Run: {}", cli.run);
    println!();

    if records.is_empty() {
        println!("No phases registered. Run 'phase-ledger register <phase>' to add one.");
        println!();
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:>5} {:>5} {:>5} {:>7}  Last failure",
        "Phase", "Status", "Retry", "Epoch", "Esc", "Version"
    );
    println!(
        "{:<20} {:<12} {:>5} {:>5} {:>5} {:>7}  ------------",
        "--------------------", "------------", "-----", "-----", "-----", "-------"
    );
    for record in &records {
        // Pad before styling; ANSI codes would break the column width.
        let status =
            status_style(record.status).apply_to(format!("{:<12}", record.status.as_str()));
        println!(
            "{:<20} {} {:>5} {:>5} {:>5} {:>7}  {}",
            record.phase_id,
            status,
            record.retry_attempt,
            record.revision_epoch,
            record.escalation_level,
            record.version,
            record.last_failure_reason.as_deref().unwrap_or("-")
        );
    }
    println!();

    let done = records.iter().filter(|r| r.status.is_terminal()).count();
    let active = records.iter().filter(|r| r.status.is_active()).count();
    println!(
        "{}/{} phases finished, {} active",
        done,
        records.len(),
        active
    );
    println!();
    Ok(())
}

fn print_record(record: &PhaseRecord) {
    println!("Phase:              {}", record.phase_id);
    println!("Run:                {}", record.run_id);
    println!("Status:             {}", styled_status(record.status));
    println!("Retry attempt:      {}", record.retry_attempt);
    println!("Revision epoch:     {}", record.revision_epoch);
    println!("Escalation level:   {}", record.escalation_level);
    println!(
        "Last failure:       {}",
        record.last_failure_reason.as_deref().unwrap_or("-")
    );
    println!("Last attempt:       {}", format_time(record.last_attempt_timestamp));
    println!("Started:            {}", format_time(record.started_at));
    println!("Completed:          {}", format_time(record.completed_at));
    println!("Version:            {}", record.version);
}

pub async fn cmd_show(cli: &Cli, project_dir: &Path, phase: &str, json: bool) -> Result<()> {
    let handle = open_handle(cli, project_dir)?;
    let record = handle.load_or_default(phase).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    if !record.is_persisted() {
        println!("Phase '{}' is not registered; showing defaults.", phase);
    }
    print_record(&record);
    Ok(())
}

pub async fn cmd_mark(
    cli: &Cli,
    project_dir: &Path,
    phase: &str,
    status: &str,
    reason: Option<&str>,
) -> Result<()> {
    let to: PhaseStatus = status.parse()?;
    let handle = open_handle(cli, project_dir)?;

    let applied = handle
        .transition(phase, to, reason.map(str::to_string))
        .await
        .map_err(|e| match &e {
            PhaseStateError::InvalidTransition { from, to, .. } => {
                let explanation = rejection_reason(*from, *to);
                anyhow::Error::new(e).context(explanation)
            }
            _ => e.into(),
        })?;
    if !applied {
        anyhow::bail!(
            "Phase '{}' is not registered in run '{}'. Run 'phase-ledger register {}' first.",
            phase,
            cli.run,
            phase
        );
    }

    println!("{} -> {}", phase, styled_status(to));
    Ok(())
}

pub async fn cmd_update(
    cli: &Cli,
    project_dir: &Path,
    phase: &str,
    request: StateUpdateRequest,
) -> Result<()> {
    if request.is_empty() {
        println!("Nothing to update.");
        return Ok(());
    }

    let handle = open_handle(cli, project_dir)?;
    handle.update(phase, request).await?;

    let record = handle.load_or_default(phase).await?;
    println!(
        "{}: retry={} epoch={} escalation={} (version {})",
        phase,
        record.retry_attempt,
        record.revision_epoch,
        record.escalation_level,
        record.version
    );
    Ok(())
}

pub async fn cmd_reset(cli: &Cli, project_dir: &Path, phase: &str) -> Result<()> {
    let handle = open_handle(cli, project_dir)?;
    if !handle.reset_to_queued(phase).await? {
        anyhow::bail!("Phase '{}' is not registered in run '{}'.", phase, cli.run);
    }
    println!("{} -> {}", phase, styled_status(PhaseStatus::Queued));
    Ok(())
}
