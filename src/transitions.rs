//! Phase lifecycle transition table.
//!
//! The table is the single authority on which status changes are legal:
//!
//! | From         | Valid targets                              |
//! |--------------|--------------------------------------------|
//! | `queued`     | `executing`, `skipped`                     |
//! | `executing`  | `gate`, `ci_running`, `complete`, `failed` |
//! | `gate`       | `executing`, `complete`, `failed`          |
//! | `ci_running` | `complete`, `failed`                       |
//! | `complete`   | none                                       |
//! | `failed`     | `queued`                                   |
//! | `skipped`    | none                                       |
//!
//! A failed phase never goes straight back to `executing`; it has to be reset
//! to `queued` first.

use crate::errors::PhaseStateError;
use crate::phase::PhaseStatus;

/// Statuses reachable in one step from `from`.
pub fn valid_targets(from: PhaseStatus) -> &'static [PhaseStatus] {
    use PhaseStatus::*;
    match from {
        Queued => &[Executing, Skipped],
        Executing => &[Gate, CiRunning, Complete, Failed],
        Gate => &[Executing, Complete, Failed],
        CiRunning => &[Complete, Failed],
        Complete => &[],
        Failed => &[Queued],
        Skipped => &[],
    }
}

pub fn is_transition_valid(from: PhaseStatus, to: PhaseStatus) -> bool {
    valid_targets(from).contains(&to)
}

/// Fail with `InvalidTransition` unless `from -> to` is an edge of the table.
pub fn validate_transition(
    phase_id: &str,
    from: PhaseStatus,
    to: PhaseStatus,
) -> Result<(), PhaseStateError> {
    if is_transition_valid(from, to) {
        return Ok(());
    }
    Err(PhaseStateError::InvalidTransition {
        phase_id: phase_id.to_string(),
        from,
        to,
        valid_targets: valid_targets(from).to_vec(),
    })
}

/// Human-readable explanation of why `from -> to` is rejected.
pub fn rejection_reason(from: PhaseStatus, to: PhaseStatus) -> String {
    if is_transition_valid(from, to) {
        return format!("{} -> {} is allowed", from, to);
    }
    if from.is_terminal() {
        return format!("{} is terminal and has no outgoing transitions", from);
    }
    if from == PhaseStatus::Failed {
        return format!(
            "a failed phase must be reset to queued before moving to {}",
            to
        );
    }
    if from == to {
        return format!("phase is already {}", from);
    }
    let targets = valid_targets(from)
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} can only move to: {}", from, targets)
}
