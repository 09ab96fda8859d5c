//! Typed error hierarchy for the phase ledger.
//!
//! Two enums cover the two layers:
//! - `StoreError`: failures reported by a `PhaseStore` backend, classified
//!   into transient infrastructure failures, write-write conflicts and
//!   everything else
//! - `PhaseStateError`: failures surfaced by `PhaseStateManager` to the
//!   orchestrator

use thiserror::Error;

use crate::phase::PhaseStatus;

/// Errors from a phase record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity or operational failure that is safe to retry.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Another writer modified the row (or holds it) during this operation.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Any other backend failure (schema, corruption, bad data).
    #[error("Store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Check if the failure may be retried without side effects.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Errors surfaced by the phase state manager.
#[derive(Debug, Error)]
pub enum PhaseStateError {
    #[error(
        "Invalid state transition for phase {phase_id}: {from} -> {to} (valid targets: {})",
        format_targets(.valid_targets)
    )]
    InvalidTransition {
        phase_id: String,
        from: PhaseStatus,
        to: PhaseStatus,
        valid_targets: Vec<PhaseStatus>,
    },

    #[error("Invalid update for phase {phase_id}: {field} {reason}")]
    InvalidUpdate {
        phase_id: String,
        field: &'static str,
        reason: String,
    },

    #[error("Optimistic lock conflict on phase {phase_id}: {detail}")]
    LockConflict { phase_id: String, detail: String },

    #[error("Transient store failure for phase {phase_id} after retries: {source}")]
    Transient {
        phase_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Store error for phase {phase_id}: {source}")]
    Store {
        phase_id: String,
        #[source]
        source: StoreError,
    },
}

impl PhaseStateError {
    /// Classify a store failure for the given phase.
    pub fn from_store(phase_id: &str, err: StoreError) -> Self {
        let phase_id = phase_id.to_string();
        match err {
            StoreError::Conflict(detail) => Self::LockConflict { phase_id, detail },
            err @ StoreError::Transient(_) => Self::Transient {
                phase_id,
                source: err,
            },
            err @ StoreError::Backend(_) => Self::Store {
                phase_id,
                source: err,
            },
        }
    }

    /// Illegal edges and counter invariant violations share one class.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::InvalidUpdate { .. }
        )
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn phase_id(&self) -> &str {
        match self {
            Self::InvalidTransition { phase_id, .. }
            | Self::InvalidUpdate { phase_id, .. }
            | Self::LockConflict { phase_id, .. }
            | Self::Transient { phase_id, .. }
            | Self::Store { phase_id, .. } => phase_id,
        }
    }
}

fn format_targets(targets: &[PhaseStatus]) -> String {
    if targets.is_empty() {
        return "none".to_string();
    }
    targets
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
