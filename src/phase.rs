//! Phase record data model.
//!
//! This module provides:
//! - `PhaseStatus`, the lifecycle states a phase moves through
//! - `PhaseKey`, the `(run, phase)` identity of a persisted record
//! - `PhaseRecord`, the durable row holding status, counters and version

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound (inclusive) for `PhaseRecord::escalation_level`.
pub const MAX_ESCALATION_LEVEL: u32 = 10;

/// Lifecycle status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Waiting to be picked up by a worker
    #[default]
    Queued,
    /// A worker is executing the phase
    Executing,
    /// Paused at a review/approval gate
    Gate,
    /// Waiting on CI results
    CiRunning,
    /// Finished successfully (terminal)
    Complete,
    /// Failed; can only be reset back to `Queued`
    Failed,
    /// Skipped without running (terminal)
    Skipped,
}

impl PhaseStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [PhaseStatus; 7] = [
        PhaseStatus::Queued,
        PhaseStatus::Executing,
        PhaseStatus::Gate,
        PhaseStatus::CiRunning,
        PhaseStatus::Complete,
        PhaseStatus::Failed,
        PhaseStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Gate => "gate",
            Self::CiRunning => "ci_running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal states have no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// Check if a worker currently owns the phase.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Executing | Self::Gate | Self::CiRunning)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(Self::Queued),
            "executing" => Ok(Self::Executing),
            "gate" => Ok(Self::Gate),
            "ci_running" => Ok(Self::CiRunning),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => anyhow::bail!(
                "Invalid phase status '{}'. Valid values: queued, executing, gate, ci_running, \
                 complete, failed, skipped",
                s
            ),
        }
    }
}

/// Identity of a phase record: one row per `(run_id, phase_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseKey {
    pub run_id: String,
    pub phase_id: String,
}

impl PhaseKey {
    pub fn new(run_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            phase_id: phase_id.into(),
        }
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.phase_id)
    }
}

/// Persisted lifecycle state of one phase within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub run_id: String,
    pub phase_id: String,
    pub status: PhaseStatus,
    /// Number of retry attempts recorded for the phase
    pub retry_attempt: u32,
    /// Replan counter
    pub revision_epoch: u32,
    /// Escalation tier, bounded by `MAX_ESCALATION_LEVEL`
    pub escalation_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every committed mutation; 0 means "never written".
    pub version: u64,
}

impl PhaseRecord {
    /// The zero state a phase has before anything is persisted for it.
    pub fn queued(key: &PhaseKey) -> Self {
        Self {
            run_id: key.run_id.clone(),
            phase_id: key.phase_id.clone(),
            status: PhaseStatus::Queued,
            retry_attempt: 0,
            revision_epoch: 0,
            escalation_level: 0,
            last_failure_reason: None,
            last_attempt_timestamp: None,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn key(&self) -> PhaseKey {
        PhaseKey::new(self.run_id.clone(), self.phase_id.clone())
    }

    /// Check whether this record has ever been committed.
    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }
}
