//! Partial counter updates.
//!
//! A `StateUpdateRequest` is an explicit set of optional changes applied to a
//! freshly locked record in one write. Increments are computed first, then
//! explicit overrides replace them for the same field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PhaseStateError;
use crate::phase::{MAX_ESCALATION_LEVEL, PhaseRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdateRequest {
    #[serde(default)]
    pub increment_retry: bool,
    #[serde(default)]
    pub increment_epoch: bool,
    #[serde(default)]
    pub increment_escalation: bool,
    /// Signed so that out-of-range values reach validation instead of being
    /// unrepresentable.
    #[serde(default)]
    pub set_retry: Option<i64>,
    #[serde(default)]
    pub set_epoch: Option<i64>,
    #[serde(default)]
    pub set_escalation: Option<i64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Recorded as `last_attempt_timestamp`.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Version the caller based this change on. A different version under the
    /// row lock is reported as a lock conflict.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl StateUpdateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn increment_epoch(mut self) -> Self {
        self.increment_epoch = true;
        self
    }

    pub fn increment_escalation(mut self) -> Self {
        self.increment_escalation = true;
        self
    }

    pub fn set_retry(mut self, value: i64) -> Self {
        self.set_retry = Some(value);
        self
    }

    pub fn set_epoch(mut self, value: i64) -> Self {
        self.set_epoch = Some(value);
        self
    }

    pub fn set_escalation(mut self, value: i64) -> Self {
        self.set_escalation = Some(value);
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// True when no field would change. `expected_version` alone is not a change.
    pub fn is_empty(&self) -> bool {
        !self.increment_retry
            && !self.increment_epoch
            && !self.increment_escalation
            && self.set_retry.is_none()
            && self.set_epoch.is_none()
            && self.set_escalation.is_none()
            && self.failure_reason.is_none()
            && self.timestamp.is_none()
    }
}

/// Compute the record that `request` produces from `current`.
///
/// `now` bounds the accepted timestamp. With `strict_monotonic` a decrease of
/// `retry_attempt` or `revision_epoch` is rejected; otherwise it is logged.
pub(crate) fn apply_update(
    phase_id: &str,
    current: &PhaseRecord,
    request: &StateUpdateRequest,
    strict_monotonic: bool,
    now: DateTime<Utc>,
) -> Result<PhaseRecord, PhaseStateError> {
    let mut next = current.clone();

    if let Some(value) = resolve_counter(
        current.retry_attempt,
        request.increment_retry,
        request.set_retry,
    ) {
        next.retry_attempt = checked_counter(
            phase_id,
            "retry_attempt",
            value,
            current.retry_attempt,
            strict_monotonic,
        )?;
    }

    if let Some(value) = resolve_counter(
        current.revision_epoch,
        request.increment_epoch,
        request.set_epoch,
    ) {
        next.revision_epoch = checked_counter(
            phase_id,
            "revision_epoch",
            value,
            current.revision_epoch,
            strict_monotonic,
        )?;
    }

    if let Some(value) = resolve_counter(
        current.escalation_level,
        request.increment_escalation,
        request.set_escalation,
    ) {
        if value > MAX_ESCALATION_LEVEL as i64 {
            return Err(PhaseStateError::InvalidUpdate {
                phase_id: phase_id.to_string(),
                field: "escalation_level",
                reason: format!("{} exceeds maximum of {}", value, MAX_ESCALATION_LEVEL),
            });
        }
        next.escalation_level = non_negative(phase_id, "escalation_level", value)?;
    }

    if let Some(at) = request.timestamp {
        if at > now {
            return Err(PhaseStateError::InvalidUpdate {
                phase_id: phase_id.to_string(),
                field: "timestamp",
                reason: format!("{} is in the future", at.to_rfc3339()),
            });
        }
        next.last_attempt_timestamp = Some(at);
    }

    if let Some(reason) = &request.failure_reason {
        next.last_failure_reason = Some(reason.clone());
    }

    Ok(next)
}

fn resolve_counter(current: u32, increment: bool, set: Option<i64>) -> Option<i64> {
    let incremented = increment.then(|| current as i64 + 1);
    set.or(incremented)
}

fn non_negative(phase_id: &str, field: &'static str, value: i64) -> Result<u32, PhaseStateError> {
    if value < 0 {
        return Err(PhaseStateError::InvalidUpdate {
            phase_id: phase_id.to_string(),
            field,
            reason: format!("must be non-negative, got {}", value),
        });
    }
    u32::try_from(value).map_err(|_| PhaseStateError::InvalidUpdate {
        phase_id: phase_id.to_string(),
        field,
        reason: format!("{} is out of range", value),
    })
}

fn checked_counter(
    phase_id: &str,
    field: &'static str,
    value: i64,
    current: u32,
    strict_monotonic: bool,
) -> Result<u32, PhaseStateError> {
    let value = non_negative(phase_id, field, value)?;
    if value < current {
        if strict_monotonic {
            return Err(PhaseStateError::InvalidUpdate {
                phase_id: phase_id.to_string(),
                field,
                reason: format!("would decrease from {} to {}", current, value),
            });
        }
        tracing::warn!(
            phase_id,
            field,
            from = current,
            to = value,
            "Counter decreased; accepting non-monotonic write"
        );
    }
    Ok(value)
}
