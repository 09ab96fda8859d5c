//! Phase state manager.
//!
//! `PhaseStateManager` is the only writer of phase status. Each call:
//!
//! 1. Reads through the retry wrapper (`crate::retry`)
//! 2. Takes the row lock via `PhaseStore::lock_row`
//! 3. Validates the requested transition or counter change
//! 4. Commits with a version bump
//!
//! Transient store failures retry the whole lock/validate/commit unit, so a
//! failed attempt never leaves a partial change behind. Validation failures
//! and lock conflicts are returned to the caller untouched.

pub mod handle;
pub mod update;

pub use handle::PhaseStateHandle;
pub use update::StateUpdateRequest;

use std::sync::Arc;

use chrono::Utc;

use crate::errors::PhaseStateError;
use crate::phase::{PhaseKey, PhaseRecord, PhaseStatus};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::store::PhaseStore;
use crate::transitions;

/// Behaviour switches for a manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    /// Enforce the transition table on status changes.
    pub validate_transitions: bool,
    /// Reject (instead of logging) decreases of retry/epoch counters.
    pub strict_monotonic: bool,
    /// Backoff schedule for transient store failures.
    pub retry: RetryConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            validate_transitions: true,
            strict_monotonic: false,
            retry: RetryConfig::DEFAULT,
        }
    }
}

pub struct PhaseStateManager {
    run_id: String,
    workspace_ref: String,
    project_id: String,
    store: Arc<dyn PhaseStore>,
    options: ManagerOptions,
}

impl PhaseStateManager {
    /// Create a manager for one run with default options (transitions validated).
    pub fn new(
        run_id: impl Into<String>,
        workspace_ref: impl Into<String>,
        project_id: impl Into<String>,
        store: Arc<dyn PhaseStore>,
    ) -> Self {
        Self::with_options(
            run_id,
            workspace_ref,
            project_id,
            store,
            ManagerOptions::default(),
        )
    }

    pub fn with_options(
        run_id: impl Into<String>,
        workspace_ref: impl Into<String>,
        project_id: impl Into<String>,
        store: Arc<dyn PhaseStore>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workspace_ref: workspace_ref.into(),
            project_id: project_id.into(),
            store,
            options,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workspace_ref(&self) -> &str {
        &self.workspace_ref
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn is_transition_valid(&self, from: PhaseStatus, to: PhaseStatus) -> bool {
        transitions::is_transition_valid(from, to)
    }

    /// Current record, or the zero-valued QUEUED default if none exists yet.
    pub fn load_or_default(&self, phase_id: &str) -> Result<PhaseRecord, PhaseStateError> {
        let key = self.key(phase_id);
        let found = self.with_retry(|_| {
            self.store
                .fetch(&key)
                .map_err(|e| PhaseStateError::from_store(phase_id, e))
        })?;
        Ok(found.unwrap_or_else(|| {
            tracing::debug!(run_id = %self.run_id, phase_id, "No phase record yet; using defaults");
            PhaseRecord::queued(&key)
        }))
    }

    /// All records of this run, ordered by phase id.
    pub fn list_phases(&self) -> Result<Vec<PhaseRecord>, PhaseStateError> {
        self.with_retry(|_| {
            self.store
                .fetch_run(&self.run_id)
                .map_err(|e| PhaseStateError::from_store("*", e))
        })
    }

    /// Create the QUEUED record for a phase if it does not exist yet.
    ///
    /// Returns the record as stored, whether newly created or pre-existing.
    pub fn register(&self, phase_id: &str) -> Result<PhaseRecord, PhaseStateError> {
        let key = self.key(phase_id);
        let mut existing = None;
        let created = self.mutate(phase_id, |current| match current {
            Some(record) => {
                existing = Some(record.clone());
                Ok(None)
            }
            None => Ok(Some(PhaseRecord::queued(&key))),
        })?;

        if let Some(record) = &created {
            tracing::info!(
                run_id = %self.run_id,
                project_id = %self.project_id,
                phase_id,
                version = record.version,
                "Registered phase"
            );
        }
        Ok(created
            .or(existing)
            .unwrap_or_else(|| PhaseRecord::queued(&key)))
    }

    /// Apply a partial counter update.
    ///
    /// An empty request succeeds without touching storage. A missing record is
    /// created from the zero state.
    pub fn update(
        &self,
        phase_id: &str,
        request: StateUpdateRequest,
    ) -> Result<bool, PhaseStateError> {
        if request.is_empty() {
            tracing::debug!(
                run_id = %self.run_id,
                phase_id,
                "Empty update request; nothing to persist"
            );
            return Ok(true);
        }

        let key = self.key(phase_id);
        let committed = self.mutate(phase_id, |current| {
            let base = current
                .cloned()
                .unwrap_or_else(|| PhaseRecord::queued(&key));
            if let Some(expected) = request.expected_version
                && base.version != expected
            {
                return Err(PhaseStateError::LockConflict {
                    phase_id: phase_id.to_string(),
                    detail: format!(
                        "expected version {}, found {}",
                        expected, base.version
                    ),
                });
            }
            let next = update::apply_update(
                phase_id,
                &base,
                &request,
                self.options.strict_monotonic,
                Utc::now(),
            )?;
            Ok(Some(next))
        })?;

        if let Some(record) = committed {
            tracing::info!(
                run_id = %self.run_id,
                phase_id,
                retry_attempt = record.retry_attempt,
                revision_epoch = record.revision_epoch,
                escalation_level = record.escalation_level,
                version = record.version,
                "Phase counters updated"
            );
        }
        Ok(true)
    }

    pub fn mark_executing(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Executing, None)
    }

    pub fn mark_complete(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Complete, None)
    }

    pub fn mark_failed(&self, phase_id: &str, reason: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Failed, Some(reason))
    }

    pub fn mark_gate(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Gate, None)
    }

    pub fn mark_ci_running(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::CiRunning, None)
    }

    pub fn mark_skipped(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Skipped, None)
    }

    /// Explicit retry reset: FAILED -> QUEUED.
    pub fn reset_to_queued(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Queued, None)
    }

    /// Move a phase to `to`, stamping the lifecycle timestamps.
    ///
    /// Returns `Ok(false)` if the phase has no record; that points at a
    /// caller-side race or bug rather than a storage problem.
    pub fn transition(
        &self,
        phase_id: &str,
        to: PhaseStatus,
        reason: Option<&str>,
    ) -> Result<bool, PhaseStateError> {
        let mut from = None;
        let committed = self.mutate(phase_id, |current| {
            let Some(current) = current else {
                return Ok(None);
            };
            from = Some(current.status);
            self.check_transition(phase_id, current.status, to)?;
            Ok(Some(apply_transition(current, to, reason)))
        })?;

        match (committed, from) {
            (Some(record), Some(from)) => {
                tracing::info!(
                    run_id = %self.run_id,
                    workspace = %self.workspace_ref,
                    phase_id,
                    from = %from,
                    to = %to,
                    version = record.version,
                    "Phase transition committed"
                );
                Ok(true)
            }
            _ => {
                tracing::warn!(
                    run_id = %self.run_id,
                    phase_id,
                    to = %to,
                    "Phase record not found; transition ignored"
                );
                Ok(false)
            }
        }
    }

    fn check_transition(
        &self,
        phase_id: &str,
        from: PhaseStatus,
        to: PhaseStatus,
    ) -> Result<(), PhaseStateError> {
        if self.options.validate_transitions {
            return transitions::validate_transition(phase_id, from, to);
        }
        if !transitions::is_transition_valid(from, to) {
            tracing::warn!(
                run_id = %self.run_id,
                phase_id,
                reason = %transitions::rejection_reason(from, to),
                "Transition validation disabled; applying off-table transition"
            );
        }
        Ok(())
    }

    /// Lock the row, let `apply` compute the next record, and commit it.
    ///
    /// `apply` returning `None` leaves the row untouched. The whole unit is
    /// retried on transient failures.
    fn mutate<F>(
        &self,
        phase_id: &str,
        mut apply: F,
    ) -> Result<Option<PhaseRecord>, PhaseStateError>
    where
        F: FnMut(Option<&PhaseRecord>) -> Result<Option<PhaseRecord>, PhaseStateError>,
    {
        let key = self.key(phase_id);
        self.with_retry(|attempt| {
            tracing::debug!(run_id = %self.run_id, phase_id, attempt, "Locking phase row");
            let row = self
                .store
                .lock_row(&key)
                .map_err(|e| PhaseStateError::from_store(phase_id, e))?;
            let Some(next) = apply(row.current())? else {
                return Ok(None);
            };
            let committed = row
                .commit(next)
                .map_err(|e| PhaseStateError::from_store(phase_id, e))?;
            Ok(Some(committed))
        })
    }

    fn with_retry<T, F>(&self, operation: F) -> Result<T, PhaseStateError>
    where
        F: FnMut(u32) -> Result<T, PhaseStateError>,
    {
        retry_with_backoff(&self.options.retry, PhaseStateError::is_transient, operation)
    }

    fn key(&self, phase_id: &str) -> PhaseKey {
        PhaseKey::new(self.run_id.clone(), phase_id)
    }
}

/// Next record for a validated status change.
fn apply_transition(current: &PhaseRecord, to: PhaseStatus, reason: Option<&str>) -> PhaseRecord {
    let now = Utc::now();
    let mut next = current.clone();
    next.status = to;
    match to {
        PhaseStatus::Executing => {
            if current.status == PhaseStatus::Queued || next.started_at.is_none() {
                next.started_at = Some(now);
            }
            next.last_attempt_timestamp = Some(now);
        }
        PhaseStatus::Complete | PhaseStatus::Skipped => {
            next.completed_at = Some(now);
        }
        PhaseStatus::Failed => {
            next.completed_at = Some(now);
            if let Some(reason) = reason {
                next.last_failure_reason = Some(reason.to_string());
            }
        }
        PhaseStatus::Queued => {
            next.started_at = None;
            next.completed_at = None;
        }
        PhaseStatus::Gate | PhaseStatus::CiRunning => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultKind, FaultPoint, MemoryPhaseStore};

    fn manager_with(store: Arc<MemoryPhaseStore>) -> PhaseStateManager {
        PhaseStateManager::with_options(
            "run-1",
            "/tmp/workspace",
            "proj",
            store,
            ManagerOptions {
                retry: RetryConfig::immediate(3),
                ..ManagerOptions::default()
            },
        )
    }

    fn setup() -> (Arc<MemoryPhaseStore>, PhaseStateManager) {
        let store = Arc::new(MemoryPhaseStore::new());
        let manager = manager_with(store.clone());
        (store, manager)
    }

    #[test]
    fn test_load_or_default_for_missing_phase() -> anyhow::Result<()> {
        let (store, manager) = setup();
        let record = manager.load_or_default("nope")?;
        assert_eq!(record.retry_attempt, 0);
        assert_eq!(record.revision_epoch, 0);
        assert_eq!(record.escalation_level, 0);
        assert_eq!(record.status, PhaseStatus::Queued);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_register_is_idempotent() -> anyhow::Result<()> {
        let (store, manager) = setup();
        let first = manager.register("p1")?;
        assert_eq!(first.version, 1);
        let second = manager.register("p1")?;
        assert_eq!(second.version, 1);
        assert_eq!(store.write_count(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_update_does_not_touch_storage() -> anyhow::Result<()> {
        let (store, manager) = setup();
        store.inject_fault(FaultPoint::Lock, FaultKind::Transient, 10);
        assert!(manager.update("p1", StateUpdateRequest::new())?);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_update_increments_from_locked_state() -> anyhow::Result<()> {
        let (store, manager) = setup();
        let mut seeded = PhaseRecord::queued(&PhaseKey::new("run-1", "p1"));
        seeded.retry_attempt = 2;
        store.seed(seeded);

        assert!(manager.update("p1", StateUpdateRequest::new().increment_retry())?);
        let record = manager.load_or_default("p1")?;
        assert_eq!(record.retry_attempt, 3);
        assert_eq!(record.version, 2);
        Ok(())
    }

    #[test]
    fn test_update_creates_missing_record() -> anyhow::Result<()> {
        let (_store, manager) = setup();
        manager.update("p1", StateUpdateRequest::new().increment_epoch())?;
        let record = manager.load_or_default("p1")?;
        assert_eq!(record.revision_epoch, 1);
        assert_eq!(record.status, PhaseStatus::Queued);
        assert_eq!(record.version, 1);
        Ok(())
    }

    #[test]
    fn test_update_validation_errors_leave_record_unchanged() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("p1")?;

        let err = manager
            .update("p1", StateUpdateRequest::new().set_escalation(11))
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(err.to_string().contains("maximum of 10"));

        let err = manager
            .update("p1", StateUpdateRequest::new().set_retry(-1))
            .unwrap_err();
        assert!(err.is_invalid_transition());

        let future = Utc::now() + chrono::Duration::days(1);
        let err = manager
            .update("p1", StateUpdateRequest::new().timestamp(future))
            .unwrap_err();
        assert!(err.is_invalid_transition());

        assert_eq!(store.write_count(), 1);
        assert_eq!(manager.load_or_default("p1")?.version, 1);
        Ok(())
    }

    #[test]
    fn test_strict_monotonic_option() -> anyhow::Result<()> {
        let store = Arc::new(MemoryPhaseStore::new());
        let manager = PhaseStateManager::with_options(
            "run-1",
            "ws",
            "proj",
            store.clone(),
            ManagerOptions {
                strict_monotonic: true,
                retry: RetryConfig::immediate(1),
                ..ManagerOptions::default()
            },
        );
        manager.update("p1", StateUpdateRequest::new().set_retry(4))?;
        let err = manager
            .update("p1", StateUpdateRequest::new().set_retry(2))
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(manager.load_or_default("p1")?.retry_attempt, 4);
        Ok(())
    }

    #[test]
    fn test_mark_on_missing_record_returns_false() -> anyhow::Result<()> {
        let (store, manager) = setup();
        assert!(!manager.mark_executing("ghost")?);
        assert!(!manager.mark_complete("ghost")?);
        assert!(!manager.mark_failed("ghost", "boom")?);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_lifecycle_sets_timestamps() -> anyhow::Result<()> {
        let (_store, manager) = setup();
        manager.register("p1")?;

        assert!(manager.mark_executing("p1")?);
        let executing = manager.load_or_default("p1")?;
        assert_eq!(executing.status, PhaseStatus::Executing);
        assert!(executing.started_at.is_some());
        assert!(executing.last_attempt_timestamp.is_some());
        assert!(executing.completed_at.is_none());

        assert!(manager.mark_gate("p1")?);
        assert!(manager.mark_executing("p1")?);
        let resumed = manager.load_or_default("p1")?;
        assert_eq!(resumed.started_at, executing.started_at);

        assert!(manager.mark_ci_running("p1")?);
        assert!(manager.mark_complete("p1")?);
        let done = manager.load_or_default("p1")?;
        assert_eq!(done.status, PhaseStatus::Complete);
        assert!(done.completed_at.is_some());
        assert_eq!(done.version, 6);

        let err = manager.mark_executing("p1").unwrap_err();
        assert!(err.is_invalid_transition());
        Ok(())
    }

    #[test]
    fn test_failed_requires_reset_before_executing() -> anyhow::Result<()> {
        let (_store, manager) = setup();
        manager.register("p2")?;
        manager.mark_executing("p2")?;
        assert!(manager.mark_failed("p2", "MAX_ATTEMPTS_EXHAUSTED")?);

        let failed = manager.load_or_default("p2")?;
        assert_eq!(failed.status, PhaseStatus::Failed);
        assert_eq!(
            failed.last_failure_reason.as_deref(),
            Some("MAX_ATTEMPTS_EXHAUSTED")
        );

        let err = manager.mark_executing("p2").unwrap_err();
        assert!(matches!(
            err,
            PhaseStateError::InvalidTransition {
                from: PhaseStatus::Failed,
                to: PhaseStatus::Executing,
                ..
            }
        ));

        assert!(manager.reset_to_queued("p2")?);
        let reset = manager.load_or_default("p2")?;
        assert_eq!(reset.status, PhaseStatus::Queued);
        assert!(reset.started_at.is_none());
        assert!(reset.completed_at.is_none());
        assert_eq!(
            reset.last_failure_reason.as_deref(),
            Some("MAX_ATTEMPTS_EXHAUSTED")
        );

        assert!(manager.mark_executing("p2")?);
        Ok(())
    }

    #[test]
    fn test_skip_only_from_queued() -> anyhow::Result<()> {
        let (_store, manager) = setup();
        manager.register("p3")?;
        assert!(manager.mark_skipped("p3")?);
        assert!(manager.reset_to_queued("p3").unwrap_err().is_invalid_transition());
        Ok(())
    }

    #[test]
    fn test_validation_disabled_allows_off_table_transition() -> anyhow::Result<()> {
        let store = Arc::new(MemoryPhaseStore::new());
        let manager = PhaseStateManager::with_options(
            "run-1",
            "ws",
            "proj",
            store,
            ManagerOptions {
                validate_transitions: false,
                retry: RetryConfig::immediate(1),
                ..ManagerOptions::default()
            },
        );
        manager.register("p1")?;
        assert!(manager.mark_complete("p1")?);
        assert_eq!(manager.load_or_default("p1")?.status, PhaseStatus::Complete);
        Ok(())
    }

    #[test]
    fn test_transient_failures_are_retried() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("p1")?;
        store.inject_fault(FaultPoint::Lock, FaultKind::Transient, 2);

        assert!(manager.update("p1", StateUpdateRequest::new().increment_retry())?);
        let record = manager.load_or_default("p1")?;
        assert_eq!(record.retry_attempt, 1);
        assert_eq!(record.version, 2);
        Ok(())
    }

    #[test]
    fn test_commit_failures_never_double_apply() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("p1")?;
        store.inject_fault(FaultPoint::Commit, FaultKind::Transient, 2);

        manager.update("p1", StateUpdateRequest::new().increment_retry())?;
        assert_eq!(manager.load_or_default("p1")?.retry_attempt, 1);
        Ok(())
    }

    #[test]
    fn test_exhausted_retries_reraise_and_leave_counters() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("p1")?;
        store.inject_fault(FaultPoint::Lock, FaultKind::Transient, 3);

        let err = manager
            .update("p1", StateUpdateRequest::new().increment_retry())
            .unwrap_err();
        match &err {
            PhaseStateError::Transient { source, .. } => {
                assert!(source.to_string().contains("injected fault at Lock"));
            }
            other => panic!("Expected Transient, got {other:?}"),
        }

        let record = manager.load_or_default("p1")?;
        assert_eq!(record.retry_attempt, 0);
        assert_eq!(record.version, 1);
        Ok(())
    }

    #[test]
    fn test_load_retries_transient_reads() -> anyhow::Result<()> {
        let (store, manager) = setup();
        store.inject_fault(FaultPoint::Fetch, FaultKind::Transient, 2);
        assert_eq!(manager.load_or_default("p1")?.version, 0);

        store.inject_fault(FaultPoint::Fetch, FaultKind::Transient, 3);
        assert!(manager.load_or_default("p1").unwrap_err().is_transient());
        Ok(())
    }

    #[test]
    fn test_conflicts_are_not_retried() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("p1")?;
        store.inject_fault(FaultPoint::Commit, FaultKind::Conflict, 1);

        let err = manager.mark_executing("p1").unwrap_err();
        assert!(err.is_lock_conflict());
        assert_eq!(manager.load_or_default("p1")?.status, PhaseStatus::Queued);

        // The caller decides to re-apply; the next attempt goes through.
        assert!(manager.mark_executing("p1")?);
        Ok(())
    }

    #[test]
    fn test_stale_expected_version_conflicts() -> anyhow::Result<()> {
        let (_store, manager) = setup();
        let loaded = manager.register("p1")?;

        manager.update(
            "p1",
            StateUpdateRequest::new()
                .increment_escalation()
                .expect_version(loaded.version),
        )?;
        let err = manager
            .update(
                "p1",
                StateUpdateRequest::new()
                    .increment_escalation()
                    .expect_version(loaded.version),
            )
            .unwrap_err();
        assert!(err.is_lock_conflict());
        assert_eq!(manager.load_or_default("p1")?.escalation_level, 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_one_wins() -> anyhow::Result<()> {
        let store = Arc::new(MemoryPhaseStore::new());
        let manager = Arc::new(manager_with(store.clone()));
        let version = manager.register("p1")?.version;

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager.update(
                        "p1",
                        StateUpdateRequest::new()
                            .increment_retry()
                            .expect_version(version),
                    )
                })
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect();

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_lock_conflict()))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);

        let record = manager.load_or_default("p1")?;
        assert_eq!(record.retry_attempt, 1);
        assert_eq!(record.version, version + 1);
        Ok(())
    }

    #[test]
    fn test_list_phases_for_run() -> anyhow::Result<()> {
        let (store, manager) = setup();
        manager.register("b")?;
        manager.register("a")?;
        store.seed(PhaseRecord::queued(&PhaseKey::new("other-run", "c")));

        let ids: Vec<_> = manager
            .list_phases()?
            .into_iter()
            .map(|r| r.phase_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_is_transition_valid_passthrough() {
        let (_store, manager) = setup();
        assert!(manager.is_transition_valid(PhaseStatus::Failed, PhaseStatus::Queued));
        assert!(!manager.is_transition_valid(PhaseStatus::Failed, PhaseStatus::Executing));
    }
}
