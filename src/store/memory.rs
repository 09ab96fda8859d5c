//! In-process phase store.
//!
//! Rows live in a map behind one mutex; row locks are a set of held keys plus
//! a condvar, so two phases can be mutated concurrently while writers on the
//! same phase queue up. Faults can be injected at each storage step to
//! exercise retry and conflict handling without a real database.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use super::{LockedRow, PhaseStore};
use crate::errors::StoreError;
use crate::phase::{PhaseKey, PhaseRecord};

/// Storage step at which an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Fetch,
    Lock,
    Commit,
}

/// Category of an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Conflict,
}

impl FaultKind {
    fn into_error(self, point: FaultPoint) -> StoreError {
        match self {
            Self::Transient => StoreError::Transient(format!("injected fault at {:?}", point)),
            Self::Conflict => StoreError::Conflict(format!("injected fault at {:?}", point)),
        }
    }
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<PhaseKey, PhaseRecord>,
    locked: HashSet<PhaseKey>,
    faults: Vec<(FaultPoint, FaultKind, u32)>,
    writes: u64,
}

impl Inner {
    fn take_fault(&mut self, point: FaultPoint) -> Option<StoreError> {
        let slot = self
            .faults
            .iter_mut()
            .find(|(p, _, remaining)| *p == point && *remaining > 0)?;
        slot.2 -= 1;
        let kind = slot.1;
        self.faults.retain(|(_, _, remaining)| *remaining > 0);
        Some(kind.into_error(point))
    }
}

fn poisoned<T>(e: PoisonError<T>) -> StoreError {
    StoreError::Backend(anyhow!("memory store lock poisoned: {}", e))
}

#[derive(Default)]
pub struct MemoryPhaseStore {
    inner: Mutex<Inner>,
    released: Condvar,
    lock_timeout: Option<Duration>,
}

impl MemoryPhaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting for a held row after `timeout`, reporting a transient
    /// failure the way a database busy timeout would.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Make the next `times` operations at `point` fail with `kind`.
    pub fn inject_fault(&self, point: FaultPoint, kind: FaultKind, times: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.push((point, kind, times));
        }
    }

    /// Number of committed writes so far.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.writes).unwrap_or(0)
    }

    /// Place a record directly, bypassing locking and validation.
    ///
    /// A record with version 0 is stored as version 1.
    pub fn seed(&self, mut record: PhaseRecord) {
        record.version = record.version.max(1);
        if let Ok(mut inner) = self.inner.lock() {
            inner.rows.insert(record.key(), record);
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(poisoned)
    }

    fn release(&self, key: &PhaseKey) {
        // Clear the key even when the map is poisoned, or waiters never wake.
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.locked.remove(key);
        drop(inner);
        self.released.notify_all();
    }
}

impl PhaseStore for MemoryPhaseStore {
    fn fetch(&self, key: &PhaseKey) -> Result<Option<PhaseRecord>, StoreError> {
        let mut inner = self.lock_inner()?;
        if let Some(err) = inner.take_fault(FaultPoint::Fetch) {
            return Err(err);
        }
        Ok(inner.rows.get(key).cloned())
    }

    fn fetch_run(&self, run_id: &str) -> Result<Vec<PhaseRecord>, StoreError> {
        let mut inner = self.lock_inner()?;
        if let Some(err) = inner.take_fault(FaultPoint::Fetch) {
            return Err(err);
        }
        Ok(inner
            .rows
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    fn lock_row<'a>(&'a self, key: &PhaseKey) -> Result<Box<dyn LockedRow + 'a>, StoreError> {
        let mut inner = self.lock_inner()?;
        if let Some(err) = inner.take_fault(FaultPoint::Lock) {
            return Err(err);
        }

        let started = Instant::now();
        while inner.locked.contains(key) {
            inner = match self.lock_timeout {
                None => self.released.wait(inner).map_err(poisoned)?,
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(StoreError::Transient(format!(
                            "timed out waiting for row lock on {}",
                            key
                        )));
                    }
                    self.released
                        .wait_timeout(inner, remaining)
                        .map_err(poisoned)?
                        .0
                }
            };
        }

        inner.locked.insert(key.clone());
        let current = inner.rows.get(key).cloned();
        Ok(Box::new(MemoryLockedRow {
            store: self,
            key: key.clone(),
            current,
        }))
    }
}

struct MemoryLockedRow<'a> {
    store: &'a MemoryPhaseStore,
    key: PhaseKey,
    current: Option<PhaseRecord>,
}

impl LockedRow for MemoryLockedRow<'_> {
    fn current(&self) -> Option<&PhaseRecord> {
        self.current.as_ref()
    }

    fn commit(self: Box<Self>, mut next: PhaseRecord) -> Result<PhaseRecord, StoreError> {
        let mut inner = self.store.lock_inner()?;
        if let Some(err) = inner.take_fault(FaultPoint::Commit) {
            return Err(err);
        }

        let expected = self.current.as_ref().map(|r| r.version);
        let stored = inner.rows.get(&self.key).map(|r| r.version);
        if stored != expected {
            return Err(StoreError::Conflict(format!(
                "{} changed underneath the row lock (expected version {:?}, found {:?})",
                self.key, expected, stored
            )));
        }

        next.run_id = self.key.run_id.clone();
        next.phase_id = self.key.phase_id.clone();
        next.version = expected.unwrap_or(0) + 1;
        inner.rows.insert(self.key.clone(), next.clone());
        inner.writes += 1;
        Ok(next)
    }
}

impl Drop for MemoryLockedRow<'_> {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseStatus;
    use std::sync::Arc;

    fn key() -> PhaseKey {
        PhaseKey::new("run-1", "p1")
    }

    #[test]
    fn test_fetch_missing_is_none() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new();
        assert!(store.fetch(&key())?.is_none());
        Ok(())
    }

    #[test]
    fn test_commit_inserts_then_bumps_version() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new();

        let row = store.lock_row(&key())?;
        assert!(row.current().is_none());
        let committed = row.commit(PhaseRecord::queued(&key()))?;
        assert_eq!(committed.version, 1);

        let row = store.lock_row(&key())?;
        let mut next = row.current().cloned().unwrap();
        next.status = PhaseStatus::Executing;
        let committed = row.commit(next)?;
        assert_eq!(committed.version, 2);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.fetch(&key())?.unwrap().status, PhaseStatus::Executing);
        Ok(())
    }

    #[test]
    fn test_dropped_row_releases_lock_without_writing() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new().with_lock_timeout(Duration::from_millis(50));
        {
            let _row = store.lock_row(&key())?;
        }
        let row = store.lock_row(&key())?;
        drop(row);
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_dropped_row_releases_lock_after_poison() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new().with_lock_timeout(Duration::from_millis(50));
        let held = store.lock_row(&key())?;

        std::thread::scope(|s| {
            let crashed = s
                .spawn(|| {
                    let _guard = store.inner.lock();
                    panic!("writer crashed while holding the row map");
                })
                .join();
            assert!(crashed.is_err());
        });
        assert!(store.inner.is_poisoned());

        drop(held);
        let inner = store.inner.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(inner.locked.is_empty());
        Ok(())
    }

    #[test]
    fn test_held_row_times_out_as_transient() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new().with_lock_timeout(Duration::from_millis(20));
        let _held = store.lock_row(&key())?;
        let err = store.lock_row(&key()).err().expect("second lock should fail");
        assert!(err.is_transient());

        // Other rows are independent.
        let other = store.lock_row(&PhaseKey::new("run-1", "p2"))?;
        assert!(other.current().is_none());
        Ok(())
    }

    #[test]
    fn test_waiting_writer_sees_committed_version() -> anyhow::Result<()> {
        let store = Arc::new(MemoryPhaseStore::new());
        store.seed(PhaseRecord::queued(&key()));

        let held = store.lock_row(&key())?;
        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || -> Result<u64, StoreError> {
                let row = store.lock_row(&key())?;
                Ok(row.current().map(|r| r.version).unwrap_or(0))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        let mut next = held.current().cloned().unwrap();
        next.retry_attempt = 1;
        held.commit(next)?;

        let seen = waiter.join().expect("waiter panicked")?;
        assert_eq!(seen, 2);
        Ok(())
    }

    #[test]
    fn test_injected_faults_fire_once_per_count() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new();
        store.inject_fault(FaultPoint::Fetch, FaultKind::Transient, 2);

        assert!(store.fetch(&key()).unwrap_err().is_transient());
        assert!(store.fetch(&key()).unwrap_err().is_transient());
        assert!(store.fetch(&key())?.is_none());
        Ok(())
    }

    #[test]
    fn test_commit_fault_leaves_row_untouched() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new();
        store.inject_fault(FaultPoint::Commit, FaultKind::Conflict, 1);

        let row = store.lock_row(&key())?;
        let err = row.commit(PhaseRecord::queued(&key())).unwrap_err();
        assert!(err.is_conflict());
        assert!(store.fetch(&key())?.is_none());
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn test_fetch_run_filters_by_run() -> anyhow::Result<()> {
        let store = MemoryPhaseStore::new();
        store.seed(PhaseRecord::queued(&PhaseKey::new("run-1", "b")));
        store.seed(PhaseRecord::queued(&PhaseKey::new("run-1", "a")));
        store.seed(PhaseRecord::queued(&PhaseKey::new("run-2", "a")));

        let ids: Vec<_> = store
            .fetch_run("run-1")?
            .into_iter()
            .map(|r| r.phase_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }
}
