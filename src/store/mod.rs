//! Persistence port for phase records.
//!
//! A `PhaseStore` owns the `(run_id, phase_id)` rows. Reads go through
//! `fetch`/`fetch_run` without locking. Every mutation goes through
//! `lock_row`, which hands back a `LockedRow` holding an exclusive lock on the
//! single target row:
//!
//! ```text
//! lock_row(key) ──► LockedRow::current() ──► LockedRow::commit(next)
//!        │                                          │
//!        └── dropped without commit ──► rollback    └── version + 1
//! ```
//!
//! `commit` is version-guarded: it only succeeds if the row still carries the
//! version read under the lock (or is still absent), otherwise it reports
//! `StoreError::Conflict`.

pub mod memory;
pub mod sqlite;

pub use memory::{FaultKind, FaultPoint, MemoryPhaseStore};
pub use sqlite::SqlitePhaseStore;

use crate::errors::StoreError;
use crate::phase::{PhaseKey, PhaseRecord};

/// Backing store for phase records.
pub trait PhaseStore: Send + Sync {
    /// Read one record without taking a row lock.
    fn fetch(&self, key: &PhaseKey) -> Result<Option<PhaseRecord>, StoreError>;

    /// Read every record of a run, ordered by phase id.
    fn fetch_run(&self, run_id: &str) -> Result<Vec<PhaseRecord>, StoreError>;

    /// Acquire the exclusive row lock for `key` and read the row under it.
    ///
    /// Blocks while another writer holds the same row; how long is up to the
    /// backend (e.g. the SQLite busy timeout).
    fn lock_row<'a>(&'a self, key: &PhaseKey) -> Result<Box<dyn LockedRow + 'a>, StoreError>;
}

/// An exclusive, single-row write transaction.
pub trait LockedRow {
    /// The row as read under the lock, `None` if it does not exist yet.
    fn current(&self) -> Option<&PhaseRecord>;

    /// Persist `next` and release the lock.
    ///
    /// The stored version becomes `current().version + 1` (or 1 for a new
    /// row) regardless of `next.version`. Returns the record as committed.
    fn commit(self: Box<Self>, next: PhaseRecord) -> Result<PhaseRecord, StoreError>;
}
