pub mod config;
pub mod errors;
pub mod init;
pub mod manager;
pub mod phase;
pub mod retry;
pub mod store;
pub mod transitions;

pub use errors::{PhaseStateError, StoreError};
pub use manager::{ManagerOptions, PhaseStateHandle, PhaseStateManager, StateUpdateRequest};
pub use phase::{PhaseKey, PhaseRecord, PhaseStatus};
pub use store::{MemoryPhaseStore, PhaseStore, SqlitePhaseStore};
