use std::sync::Arc;

use anyhow::anyhow;

use super::{PhaseStateManager, StateUpdateRequest};
use crate::errors::{PhaseStateError, StoreError};
use crate::phase::{PhaseRecord, PhaseStatus};

/// Async-safe handle to a `PhaseStateManager`.
///
/// Every manager call takes row locks and may sleep between retries, so it
/// runs on tokio's blocking thread pool via `spawn_blocking` instead of the
/// async executor.
#[derive(Clone)]
pub struct PhaseStateHandle {
    inner: Arc<PhaseStateManager>,
}

impl PhaseStateHandle {
    pub fn new(manager: PhaseStateManager) -> Self {
        Self {
            inner: Arc::new(manager),
        }
    }

    /// Borrow the manager synchronously. For startup code and tests.
    pub fn manager(&self) -> &PhaseStateManager {
        &self.inner
    }

    /// Run a closure against the manager on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, PhaseStateError>
    where
        F: FnOnce(&PhaseStateManager) -> Result<R, PhaseStateError> + Send + 'static,
        R: Send + 'static,
    {
        let manager = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| PhaseStateError::Store {
                phase_id: "*".to_string(),
                source: StoreError::Backend(anyhow!("phase state task failed: {}", e)),
            })?
    }

    pub async fn load_or_default(&self, phase_id: &str) -> Result<PhaseRecord, PhaseStateError> {
        let phase_id = phase_id.to_string();
        self.call(move |m| m.load_or_default(&phase_id)).await
    }

    pub async fn list_phases(&self) -> Result<Vec<PhaseRecord>, PhaseStateError> {
        self.call(|m| m.list_phases()).await
    }

    pub async fn register(&self, phase_id: &str) -> Result<PhaseRecord, PhaseStateError> {
        let phase_id = phase_id.to_string();
        self.call(move |m| m.register(&phase_id)).await
    }

    pub async fn update(
        &self,
        phase_id: &str,
        request: StateUpdateRequest,
    ) -> Result<bool, PhaseStateError> {
        let phase_id = phase_id.to_string();
        self.call(move |m| m.update(&phase_id, request)).await
    }

    pub async fn transition(
        &self,
        phase_id: &str,
        to: PhaseStatus,
        reason: Option<String>,
    ) -> Result<bool, PhaseStateError> {
        let phase_id = phase_id.to_string();
        self.call(move |m| m.transition(&phase_id, to, reason.as_deref()))
            .await
    }

    pub async fn mark_executing(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Executing, None).await
    }

    pub async fn mark_complete(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Complete, None).await
    }

    pub async fn mark_failed(&self, phase_id: &str, reason: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Failed, Some(reason.to_string()))
            .await
    }

    pub async fn reset_to_queued(&self, phase_id: &str) -> Result<bool, PhaseStateError> {
        self.transition(phase_id, PhaseStatus::Queued, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerOptions;
    use crate::retry::RetryConfig;
    use crate::store::MemoryPhaseStore;

    fn handle() -> PhaseStateHandle {
        let manager = PhaseStateManager::with_options(
            "run-async",
            "ws",
            "proj",
            Arc::new(MemoryPhaseStore::new()),
            ManagerOptions {
                retry: RetryConfig::immediate(3),
                ..ManagerOptions::default()
            },
        );
        PhaseStateHandle::new(manager)
    }

    #[tokio::test]
    async fn test_async_lifecycle() -> anyhow::Result<()> {
        let handle = handle();
        handle.register("p1").await?;
        assert!(handle.mark_executing("p1").await?);
        assert!(
            handle
                .update("p1", StateUpdateRequest::new().increment_retry())
                .await?
        );
        assert!(handle.mark_failed("p1", "GATE_REJECTED").await?);
        assert!(handle.reset_to_queued("p1").await?);

        let record = handle.load_or_default("p1").await?;
        assert_eq!(record.status, PhaseStatus::Queued);
        assert_eq!(record.retry_attempt, 1);
        assert_eq!(record.last_failure_reason.as_deref(), Some("GATE_REJECTED"));
        Ok(())
    }

    #[tokio::test]
    async fn test_async_errors_pass_through() -> anyhow::Result<()> {
        let handle = handle();
        handle.register("p1").await?;
        let err = handle.mark_complete("p1").await.unwrap_err();
        assert!(err.is_invalid_transition());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_handles_share_manager() -> anyhow::Result<()> {
        let handle = handle();
        let tasks: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.register(id).await })
            })
            .collect();
        for task in tasks {
            task.await??;
        }
        assert_eq!(handle.list_phases().await?.len(), 3);
        assert_eq!(handle.manager().run_id(), "run-async");
        Ok(())
    }
}
