//! Backend layer
//!
//! A backend is one scheduler integration. It performs single attempts only:
//! retries, registry bookkeeping and state validation live in the services.
//!
//! Backends are trait objects so new schedulers can be registered at
//! runtime under [`BackendKind::Custom`] without touching the state machine.

pub mod cluster;
pub mod direct;
#[cfg(any(test, feature = "dummy"))]
pub mod dummy;
mod gate;

pub use cluster::ClusterBackend;
pub use direct::DirectBackend;
#[cfg(any(test, feature = "dummy"))]
pub use dummy::DummyBackend;
pub use gate::CallGate;

use async_trait::async_trait;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobSpec, StatusObservation};
use batchwire_core::domain::record::JobRecord;
use batchwire_core::error::{CancelError, SubmissionError, TrackingError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::info;

/// Status reports keyed by backend job id
pub type StatusMap = HashMap<String, StatusObservation>;

/// Uniform interface over every scheduler integration
#[async_trait]
pub trait JobSubmissionBackend: Send + Sync {
    /// Kind of handles this backend issues
    fn kind(&self) -> BackendKind;

    /// Submits one job, exactly once
    ///
    /// # Arguments
    /// * `spec` - The validated job description
    /// * `command` - Processing command targeting this backend
    /// * `predecessors` - Handles the job must wait for
    async fn submit(
        &self,
        spec: &JobSpec,
        command: &ProcessingCommand,
        predecessors: &[JobHandle],
    ) -> Result<JobHandle, SubmissionError>;

    /// Fetches the status of several jobs in one call
    ///
    /// Jobs the backend does not report are absent from the result.
    async fn poll(&self, handles: &[JobHandle]) -> Result<StatusMap, TrackingError>;

    /// Fetches the status of tracked jobs
    ///
    /// Polls by handle unless the backend can also recover status from the
    /// job description.
    async fn poll_records(&self, records: &[JobRecord]) -> Result<StatusMap, TrackingError> {
        let handles: Vec<JobHandle> = records.iter().map(|r| r.handle.clone()).collect();
        self.poll(&handles).await
    }

    /// Drops whatever the backend keeps for a job that is no longer tracked
    fn release(&self, _handle: &JobHandle) {}

    /// Asks the backend to stop a job
    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError>;

    /// Verifies the backend's tools are reachable
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Rejects a processing command aimed at a different backend
pub(crate) fn ensure_command_matches(
    kind: &BackendKind,
    command: &ProcessingCommand,
) -> Result<(), SubmissionError> {
    let target = command.backend_kind();
    if &target != kind {
        return Err(SubmissionError::Rejected(format!(
            "command '{}' targets {} but was sent to {}",
            command, target, kind
        )));
    }
    Ok(())
}

/// A registered backend together with its call gate
#[derive(Clone)]
pub struct BackendEntry {
    pub backend: Arc<dyn JobSubmissionBackend>,
    pub gate: Arc<CallGate>,
}

/// Extension table mapping backend kinds to live backends
pub struct BackendRegistry {
    entries: RwLock<HashMap<BackendKind, BackendEntry>>,
    max_concurrent_calls: usize,
    min_poll_interval: Duration,
}

impl BackendRegistry {
    /// Creates an empty table; every backend registered later gets its own
    /// gate with these limits
    pub fn new(max_concurrent_calls: usize, min_poll_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_concurrent_calls,
            min_poll_interval,
        }
    }

    /// Registers a backend under its own kind, replacing any previous one
    pub fn register(&self, backend: Arc<dyn JobSubmissionBackend>) {
        let kind = backend.kind();
        let entry = BackendEntry {
            backend,
            gate: Arc::new(CallGate::new(
                self.max_concurrent_calls,
                self.min_poll_interval,
            )),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.insert(kind.clone(), entry).is_some() {
            info!("Replaced backend {}", kind);
        } else {
            info!("Registered backend {}", kind);
        }
    }

    pub fn get(&self, kind: &BackendKind) -> Option<BackendEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(kind).cloned()
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<BackendKind> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<BackendKind> = entries.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = BackendRegistry::new(2, Duration::ZERO);
        assert!(registry.get(&BackendKind::Dummy).is_none());

        registry.register(Arc::new(DummyBackend::new()));

        let entry = registry.get(&BackendKind::Dummy).unwrap();
        assert_eq!(entry.backend.kind(), BackendKind::Dummy);
        assert_eq!(entry.gate.available_permits(), 2);
        assert_eq!(registry.kinds(), vec![BackendKind::Dummy]);
    }

    #[test]
    fn test_command_mismatch_rejected() {
        let result = ensure_command_matches(&BackendKind::Slurm, &ProcessingCommand::pbs());
        assert!(matches!(result, Err(SubmissionError::Rejected(_))));
        assert!(ensure_command_matches(&BackendKind::Slurm, &ProcessingCommand::slurm()).is_ok());
    }
}
