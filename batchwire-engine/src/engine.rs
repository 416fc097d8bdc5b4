//! Job engine
//!
//! The facade a workflow engine talks to. It owns the registry and the
//! backend table and wires the submission, tracking and reconciliation
//! services together.

use anyhow::Result;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobSpec, StatusObservation};
use batchwire_core::domain::record::{JobRecord, RecordChange};
use batchwire_core::domain::state::JobState;
use batchwire_core::dto::snapshot::RegistrySnapshot;
use batchwire_core::error::{CancelError, RegistryError, SubmissionError, TrackingError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::cluster::{LsfDialect, PbsDialect, SgeDialect, SlurmDialect};
use crate::backend::{BackendRegistry, ClusterBackend, DirectBackend, JobSubmissionBackend};
use crate::config::EngineConfig;
use crate::process::CommandExecutor;
use crate::registry::JobRegistry;
use crate::service::{
    ArtifactSource, FileArtifactSource, ReconcileOutcome, ReconciliationService, RefreshReport,
    RetryPolicy, StandardReconciliationService, StandardSubmissionService,
    StandardTrackingService, SubmissionService, TrackingService,
};

/// What the engine knows about a job's state
///
/// Distinguishes "Running" from "Unknown since T, last confirmed Running".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub handle: JobHandle,
    pub state: JobState,
    pub last_confirmed: JobState,
    pub last_observed_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

impl From<&JobRecord> for StateReport {
    fn from(record: &JobRecord) -> Self {
        Self {
            handle: record.handle.clone(),
            state: record.state,
            last_confirmed: record.last_confirmed,
            last_observed_at: record.last_observed_at,
            exit_code: record.exit_code,
        }
    }
}

impl fmt::Display for StateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.state == JobState::Unknown {
            write!(
                f,
                "{}: Unknown since {}, last confirmed {}",
                self.handle,
                self.last_observed_at.to_rfc3339(),
                self.last_confirmed
            )
        } else {
            write!(f, "{}: {}", self.handle, self.state)?;
            if let Some(code) = self.exit_code {
                write!(f, " (exit {})", code)?;
            }
            Ok(())
        }
    }
}

/// Builds the backend for one configured kind
pub fn build_backend(
    kind: &BackendKind,
    config: &EngineConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Arc<dyn JobSubmissionBackend>> {
    let timeout = config.call_timeout;
    let backend: Arc<dyn JobSubmissionBackend> = match kind {
        BackendKind::Pbs => Arc::new(ClusterBackend::new(PbsDialect, executor, timeout)),
        BackendKind::Sge => Arc::new(ClusterBackend::new(SgeDialect, executor, timeout)),
        BackendKind::Lsf => Arc::new(ClusterBackend::new(LsfDialect, executor, timeout)),
        BackendKind::Slurm => Arc::new(ClusterBackend::new(SlurmDialect, executor, timeout)),
        BackendKind::Direct => Arc::new(DirectBackend::new(executor, config.direct_job_timeout)),
        #[cfg(any(test, feature = "dummy"))]
        BackendKind::Dummy => Arc::new(crate::backend::DummyBackend::new()),
        #[cfg(not(any(test, feature = "dummy")))]
        BackendKind::Dummy => {
            anyhow::bail!("the dummy backend requires the `dummy` feature")
        }
        BackendKind::Custom(name) => {
            anyhow::bail!("backend '{}' must be registered programmatically", name)
        }
    };
    Ok(backend)
}

/// Job submission and monitoring engine
pub struct JobEngine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    backends: Arc<BackendRegistry>,
    submission: Arc<dyn SubmissionService>,
    tracking: Arc<dyn TrackingService>,
    reconciliation: Arc<dyn ReconciliationService>,
    cancel_policy: RetryPolicy,
}

impl JobEngine {
    /// Creates an engine with an empty backend table, reading artifacts from
    /// the job log directories
    pub fn new(config: EngineConfig) -> Self {
        Self::with_artifact_source(config, Arc::new(FileArtifactSource::default()))
    }

    pub fn with_artifact_source(config: EngineConfig, artifacts: Arc<dyn ArtifactSource>) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let backends = Arc::new(BackendRegistry::new(
            config.max_concurrent_calls,
            config.min_poll_interval,
        ));
        let policy = RetryPolicy::from_config(&config);

        let submission = Arc::new(StandardSubmissionService::new(
            Arc::clone(&registry),
            Arc::clone(&backends),
            policy,
        ));
        let tracking = Arc::new(StandardTrackingService::new(
            Arc::clone(&registry),
            Arc::clone(&backends),
            config.staleness_window,
        ));
        let reconciliation = Arc::new(StandardReconciliationService::new(
            Arc::clone(&registry),
            artifacts,
            config.reconcile_deadline,
            config.reconcile_initial_backoff,
            config.retry_max_backoff,
        ));

        Self {
            config,
            registry,
            backends,
            submission,
            tracking,
            reconciliation,
            cancel_policy: policy,
        }
    }

    /// Creates an engine with every backend named in the configuration
    pub fn from_config(config: EngineConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        config.validate()?;

        let engine = Self::new(config);
        for kind in &engine.config.backends {
            let backend = build_backend(kind, &engine.config, Arc::clone(&executor))?;
            engine.register_backend(backend);
        }
        Ok(engine)
    }

    /// Adds or replaces a backend at runtime
    pub fn register_backend(&self, backend: Arc<dyn JobSubmissionBackend>) {
        self.backends.register(backend);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// Submits a job and starts tracking it as Pending
    pub async fn submit_job(
        &self,
        spec: JobSpec,
        command: ProcessingCommand,
    ) -> Result<JobHandle, SubmissionError> {
        self.submission.submit(spec, command).await
    }

    /// Current knowledge about a job, without contacting its backend
    pub fn query_state(&self, handle: &JobHandle) -> Result<StateReport, TrackingError> {
        self.registry
            .get_by_handle(handle)
            .map(|record| StateReport::from(&record))
            .ok_or_else(|| TrackingError::NotTracked(handle.clone()))
    }

    pub async fn refresh(&self, handle: &JobHandle) -> Result<JobState, TrackingError> {
        self.tracking.refresh(handle).await
    }

    pub async fn refresh_all(&self, kind: &BackendKind) -> Result<RefreshReport, TrackingError> {
        self.tracking.refresh_all(kind).await
    }

    /// Marks jobs without fresh status past the staleness window Unknown
    pub fn sweep_stale(&self) -> usize {
        self.tracking.sweep_stale(Utc::now())
    }

    /// Cancels a live job
    ///
    /// The record becomes Aborted only once the backend accepted the
    /// cancellation. A job that reached another terminal state first yields
    /// `AlreadyTerminal` and keeps its state.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let record = self
            .registry
            .get_by_handle(handle)
            .ok_or_else(|| CancelError::NotTracked(handle.clone()))?;

        if record.is_terminal() {
            return Err(CancelError::AlreadyTerminal(handle.clone()));
        }

        let entry = self.backends.get(&handle.backend).ok_or_else(|| {
            CancelError::BackendRejected(format!("no backend registered for {}", handle.backend))
        })?;

        let what = format!("Cancellation of {}", handle);
        let result = self
            .cancel_policy
            .run(&what, CancelError::is_retryable, || {
                entry.gate.run(entry.backend.cancel(handle))
            })
            .await;

        match result {
            Ok(_) => {}
            Err(CancelError::BackendRejected(reason)) => {
                // Schedulers refuse to cancel jobs that just finished
                return match self.tracking.refresh(handle).await {
                    Ok(state) if state.is_terminal() => {
                        Err(CancelError::AlreadyTerminal(handle.clone()))
                    }
                    _ => Err(CancelError::BackendRejected(reason)),
                };
            }
            Err(e) => return Err(e),
        }

        let aborted = RecordChange::Observe(StatusObservation::new(JobState::Aborted));
        match self.registry.update(record.id(), |_| aborted) {
            Ok(_) => {
                info!("Job {} ({}) cancelled", record.id(), handle);
                Ok(())
            }
            Err(RegistryError::InvalidTransition(e)) => {
                warn!("Job {} finished before cancellation took effect: {}", handle, e);
                Err(CancelError::AlreadyTerminal(handle.clone()))
            }
            Err(_) => Err(CancelError::NotTracked(handle.clone())),
        }
    }

    /// Merges late exit-code artifacts into a terminal job
    pub async fn reconcile(&self, handle: &JobHandle) -> Result<ReconcileOutcome, RegistryError> {
        let record = self
            .registry
            .get_by_handle(handle)
            .ok_or_else(|| RegistryError::UnknownHandle(handle.clone()))?;
        self.reconciliation.reconcile(record.id()).await
    }

    /// Stops tracking a job
    pub fn evict(&self, handle: &JobHandle) -> Option<JobRecord> {
        let record = self.registry.get_by_handle(handle)?;
        if let Some(entry) = self.backends.get(&handle.backend) {
            entry.backend.release(handle);
        }
        self.registry.evict(record.id())
    }

    pub fn export_state(&self) -> RegistrySnapshot {
        self.registry.export_state()
    }

    pub fn import_state(&self, snapshot: RegistrySnapshot) -> Result<usize, RegistryError> {
        self.registry.import_state(snapshot)
    }
}
