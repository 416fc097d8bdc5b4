//! Submission service
//!
//! Turns a job spec into a registered job:
//! - Validating the spec and refusing job ids already submitted or in flight
//! - Resolving predecessors to handles on the same backend
//! - Retrying transient backend failures with backoff
//! - Registering the acknowledged job as Pending

use async_trait::async_trait;
use batchwire_core::command::ProcessingCommand;
use batchwire_core::domain::handle::JobHandle;
use batchwire_core::domain::job::{JobId, JobSpec};
use batchwire_core::domain::state::JobState;
use batchwire_core::error::{RegistryError, SubmissionError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

use crate::backend::BackendRegistry;
use crate::registry::JobRegistry;
use crate::service::retry::RetryPolicy;

/// Service trait for submitting jobs
#[async_trait]
pub trait SubmissionService: Send + Sync {
    /// Submits a job and registers it
    ///
    /// # Arguments
    /// * `spec` - Backend-agnostic job description
    /// * `command` - Processing command selecting and configuring the backend
    ///
    /// # Returns
    /// The handle the backend assigned
    async fn submit(
        &self,
        spec: JobSpec,
        command: ProcessingCommand,
    ) -> Result<JobHandle, SubmissionError>;
}

/// Standard implementation of SubmissionService
pub struct StandardSubmissionService {
    registry: Arc<JobRegistry>,
    backends: Arc<BackendRegistry>,
    policy: RetryPolicy,
    in_flight: Mutex<HashSet<JobId>>,
}

/// Releases an in-flight reservation when the submission ends, however it ends
struct Reservation<'a> {
    in_flight: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.remove(&self.id);
    }
}

impl StandardSubmissionService {
    pub fn new(
        registry: Arc<JobRegistry>,
        backends: Arc<BackendRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            backends,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn reserve(&self, id: &JobId) -> Result<Reservation<'_>, SubmissionError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if self.registry.contains(id) || !in_flight.insert(id.clone()) {
            return Err(SubmissionError::AlreadySubmitted(id.clone()));
        }
        Ok(Reservation {
            in_flight: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Maps the spec's predecessor ids to handles on the job's own backend
    fn resolve_predecessors(
        &self,
        spec: &JobSpec,
        command: &ProcessingCommand,
    ) -> Result<Vec<JobHandle>, SubmissionError> {
        let kind = command.backend_kind();

        spec.dependencies
            .iter()
            .map(|dep| {
                let record = self.registry.get(dep).ok_or_else(|| {
                    SubmissionError::Rejected(format!("unknown predecessor {}", dep))
                })?;

                if record.handle.backend != kind {
                    return Err(SubmissionError::Rejected(format!(
                        "predecessor {} runs on {}, not {}",
                        dep, record.handle.backend, kind
                    )));
                }
                if record.is_terminal() && record.state != JobState::Completed {
                    return Err(SubmissionError::Rejected(format!(
                        "predecessor {} ended {}",
                        dep, record.state
                    )));
                }

                Ok(record.handle)
            })
            .collect()
    }
}

#[async_trait]
impl SubmissionService for StandardSubmissionService {
    async fn submit(
        &self,
        spec: JobSpec,
        command: ProcessingCommand,
    ) -> Result<JobHandle, SubmissionError> {
        spec.validate()?;
        let _reservation = self.reserve(&spec.id)?;

        let kind = command.backend_kind();
        let entry = self
            .backends
            .get(&kind)
            .ok_or_else(|| SubmissionError::NoBackend(kind.clone()))?;
        let predecessors = self.resolve_predecessors(&spec, &command)?;

        let what = format!("Submission of job {} to {}", spec.id, kind);
        let (handle, retries) = self
            .policy
            .run(&what, SubmissionError::is_retryable, || {
                entry
                    .gate
                    .run(entry.backend.submit(&spec, &command, &predecessors))
            })
            .await?;

        let id = spec.id.clone();
        match self.registry.register(spec, handle.clone(), retries) {
            Ok(_) => {
                info!(
                    "Job {} submitted as {} ({} retries, command {})",
                    id, handle, retries, command
                );
                Ok(handle)
            }
            Err(e) => {
                error!("Failed to register job {} as {}: {}", id, handle, e);
                // The scheduler holds a job nothing tracks; take it back
                let cancelled = entry.gate.run(entry.backend.cancel(&handle)).await;
                match (e, cancelled) {
                    (RegistryError::DuplicateJob(id), Ok(())) => {
                        Err(SubmissionError::AlreadySubmitted(id))
                    }
                    (e, Ok(())) => Err(SubmissionError::Rejected(format!(
                        "{}; untracked job {} was cancelled",
                        e, handle
                    ))),
                    (e, Err(cancel_err)) => {
                        error!("Untracked job {} is still live: {}", handle, cancel_err);
                        Err(SubmissionError::Rejected(format!(
                            "{}; untracked job {} could not be cancelled: {}",
                            e, handle, cancel_err
                        )))
                    }
                }
            }
        }
    }
}
