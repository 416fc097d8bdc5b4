//! Reconciliation service
//!
//! Schedulers often report a job finished before its exit code reaches the
//! shared filesystem. For terminal records without an exit code, the
//! reconciler keeps looking for the `<id>.exitcode` artifact with backoff
//! until a deadline, then either enriches the record or gives up on it.
//! The terminal state itself is never changed.

use async_trait::async_trait;
use batchwire_core::domain::job::JobId;
use batchwire_core::domain::record::{JobRecord, RecordChange};
use batchwire_core::error::RegistryError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::JobRegistry;

/// Lines of stdout kept as the log summary
const SUMMARY_LINES: usize = 20;

/// Where late job results are read from
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Exit code of a finished job, `None` while not (completely) written
    async fn exit_code(&self, record: &JobRecord) -> Option<i32>;

    /// Short excerpt of the job's output
    async fn log_summary(&self, record: &JobRecord) -> Option<String>;
}

/// Reads artifacts from the job's log directory
#[derive(Debug, Clone)]
pub struct FileArtifactSource {
    summary_lines: usize,
}

impl Default for FileArtifactSource {
    fn default() -> Self {
        Self {
            summary_lines: SUMMARY_LINES,
        }
    }
}

impl FileArtifactSource {
    pub fn new(summary_lines: usize) -> Self {
        Self { summary_lines }
    }
}

async fn read_optional(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

#[async_trait]
impl ArtifactSource for FileArtifactSource {
    async fn exit_code(&self, record: &JobRecord) -> Option<i32> {
        let path = record.spec.exit_code_path()?;
        let contents = read_optional(&path).await?;
        contents.trim().parse().ok()
    }

    async fn log_summary(&self, record: &JobRecord) -> Option<String> {
        let path = record.spec.stdout_path()?;
        let contents = read_optional(&path).await?;

        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(self.summary_lines);
        let tail = lines[start..].join("\n");
        if tail.trim().is_empty() { None } else { Some(tail) }
    }
}

/// What a reconciliation run did to a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Exit code found and recorded
    Enriched { exit_code: i32 },
    /// Deadline passed without an artifact; exit code stays unknown
    Expired,
    /// Record already had its exit code or was reconciled before
    Skipped,
}

/// Service trait for merging late execution results
#[async_trait]
pub trait ReconciliationService: Send + Sync {
    /// Reconciles one terminal job
    ///
    /// Fails with `NotTerminal` for jobs that are still live.
    async fn reconcile(&self, id: &JobId) -> Result<ReconcileOutcome, RegistryError>;
}

/// Standard implementation of ReconciliationService
pub struct StandardReconciliationService {
    registry: Arc<JobRegistry>,
    source: Arc<dyn ArtifactSource>,
    deadline: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl StandardReconciliationService {
    pub fn new(
        registry: Arc<JobRegistry>,
        source: Arc<dyn ArtifactSource>,
        deadline: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            registry,
            source,
            deadline,
            initial_backoff,
            max_backoff,
        }
    }
}

#[async_trait]
impl ReconciliationService for StandardReconciliationService {
    async fn reconcile(&self, id: &JobId) -> Result<ReconcileOutcome, RegistryError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if !record.is_terminal() {
            return Err(RegistryError::NotTerminal(id.clone()));
        }
        if !record.needs_reconciliation() {
            return Ok(ReconcileOutcome::Skipped);
        }

        let started = Instant::now();
        let mut delay = self.initial_backoff;

        loop {
            if let Some(exit_code) = self.source.exit_code(&record).await {
                let log_summary = self.source.log_summary(&record).await;
                self.registry.update(id, |_| RecordChange::Enrich {
                    exit_code: Some(exit_code),
                    log_summary,
                })?;
                info!("Reconciled job {}: exit code {}", id, exit_code);
                return Ok(ReconcileOutcome::Enriched { exit_code });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                break;
            }

            let wait = delay.min(self.deadline - elapsed);
            debug!("No exit code for job {} yet, retrying in {:?}", id, wait);
            tokio::time::sleep(wait).await;
            delay = delay.saturating_mul(2).min(self.max_backoff);
        }

        self.registry.update(id, |_| RecordChange::ReconcileExpired)?;
        warn!(
            "Gave up reconciling job {} after {:?}; exit code unknown",
            id, self.deadline
        );
        Ok(ReconcileOutcome::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchwire_core::domain::handle::{BackendKind, JobHandle};
    use batchwire_core::domain::job::{JobSpec, StatusObservation};
    use batchwire_core::domain::state::JobState;

    fn service(registry: Arc<JobRegistry>, deadline: Duration) -> StandardReconciliationService {
        StandardReconciliationService::new(
            registry,
            Arc::new(FileArtifactSource::default()),
            deadline,
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
    }

    fn finished_job(registry: &JobRegistry, log_dir: &Path, state: JobState) -> JobId {
        let spec = JobSpec::new("j1", "true").with_log_dir(log_dir);
        registry
            .register(spec, JobHandle::new(BackendKind::Pbs, "1.srv"), 0)
            .unwrap();
        let id = JobId::new("j1");
        registry
            .update(&id, |_| RecordChange::Observe(StatusObservation::new(state)))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_enriches_from_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = finished_job(&registry, dir.path(), JobState::Failed);
        std::fs::write(dir.path().join("j1.exitcode"), "7\n").unwrap();
        std::fs::write(dir.path().join("j1.out"), "step 1\nstep 2\nboom\n").unwrap();

        let outcome = service(registry.clone(), Duration::from_secs(1))
            .reconcile(&id)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Enriched { exit_code: 7 });
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.exit_code, Some(7));
        assert_eq!(record.log_summary.as_deref(), Some("step 1\nstep 2\nboom"));
        assert!(record.reconciled);
    }

    #[tokio::test]
    async fn test_waits_for_late_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = finished_job(&registry, dir.path(), JobState::Completed);

        let path = dir.path().join("j1.exitcode");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tokio::fs::write(path, "0\n").await.unwrap();
        });

        let outcome = service(registry.clone(), Duration::from_secs(5))
            .reconcile(&id)
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Enriched { exit_code: 0 });
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = finished_job(&registry, dir.path(), JobState::Completed);

        let outcome = service(registry.clone(), Duration::from_millis(50))
            .reconcile(&id)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Expired);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.exit_code, None);
        assert!(record.reconciled);

        // Nothing left to do the second time around
        assert_eq!(
            service(registry, Duration::from_millis(50))
                .reconcile(&id)
                .await
                .unwrap(),
            ReconcileOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_live_job_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = finished_job(&registry, dir.path(), JobState::Running);

        assert_eq!(
            service(registry, Duration::from_millis(10)).reconcile(&id).await,
            Err(RegistryError::NotTerminal(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_partial_exit_code_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = finished_job(&registry, dir.path(), JobState::Completed);
        std::fs::write(dir.path().join("j1.exitcode"), "").unwrap();

        let record = registry.get(&id).unwrap();
        assert_eq!(FileArtifactSource::new(5).exit_code(&record).await, None);
    }
}
