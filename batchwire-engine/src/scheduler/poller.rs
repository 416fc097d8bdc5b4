//! Tracker loop
//!
//! Runs one cycle per poll interval. Each backend is refreshed in its own
//! task; a backend whose previous refresh is still in flight is skipped for
//! the cycle, so a hung scheduler never holds up the others. Reconciliation
//! of finished jobs also runs in background tasks, at most one per job.

use anyhow::Result;
use batchwire_core::domain::handle::BackendKind;
use batchwire_core::domain::job::JobId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::checkpoint;
use crate::engine::JobEngine;
use crate::registry::JobFilter;
use crate::service::ReconcileOutcome;

/// What one tracker cycle set in motion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Backends whose refresh was started
    pub refreshes_started: usize,
    /// Backends skipped because their last refresh had not finished
    pub refreshes_skipped: usize,
    pub marked_stale: usize,
    pub reconciliations_started: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background driver for a [`JobEngine`]
pub struct TrackerLoop {
    engine: Arc<JobEngine>,
    refreshes: Mutex<HashMap<BackendKind, JoinHandle<()>>>,
    reconciling: Arc<Mutex<HashSet<JobId>>>,
    reconcilers: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackerLoop {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self {
            engine,
            refreshes: Mutex::new(HashMap::new()),
            reconciling: Arc::new(Mutex::new(HashSet::new())),
            reconcilers: Mutex::new(Vec::new()),
        }
    }

    /// Runs cycles until the task is dropped
    pub async fn run(&self) -> Result<()> {
        let config = self.engine.config();
        info!(
            "Starting tracker loop (interval: {:?}, staleness window: {:?})",
            config.poll_interval, config.staleness_window
        );

        let mut interval = time::interval(config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.run_cycle().await {
                Ok(summary) => debug!("Tracker cycle finished: {:?}", summary),
                Err(e) => error!("Error during tracker cycle: {:#}", e),
            }
        }
    }

    /// Performs a single cycle
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        for kind in self.engine.backends().kinds() {
            if self.start_refresh(kind) {
                summary.refreshes_started += 1;
            } else {
                summary.refreshes_skipped += 1;
            }
        }

        summary.marked_stale = self.engine.sweep_stale();
        if summary.marked_stale > 0 {
            warn!(
                "{} job(s) went without status past the staleness window",
                summary.marked_stale
            );
        }

        summary.reconciliations_started = self.start_reconciliations();

        if let Some(path) = &self.engine.config().checkpoint_path {
            checkpoint::save(path, &self.engine.export_state()).await?;
        }

        Ok(summary)
    }

    /// Spawns a refresh of one backend unless the previous one still runs
    fn start_refresh(&self, kind: BackendKind) -> bool {
        let mut refreshes = lock(&self.refreshes);
        if refreshes.get(&kind).is_some_and(|task| !task.is_finished()) {
            warn!("Previous refresh of {} still in flight, skipping", kind);
            return false;
        }

        let engine = Arc::clone(&self.engine);
        let task_kind = kind.clone();
        let task = tokio::spawn(async move {
            match engine.refresh_all(&task_kind).await {
                Ok(report) => {
                    if !report.invalid.is_empty() {
                        warn!(
                            "{} observation(s) from {} were refused by the state machine",
                            report.invalid.len(),
                            task_kind
                        );
                    }
                }
                Err(e) => error!("Failed to refresh {}: {:#}", task_kind, e),
            }
        });
        refreshes.insert(kind, task);
        true
    }

    /// Spawns reconcilers for finished jobs still missing their results
    fn start_reconciliations(&self) -> usize {
        let finished = self
            .engine
            .registry()
            .list(&JobFilter::default().with_terminal(true));

        let mut reconcilers = lock(&self.reconcilers);
        reconcilers.retain(|task| !task.is_finished());

        let mut started = 0;
        for record in finished.into_iter().filter(|r| r.needs_reconciliation()) {
            if !lock(&self.reconciling).insert(record.id().clone()) {
                continue;
            }

            let engine = Arc::clone(&self.engine);
            let reconciling = Arc::clone(&self.reconciling);
            reconcilers.push(tokio::spawn(async move {
                match engine.reconcile(&record.handle).await {
                    Ok(ReconcileOutcome::Enriched { exit_code }) => {
                        debug!("Job {} reconciled with exit code {}", record.id(), exit_code)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to reconcile job {}: {}", record.id(), e),
                }
                lock(&reconciling).remove(record.id());
            }));
            started += 1;
        }
        started
    }

    /// Waits for every task started so far
    pub async fn drain(&self) {
        let refreshes: Vec<_> = lock(&self.refreshes).drain().map(|(_, task)| task).collect();
        let reconcilers: Vec<_> = lock(&self.reconcilers).drain(..).collect();

        for task in refreshes.into_iter().chain(reconcilers) {
            if let Err(e) = task.await {
                warn!("Tracker task panicked: {}", e);
            }
        }
    }

    /// Aborts every outstanding task
    pub fn shutdown(&self) {
        for (_, task) in lock(&self.refreshes).drain() {
            task.abort();
        }
        for task in lock(&self.reconcilers).drain(..) {
            task.abort();
        }
        lock(&self.reconciling).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, JobSubmissionBackend, StatusMap};
    use crate::config::EngineConfig;
    use async_trait::async_trait;
    use batchwire_core::command::ProcessingCommand;
    use batchwire_core::domain::handle::JobHandle;
    use batchwire_core::domain::job::JobSpec;
    use batchwire_core::domain::state::JobState;
    use batchwire_core::error::{CancelError, SubmissionError, TrackingError};
    use std::time::Duration;

    /// Scheduler whose status command never returns in time
    struct HungBackend;

    #[async_trait]
    impl JobSubmissionBackend for HungBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Custom("hung".to_string())
        }

        async fn submit(
            &self,
            _spec: &JobSpec,
            _command: &ProcessingCommand,
            _predecessors: &[JobHandle],
        ) -> Result<JobHandle, SubmissionError> {
            Err(SubmissionError::Rejected("not accepting jobs".to_string()))
        }

        async fn poll(&self, _handles: &[JobHandle]) -> Result<StatusMap, TrackingError> {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(StatusMap::new())
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<(), CancelError> {
            Err(CancelError::BackendRejected("hung".to_string()))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            backends: vec![BackendKind::Dummy],
            min_poll_interval: Duration::ZERO,
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(5),
            reconcile_initial_backoff: Duration::from_millis(5),
            reconcile_deadline: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    fn tracker(config: EngineConfig) -> (TrackerLoop, Arc<JobEngine>, Arc<DummyBackend>) {
        let engine = Arc::new(JobEngine::new(config));
        let dummy = Arc::new(DummyBackend::new());
        engine.register_backend(dummy.clone());
        (TrackerLoop::new(Arc::clone(&engine)), engine, dummy)
    }

    async fn submit(engine: &JobEngine, id: &str) -> JobHandle {
        engine
            .submit_job(JobSpec::new(id, "true"), ProcessingCommand::dummy(id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_refreshes_backends() {
        let (tracker, engine, dummy) = tracker(config());
        let handle = submit(&engine, "a").await;
        dummy.set_status(&handle, "RUNNING");

        let summary = tracker.run_cycle().await.unwrap();
        tracker.drain().await;

        assert_eq!(summary.refreshes_started, 1);
        assert_eq!(engine.query_state(&handle).unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_failed_job_is_reconciled_next_cycle() {
        let (tracker, engine, dummy) = tracker(config());
        let handle = submit(&engine, "a").await;
        dummy.set_status(&handle, "FAILED");

        tracker.run_cycle().await.unwrap();
        tracker.drain().await;
        assert_eq!(engine.query_state(&handle).unwrap().state, JobState::Failed);

        let summary = tracker.run_cycle().await.unwrap();
        tracker.drain().await;
        assert_eq!(summary.reconciliations_started, 1);
        assert!(engine.registry().get_by_handle(&handle).unwrap().reconciled);

        // Nothing left to reconcile
        let summary = tracker.run_cycle().await.unwrap();
        assert_eq!(summary.reconciliations_started, 0);
        tracker.drain().await;
    }

    #[tokio::test]
    async fn test_hung_backend_does_not_block_others() {
        let (tracker, engine, dummy) = tracker(config());
        engine.register_backend(Arc::new(HungBackend));
        let stuck = JobHandle::new(BackendKind::Custom("hung".to_string()), "1");
        engine
            .registry()
            .register(JobSpec::new("stuck", "true"), stuck, 0)
            .unwrap();
        let handle = submit(&engine, "a").await;

        let first = tracker.run_cycle().await.unwrap();
        assert_eq!(first.refreshes_started, 2);

        // Let the dummy refresh finish; the hung one keeps running
        time::sleep(Duration::from_millis(50)).await;
        dummy.set_status(&handle, "DONE, exit=0");

        let second = tracker.run_cycle().await.unwrap();
        assert_eq!(second.refreshes_started, 1);
        assert_eq!(second.refreshes_skipped, 1);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.query_state(&handle).unwrap().state, JobState::Completed);
        tracker.shutdown();
    }

    #[tokio::test]
    async fn test_cycle_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let (tracker, engine, _) = tracker(EngineConfig {
            checkpoint_path: Some(path.clone()),
            ..config()
        });
        submit(&engine, "a").await;

        tracker.run_cycle().await.unwrap();
        tracker.drain().await;

        let snapshot = checkpoint::load(&path).await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 1);
    }
}
