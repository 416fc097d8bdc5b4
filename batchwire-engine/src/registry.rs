//! Job registry
//!
//! The single authoritative, in-memory store of job records. Every other
//! component reads copies and mutates only through [`JobRegistry::update`],
//! which runs the caller's decision and the state-machine check under the
//! record's own lock so concurrent updates of one job never interleave.

use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::{JobId, JobSpec};
use batchwire_core::domain::record::{JobRecord, RecordChange};
use batchwire_core::domain::state::JobState;
use batchwire_core::dto::snapshot::RegistrySnapshot;
use batchwire_core::error::RegistryError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

/// Selection criteria for [`JobRegistry::list`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub backend: Option<BackendKind>,
    pub state: Option<JobState>,
    /// `Some(true)` keeps only terminal records, `Some(false)` only live ones
    pub terminal: Option<bool>,
}

impl JobFilter {
    pub fn backend(backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    pub fn live() -> Self {
        Self {
            terminal: Some(false),
            ..Self::default()
        }
    }

    pub fn with_terminal(mut self, terminal: bool) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    fn matches(&self, record: &JobRecord) -> bool {
        self.backend
            .as_ref()
            .is_none_or(|backend| &record.handle.backend == backend)
            && self.state.is_none_or(|state| record.state == state)
            && self
                .terminal
                .is_none_or(|terminal| record.is_terminal() == terminal)
    }
}

/// Result of a successful update
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub record: JobRecord,
    pub changed: bool,
}

#[derive(Default)]
struct Index {
    records: HashMap<JobId, Arc<Mutex<JobRecord>>>,
    handles: HashMap<JobHandle, JobId>,
}

/// Process-wide store of job records
#[derive(Default)]
pub struct JobRegistry {
    index: RwLock<Index>,
}

fn lock_record(slot: &Mutex<JobRecord>) -> MutexGuard<'_, JobRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &JobId) -> Option<Arc<Mutex<JobRecord>>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.records.get(id).cloned()
    }

    /// Registers a freshly submitted job in Pending state
    ///
    /// Fails if either the job id or the handle is already known.
    pub fn register(
        &self,
        spec: JobSpec,
        handle: JobHandle,
        retry_count: u32,
    ) -> Result<JobRecord, RegistryError> {
        self.insert(JobRecord::submitted(spec, handle, retry_count))
    }

    fn insert(&self, record: JobRecord) -> Result<JobRecord, RegistryError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        if index.records.contains_key(record.id()) {
            return Err(RegistryError::DuplicateJob(record.id().clone()));
        }
        if index.handles.contains_key(&record.handle) {
            return Err(RegistryError::DuplicateHandle(record.handle.clone()));
        }

        index
            .handles
            .insert(record.handle.clone(), record.id().clone());
        index
            .records
            .insert(record.id().clone(), Arc::new(Mutex::new(record.clone())));

        debug!("Registered job {} as {}", record.id(), record.handle);
        Ok(record)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.records.contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.slot(id).map(|slot| lock_record(&slot).clone())
    }

    pub fn get_by_handle(&self, handle: &JobHandle) -> Option<JobRecord> {
        let id = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.handles.get(handle).cloned()
        }?;
        self.get(&id)
    }

    /// Atomically reads, decides and applies a change to one record
    ///
    /// `decide` sees the current record under its lock and proposes a
    /// [`RecordChange`]; the change is validated before it is applied, and a
    /// rejected change leaves the record untouched.
    pub fn update<F>(&self, id: &JobId, decide: F) -> Result<UpdateOutcome, RegistryError>
    where
        F: FnOnce(&JobRecord) -> RecordChange,
    {
        self.update_at(id, Utc::now(), decide)
    }

    /// [`update`](Self::update) with an explicit observation time
    pub fn update_at<F>(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
        decide: F,
    ) -> Result<UpdateOutcome, RegistryError>
    where
        F: FnOnce(&JobRecord) -> RecordChange,
    {
        let slot = self
            .slot(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let mut record = lock_record(&slot);

        let previous = record.state;
        let change = decide(&record);
        let changed = record.apply(change, now)?;

        if record.state != previous {
            info!("Job {} ({}): {} -> {}", id, record.handle, previous, record.state);
        }

        Ok(UpdateOutcome {
            record: record.clone(),
            changed,
        })
    }

    /// Copies of all records matching the filter
    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let slots: Vec<Arc<Mutex<JobRecord>>> = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index.records.values().cloned().collect()
        };

        let mut records: Vec<JobRecord> = slots
            .iter()
            .map(|slot| lock_record(slot).clone())
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id().cmp(b.id())));
        records
    }

    pub fn len(&self) -> usize {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a record; the only way a record ever leaves the registry
    pub fn evict(&self, id: &JobId) -> Option<JobRecord> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let slot = index.records.remove(id)?;
        let record = lock_record(&slot).clone();
        index.handles.remove(&record.handle);

        info!("Evicted job {} ({})", id, record.handle);
        Some(record)
    }

    /// Point-in-time copy of every record
    pub fn export_state(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(self.list(&JobFilter::default()))
    }

    /// Loads records from a snapshot
    ///
    /// The whole snapshot is checked against the current contents first; if
    /// any job id or handle collides, nothing is imported.
    pub fn import_state(&self, snapshot: RegistrySnapshot) -> Result<usize, RegistryError> {
        snapshot.check_version()?;

        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);

        let mut ids = std::collections::HashSet::new();
        let mut handles = std::collections::HashSet::new();
        for record in &snapshot.records {
            if index.records.contains_key(record.id()) || !ids.insert(record.id().clone()) {
                return Err(RegistryError::DuplicateJob(record.id().clone()));
            }
            if index.handles.contains_key(&record.handle) || !handles.insert(record.handle.clone())
            {
                return Err(RegistryError::DuplicateHandle(record.handle.clone()));
            }
        }

        let count = snapshot.records.len();
        for record in snapshot.records {
            index
                .handles
                .insert(record.handle.clone(), record.id().clone());
            index
                .records
                .insert(record.id().clone(), Arc::new(Mutex::new(record)));
        }

        info!("Imported {} job record(s) from snapshot", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchwire_core::domain::job::StatusObservation;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn register(registry: &JobRegistry, id: &str, backend: BackendKind) -> JobRecord {
        registry
            .register(
                JobSpec::new(id, "true"),
                JobHandle::new(backend, format!("h-{}", id)),
                0,
            )
            .unwrap()
    }

    fn observe(state: JobState) -> impl FnOnce(&JobRecord) -> RecordChange {
        move |_| RecordChange::Observe(StatusObservation::new(state))
    }

    #[test]
    fn test_register_and_get() {
        let registry = JobRegistry::new();
        let record = register(&registry, "a", BackendKind::Slurm);

        assert_eq!(record.state, JobState::Pending);
        assert_eq!(registry.get(&JobId::new("a")), Some(record.clone()));
        assert_eq!(registry.get_by_handle(&record.handle), Some(record));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = JobRegistry::new();
        register(&registry, "a", BackendKind::Slurm);

        let dup_id = registry.register(
            JobSpec::new("a", "true"),
            JobHandle::new(BackendKind::Slurm, "other"),
            0,
        );
        assert_eq!(dup_id, Err(RegistryError::DuplicateJob(JobId::new("a"))));

        let dup_handle = registry.register(
            JobSpec::new("b", "true"),
            JobHandle::new(BackendKind::Slurm, "h-a"),
            0,
        );
        assert!(matches!(dup_handle, Err(RegistryError::DuplicateHandle(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_rejects_invalid_transition() {
        let registry = JobRegistry::new();
        register(&registry, "a", BackendKind::Pbs);
        let id = JobId::new("a");

        registry.update(&id, observe(JobState::Completed)).unwrap();
        let err = registry.update(&id, observe(JobState::Running)).unwrap_err();

        assert!(matches!(err, RegistryError::InvalidTransition(_)));
        assert_eq!(registry.get(&id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn test_update_missing_job() {
        let registry = JobRegistry::new();
        let err = registry
            .update(&JobId::new("ghost"), |_| RecordChange::NoChange)
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound(JobId::new("ghost")));
    }

    #[test]
    fn test_concurrent_updates_follow_state_machine() {
        let registry = Arc::new(JobRegistry::new());
        register(&registry, "race", BackendKind::Sge);
        let id = JobId::new("race");

        let proposals = [
            JobState::Queued,
            JobState::Running,
            JobState::Unknown,
            JobState::Completed,
            JobState::Queued,
            JobState::Failed,
            JobState::Running,
            JobState::Unknown,
        ];

        // (sequence, from, last confirmed, to) for every applied state change
        let history = Arc::new(Mutex::new(Vec::new()));
        let sequence = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let history = Arc::clone(&history);
                let sequence = Arc::clone(&sequence);
                let id = id.clone();
                thread::spawn(move || {
                    for n in 0..200 {
                        let state = proposals[(i + n) % proposals.len()];
                        let mut seen = None;
                        let result = registry.update(&id, |current| {
                            // Runs under the record lock, so the sequence orders updates
                            let seq = sequence.fetch_add(1, Ordering::SeqCst);
                            seen = Some((seq, current.state, current.last_confirmed));
                            RecordChange::Observe(StatusObservation::new(state))
                        });
                        if let (Ok(outcome), Some((seq, from, confirmed))) = (result, seen) {
                            if outcome.record.state != from {
                                let mut history = history.lock().unwrap();
                                history.push((seq, from, confirmed, outcome.record.state));
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut history = history.lock().unwrap().clone();
        history.sort_by_key(|(seq, ..)| *seq);
        assert!(!history.is_empty());

        for (_, from, confirmed, to) in &history {
            assert!(from.allows(*confirmed, *to), "{} -> {} applied", from, to);
        }

        // One unbroken path from Pending
        assert_eq!(history[0].1, JobState::Pending);
        for pair in history.windows(2) {
            assert_eq!(pair[0].3, pair[1].1);
        }

        // Confirmed states never move backwards
        let rank = |state: JobState| match state {
            JobState::Pending => 0,
            JobState::Queued => 1,
            JobState::Running => 2,
            _ => 3,
        };
        let confirmed: Vec<JobState> = history
            .iter()
            .map(|(_, _, _, to)| *to)
            .filter(|state| *state != JobState::Unknown)
            .collect();
        for pair in confirmed.windows(2) {
            assert!(rank(pair[0]) <= rank(pair[1]), "{} then {}", pair[0], pair[1]);
        }

        // Once terminal the record never leaves, whatever won the race
        let record = registry.get(&id).unwrap();
        assert!(record.is_terminal());
        assert_eq!(history.last().map(|(.., to)| *to), Some(record.state));
        assert!(registry.update(&id, observe(JobState::Running)).is_err());
    }

    #[test]
    fn test_list_filters() {
        let registry = JobRegistry::new();
        register(&registry, "a", BackendKind::Slurm);
        register(&registry, "b", BackendKind::Slurm);
        register(&registry, "c", BackendKind::Pbs);
        registry
            .update(&JobId::new("b"), observe(JobState::Completed))
            .unwrap();

        assert_eq!(registry.list(&JobFilter::default()).len(), 3);
        assert_eq!(registry.list(&JobFilter::backend(BackendKind::Slurm)).len(), 2);
        let live_slurm = registry.list(&JobFilter::backend(BackendKind::Slurm).with_terminal(false));
        assert_eq!(live_slurm.len(), 1);
        assert_eq!(live_slurm[0].id(), &JobId::new("a"));
        assert_eq!(
            registry
                .list(&JobFilter::default().with_state(JobState::Completed))
                .len(),
            1
        );
    }

    #[test]
    fn test_evict() {
        let registry = JobRegistry::new();
        let record = register(&registry, "a", BackendKind::Lsf);

        assert!(registry.evict(&JobId::new("a")).is_some());
        assert!(registry.get_by_handle(&record.handle).is_none());
        assert!(registry.evict(&JobId::new("a")).is_none());

        // Handle is free again after eviction
        register(&registry, "a", BackendKind::Lsf);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let registry = JobRegistry::new();
        register(&registry, "a", BackendKind::Slurm);
        register(&registry, "b", BackendKind::Pbs);
        registry
            .update(&JobId::new("a"), observe(JobState::Running))
            .unwrap();

        let snapshot = registry.export_state();
        let restored = JobRegistry::new();
        assert_eq!(restored.import_state(snapshot.clone()).unwrap(), 2);
        assert_eq!(restored.get(&JobId::new("a")).unwrap().state, JobState::Running);

        // A second import collides and leaves the registry unchanged
        assert!(matches!(
            restored.import_state(snapshot),
            Err(RegistryError::DuplicateJob(_))
        ));
        assert_eq!(restored.len(), 2);
    }
}
