//! Tracking service
//!
//! Polls backends and folds their answers into the registry. Source
//! failures never escape as errors: affected jobs become Unknown and keep
//! their last confirmed state. Jobs a backend stops reporting keep their
//! state until the staleness window runs out.

use async_trait::async_trait;
use batchwire_core::domain::handle::{BackendKind, JobHandle};
use batchwire_core::domain::job::StatusObservation;
use batchwire_core::domain::record::{JobRecord, RecordChange};
use batchwire_core::domain::state::JobState;
use batchwire_core::error::{InvalidTransition, RegistryError, TrackingError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, StatusMap};
use crate::registry::{JobFilter, JobRegistry};

/// Outcome of one bulk refresh of a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Live records included in the poll
    pub polled: usize,
    /// Records whose state or exit code changed
    pub updated: usize,
    /// Records the backend did not mention
    pub unreported: usize,
    pub marked_unknown: usize,
    /// Observations refused by the state machine
    pub invalid: Vec<InvalidTransition>,
    /// Set when the status source failed and the poll was absorbed
    pub source_error: Option<TrackingError>,
}

/// Service trait for tracking job state
#[async_trait]
pub trait TrackingService: Send + Sync {
    /// Refreshes one job; terminal jobs are answered without a backend call
    async fn refresh(&self, handle: &JobHandle) -> Result<JobState, TrackingError>;

    /// Refreshes every live job of one backend with a single poll
    async fn refresh_all(&self, kind: &BackendKind) -> Result<RefreshReport, TrackingError>;

    /// Marks live jobs without fresh status past the staleness window Unknown
    ///
    /// # Returns
    /// How many records were marked
    fn sweep_stale(&self, now: DateTime<Utc>) -> usize;
}

/// Standard implementation of TrackingService
pub struct StandardTrackingService {
    registry: Arc<JobRegistry>,
    backends: Arc<BackendRegistry>,
    staleness_window: Duration,
}

enum Applied {
    Changed,
    Unchanged,
    Unknown,
}

impl StandardTrackingService {
    pub fn new(
        registry: Arc<JobRegistry>,
        backends: Arc<BackendRegistry>,
        staleness_window: Duration,
    ) -> Self {
        Self {
            registry,
            backends,
            staleness_window,
        }
    }

    fn is_stale(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_observed_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.staleness_window)
    }

    async fn poll(&self, kind: &BackendKind, records: &[JobRecord]) -> Result<StatusMap, TrackingError> {
        let entry = self
            .backends
            .get(kind)
            .ok_or_else(|| TrackingError::NoBackend(kind.clone()))?;
        entry.gate.run_poll(entry.backend.poll_records(records)).await
    }

    fn mark_unknown(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<bool, TrackingError> {
        self.apply(record, now, |_| RecordChange::MarkUnknown)
            .map(|applied| matches!(applied, Applied::Unknown))
    }

    /// Applies the backend's verdict, or the staleness rule when it had none
    fn apply_observation(
        &self,
        record: &JobRecord,
        observation: Option<StatusObservation>,
        now: DateTime<Utc>,
    ) -> Result<Applied, TrackingError> {
        match observation {
            Some(observation) => self.apply(record, now, |_| RecordChange::Observe(observation)),
            None => self.apply(record, now, |current| {
                if !current.is_terminal() && self.is_stale(current, now) {
                    RecordChange::MarkUnknown
                } else {
                    RecordChange::NoChange
                }
            }),
        }
    }

    fn apply<F>(&self, record: &JobRecord, now: DateTime<Utc>, decide: F) -> Result<Applied, TrackingError>
    where
        F: FnOnce(&JobRecord) -> RecordChange,
    {
        match self.registry.update_at(record.id(), now, decide) {
            Ok(outcome) if !outcome.changed => Ok(Applied::Unchanged),
            Ok(outcome) if outcome.record.state == JobState::Unknown => Ok(Applied::Unknown),
            Ok(_) => Ok(Applied::Changed),
            Err(RegistryError::InvalidTransition(e)) => {
                error!("Rejected observation for {}: {}", record.handle, e);
                Err(TrackingError::InvalidTransition(e))
            }
            Err(e) => {
                debug!("Record {} vanished during refresh: {}", record.handle, e);
                Err(TrackingError::NotTracked(record.handle.clone()))
            }
        }
    }

    fn current_state(&self, handle: &JobHandle) -> Result<JobState, TrackingError> {
        self.registry
            .get_by_handle(handle)
            .map(|record| record.state)
            .ok_or_else(|| TrackingError::NotTracked(handle.clone()))
    }
}

#[async_trait]
impl TrackingService for StandardTrackingService {
    async fn refresh(&self, handle: &JobHandle) -> Result<JobState, TrackingError> {
        let record = self
            .registry
            .get_by_handle(handle)
            .ok_or_else(|| TrackingError::NotTracked(handle.clone()))?;

        if record.is_terminal() {
            return Ok(record.state);
        }

        let result = self.poll(&handle.backend, std::slice::from_ref(&record)).await;
        let now = Utc::now();

        match result {
            Ok(mut map) => {
                self.apply_observation(&record, map.remove(&handle.id), now)?;
            }
            Err(e @ (TrackingError::SourceUnavailable(_) | TrackingError::MalformedResponse(_))) => {
                warn!("Status of {} unavailable: {}", handle, e);
                self.mark_unknown(&record, now)?;
            }
            Err(e) => return Err(e),
        }

        self.current_state(handle)
    }

    async fn refresh_all(&self, kind: &BackendKind) -> Result<RefreshReport, TrackingError> {
        let records = self
            .registry
            .list(&JobFilter::backend(kind.clone()).with_terminal(false));

        let mut report = RefreshReport {
            polled: records.len(),
            ..RefreshReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let result = self.poll(kind, &records).await;
        let now = Utc::now();

        let mut map = match result {
            Ok(map) => map,
            Err(e @ (TrackingError::SourceUnavailable(_) | TrackingError::MalformedResponse(_))) => {
                warn!("Polling {} failed, marking {} job(s) Unknown: {}", kind, records.len(), e);
                for record in &records {
                    if let Ok(true) = self.mark_unknown(record, now) {
                        report.marked_unknown += 1;
                    }
                }
                report.source_error = Some(e);
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        for record in &records {
            let observation = map.remove(&record.handle.id);
            if observation.is_none() {
                report.unreported += 1;
            }

            match self.apply_observation(record, observation, now) {
                Ok(Applied::Changed) => report.updated += 1,
                Ok(Applied::Unknown) => report.marked_unknown += 1,
                Ok(Applied::Unchanged) => {}
                Err(TrackingError::InvalidTransition(e)) => report.invalid.push(e),
                Err(_) => {}
            }
        }

        if report.updated > 0 || report.marked_unknown > 0 {
            info!(
                "Refreshed {}: {} polled, {} updated, {} unknown",
                kind, report.polled, report.updated, report.marked_unknown
            );
        }
        Ok(report)
    }

    fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let mut marked = 0;

        for record in self.registry.list(&JobFilter::live()) {
            if record.state == JobState::Unknown || !self.is_stale(&record, now) {
                continue;
            }
            let result = self.apply(&record, now, |current| {
                if !current.is_terminal() && self.is_stale(current, now) {
                    RecordChange::MarkUnknown
                } else {
                    RecordChange::NoChange
                }
            });
            if let Ok(Applied::Unknown) = result {
                warn!(
                    "No status for {} since {}, marked Unknown",
                    record.handle, record.last_observed_at
                );
                marked += 1;
            }
        }

        marked
    }
}
