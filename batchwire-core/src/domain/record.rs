//! Job record domain type
//!
//! A record is the registry's view of one submitted job. Records change only
//! through [`RecordChange`] proposals, which [`JobRecord::apply`] validates
//! against the state machine before touching anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::handle::JobHandle;
use crate::domain::job::{JobId, JobSpec, StatusObservation};
use crate::domain::state::JobState;
use crate::error::{InvalidTransition, RegistryError};

/// Tracked state of one submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub handle: JobHandle,
    pub state: JobState,
    /// Most recent state confirmed by the backend (never Unknown)
    pub last_confirmed: JobState,
    pub submitted_at: DateTime<Utc>,
    /// When the backend last reported on this job
    pub last_observed_at: DateTime<Utc>,
    /// Submission attempts beyond the first
    pub retry_count: u32,
    /// `None` while the exit code is unknown
    pub exit_code: Option<i32>,
    pub log_summary: Option<String>,
    /// Set once artifact reconciliation finished, successfully or not
    pub reconciled: bool,
}

/// A proposed mutation of a job record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    /// Fresh information from the backend
    Observe(StatusObservation),
    /// The backend could not be consulted, or the job went unseen too long
    MarkUnknown,
    /// Late artifacts for a terminal job
    Enrich {
        exit_code: Option<i32>,
        log_summary: Option<String>,
    },
    /// Artifacts never appeared before the reconciliation deadline
    ReconcileExpired,
    NoChange,
}

impl JobRecord {
    /// Creates the Pending record for a freshly acknowledged submission
    ///
    /// The acknowledgement counts as the first observation.
    pub fn submitted(spec: JobSpec, handle: JobHandle, retry_count: u32) -> Self {
        let now = Utc::now();
        Self {
            spec,
            handle,
            state: JobState::Pending,
            last_confirmed: JobState::Pending,
            submitted_at: now,
            last_observed_at: now,
            retry_count,
            exit_code: None,
            log_summary: None,
            reconciled: false,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.spec.id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the reconciler still has work to do for this record
    pub fn needs_reconciliation(&self) -> bool {
        self.is_terminal() && !self.reconciled && self.exit_code.is_none()
    }

    fn check_transition(&self, next: JobState) -> Result<(), InvalidTransition> {
        if self.state.allows(self.last_confirmed, next) {
            Ok(())
        } else {
            Err(InvalidTransition {
                job: self.spec.id.clone(),
                from: self.state,
                to: next,
            })
        }
    }

    /// Validates and applies a change, returning whether anything changed
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, change: RecordChange, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        match change {
            RecordChange::NoChange => Ok(false),

            RecordChange::Observe(observation) => {
                let next = observation.state;
                self.check_transition(next)?;

                let changed = self.state != next;
                self.state = next;
                if next != JobState::Unknown {
                    self.last_confirmed = next;
                    self.last_observed_at = now;
                }
                if self.exit_code.is_none() && observation.exit_code.is_some() {
                    self.exit_code = observation.exit_code;
                    return Ok(true);
                }
                Ok(changed)
            }

            RecordChange::MarkUnknown => {
                // A terminal record is already final; losing sight of it is harmless
                if self.is_terminal() || self.state == JobState::Unknown {
                    return Ok(false);
                }
                self.check_transition(JobState::Unknown)?;
                self.state = JobState::Unknown;
                Ok(true)
            }

            RecordChange::Enrich {
                exit_code,
                log_summary,
            } => {
                if !self.is_terminal() {
                    return Err(RegistryError::NotTerminal(self.spec.id.clone()));
                }
                let mut changed = false;
                if self.exit_code.is_none() && exit_code.is_some() {
                    self.exit_code = exit_code;
                    changed = true;
                }
                if self.log_summary.is_none() && log_summary.is_some() {
                    self.log_summary = log_summary;
                    changed = true;
                }
                if !self.reconciled {
                    self.reconciled = true;
                    changed = true;
                }
                Ok(changed)
            }

            RecordChange::ReconcileExpired => {
                if !self.is_terminal() {
                    return Err(RegistryError::NotTerminal(self.spec.id.clone()));
                }
                let changed = !self.reconciled;
                self.reconciled = true;
                Ok(changed)
            }
        }
    }
}
