//! Job state machine
//!
//! ```text
//! Pending -> Queued -> Running -> { Completed | Failed | Aborted }
//!    \________\__________\______-> Unknown -> (last confirmed state or later)
//! ```
//!
//! Forward jumps are allowed (a fast job may go straight from Pending to
//! Completed). Terminal states have no outgoing transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Unknown,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }

    /// Position in the forward order, `None` for Unknown
    fn rank(self) -> Option<u8> {
        match self {
            JobState::Pending => Some(0),
            JobState::Queued => Some(1),
            JobState::Running => Some(2),
            JobState::Completed | JobState::Failed | JobState::Aborted => Some(3),
            JobState::Unknown => None,
        }
    }

    /// Whether a record currently in `self`, whose last confirmed state is
    /// `confirmed`, may move to `next`
    ///
    /// Staying in the same state is always allowed so observations stay
    /// idempotent.
    pub fn allows(self, confirmed: JobState, next: JobState) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == JobState::Unknown {
            return true;
        }

        // While Unknown, the record resumes from what was last confirmed
        let base = if self == JobState::Unknown {
            confirmed
        } else {
            self
        };

        match (base.rank(), next.rank()) {
            (Some(from), Some(to)) => to >= from,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "Pending",
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Unknown => "Unknown",
            JobState::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}
