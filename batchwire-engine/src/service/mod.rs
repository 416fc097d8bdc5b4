//! Service layer
//!
//! Services hold the engine's business logic: submitting with retries,
//! folding backend status into the registry, and reconciling late results.
//! They coordinate the backends and the registry but own neither.
//!
//! All services are trait-based to enable testing and dependency injection.

mod reconciliation;
mod retry;
mod submission;
mod tracking;

// Re-export traits
pub use reconciliation::{ArtifactSource, ReconciliationService};
pub use submission::SubmissionService;
pub use tracking::TrackingService;

// Re-export implementations
pub use reconciliation::{FileArtifactSource, ReconcileOutcome, StandardReconciliationService};
pub use retry::RetryPolicy;
pub use submission::StandardSubmissionService;
pub use tracking::{RefreshReport, StandardTrackingService};
