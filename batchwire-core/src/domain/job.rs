//! Job description types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::state::JobState;
use crate::error::SpecError;

/// Logical job identity chosen by the workflow engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Abstract resource request, translated per backend by a processing command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: u32,
    pub memory_mb: Option<u64>,
    pub walltime: Option<Duration>,
    pub queue: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: None,
            walltime: None,
            queue: None,
        }
    }
}

/// Backend-agnostic description of a job
///
/// Immutable once submitted; the registry stores it inside the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub command: String,
    pub resources: ResourceRequest,
    /// Jobs that must complete successfully before this one starts
    pub dependencies: Vec<JobId>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Directory receiving `<id>.out` and the `<id>.exitcode` artifact
    pub log_dir: Option<PathBuf>,
}

impl JobSpec {
    pub fn new(id: impl Into<JobId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            resources: ResourceRequest::default(),
            dependencies: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            log_dir: None,
        }
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.resources.cpus = cpus;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.resources.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_walltime(mut self, walltime: Duration) -> Self {
        self.resources.walltime = Some(walltime);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.resources.queue = Some(queue.into());
        self
    }

    pub fn with_dependency(mut self, predecessor: impl Into<JobId>) -> Self {
        self.dependencies.push(predecessor.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Path of the captured stdout, if a log directory is set
    pub fn stdout_path(&self) -> Option<PathBuf> {
        self.log_path("out")
    }

    /// Path of the exit-code artifact, if a log directory is set
    pub fn exit_code_path(&self) -> Option<PathBuf> {
        self.log_path("exitcode")
    }

    fn log_path(&self, extension: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", self.id, extension)))
    }

    /// Rejects specs no backend could render
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.as_str().trim().is_empty() {
            return Err(SpecError::EmptyId);
        }
        if self.id.as_str().chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(SpecError::InvalidId(self.id.clone()));
        }
        if self.command.trim().is_empty() {
            return Err(SpecError::EmptyCommand(self.id.clone()));
        }

        if self.resources.cpus == 0 {
            return Err(SpecError::InvalidResource("cpus must be at least 1".to_string()));
        }
        if self.resources.memory_mb == Some(0) {
            return Err(SpecError::InvalidResource(
                "memory_mb must be greater than 0".to_string(),
            ));
        }
        if self.resources.walltime.is_some_and(|w| w.is_zero()) {
            return Err(SpecError::InvalidResource(
                "walltime must be greater than 0".to_string(),
            ));
        }
        if self
            .resources
            .queue
            .as_deref()
            .is_some_and(|q| q.trim().is_empty())
        {
            return Err(SpecError::InvalidResource("queue cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.id {
                return Err(SpecError::SelfDependency(self.id.clone()));
            }
            if !seen.insert(dep) {
                return Err(SpecError::DuplicateDependency(dep.clone()));
            }
        }

        for key in self.environment.keys() {
            if !is_env_name(key) {
                return Err(SpecError::InvalidEnvName(key.clone()));
            }
        }

        Ok(())
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// One scheduler report about a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusObservation {
    pub state: JobState,
    pub exit_code: Option<i32>,
}

impl StatusObservation {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            exit_code: None,
        }
    }

    pub fn finished(state: JobState, exit_code: i32) -> Self {
        Self {
            state,
            exit_code: Some(exit_code),
        }
    }

    /// Classifies a finished job by its exit code
    ///
    /// Exits caused by SIGINT, SIGKILL or SIGTERM (130, 137, 143) count as
    /// aborted; anything else non-zero is a failure.
    pub fn from_exit_code(exit_code: i32) -> Self {
        let state = match exit_code {
            0 => JobState::Completed,
            130 | 137 | 143 => JobState::Aborted,
            _ => JobState::Failed,
        };
        Self::finished(state, exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_spec() {
        let spec = JobSpec::new("align-1", "bwa mem ref.fa reads.fq")
            .with_cpus(4)
            .with_memory_mb(8192)
            .with_walltime(Duration::from_secs(3600))
            .with_queue("long")
            .with_dependency("index-1")
            .with_env("SAMPLE", "s1");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_invalid_specs() {
        assert_eq!(JobSpec::new("", "true").validate(), Err(SpecError::EmptyId));
        assert!(matches!(
            JobSpec::new("a b", "true").validate(),
            Err(SpecError::InvalidId(_))
        ));
        assert!(matches!(
            JobSpec::new("a", "  ").validate(),
            Err(SpecError::EmptyCommand(_))
        ));
        assert!(matches!(
            JobSpec::new("a", "true").with_cpus(0).validate(),
            Err(SpecError::InvalidResource(_))
        ));
        assert!(matches!(
            JobSpec::new("a", "true").with_dependency("a").validate(),
            Err(SpecError::SelfDependency(_))
        ));
        assert!(matches!(
            JobSpec::new("a", "true")
                .with_dependency("b")
                .with_dependency("b")
                .validate(),
            Err(SpecError::DuplicateDependency(_))
        ));
        assert!(matches!(
            JobSpec::new("a", "true").with_env("1BAD", "x").validate(),
            Err(SpecError::InvalidEnvName(_))
        ));
    }

    #[test]
    fn test_log_paths() {
        let spec = JobSpec::new("j1", "true").with_log_dir("/scratch/logs");
        assert_eq!(
            spec.exit_code_path(),
            Some(PathBuf::from("/scratch/logs/j1.exitcode"))
        );
        assert_eq!(spec.stdout_path(), Some(PathBuf::from("/scratch/logs/j1.out")));
        assert_eq!(JobSpec::new("j2", "true").stdout_path(), None);
    }

    #[test]
    fn test_observation_from_exit_code() {
        assert_eq!(StatusObservation::from_exit_code(0).state, JobState::Completed);
        assert_eq!(StatusObservation::from_exit_code(2).state, JobState::Failed);
        assert_eq!(StatusObservation::from_exit_code(143).state, JobState::Aborted);
    }
}
