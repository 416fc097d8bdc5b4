//! Processing commands
//!
//! A processing command turns a backend-agnostic [`JobSpec`] into the
//! submission arguments of one backend (`-l mem=4096mb` for PBS,
//! `--mem=4096M` for Slurm, ...). Rendering is pure: the same spec and
//! command always produce the same tokens, and nothing is executed.
//!
//! The known backends are closed variants of [`ProcessingCommand`]. Backends
//! added outside this crate implement [`CommandRenderer`] and travel as
//! [`ProcessingCommand::Extension`].

mod direct;
mod dummy;
mod lsf;
mod pbs;
mod sge;
mod slurm;

pub use direct::DirectCommand;
pub use dummy::DummyCommand;
pub use lsf::LsfCommand;
pub use pbs::PbsCommand;
pub use sge::SgeCommand;
pub use slurm::SlurmCommand;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::handle::{BackendKind, JobHandle};
use crate::domain::job::JobSpec;

/// Rendering contract every processing command satisfies
pub trait CommandRenderer: Send + Sync + fmt::Debug {
    /// Backend this command targets
    fn backend_kind(&self) -> BackendKind;

    /// Submission tokens for the spec's name, queue and resource requests
    fn render(&self, spec: &JobSpec) -> Vec<String>;

    /// Tokens making the job wait for its predecessors
    fn render_dependencies(&self, _predecessors: &[JobHandle]) -> Vec<String> {
        Vec::new()
    }

    /// Short human-readable description
    fn label(&self) -> String;
}

/// Backend-specific rendering of a job's submission parameters
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingCommand {
    Pbs(PbsCommand),
    Sge(SgeCommand),
    Lsf(LsfCommand),
    Slurm(SlurmCommand),
    Direct(DirectCommand),
    Dummy(DummyCommand),
    Extension(ExtensionCommand),
}

impl ProcessingCommand {
    pub fn pbs() -> Self {
        ProcessingCommand::Pbs(PbsCommand::default())
    }

    pub fn sge() -> Self {
        ProcessingCommand::Sge(SgeCommand::default())
    }

    pub fn lsf() -> Self {
        ProcessingCommand::Lsf(LsfCommand::default())
    }

    pub fn slurm() -> Self {
        ProcessingCommand::Slurm(SlurmCommand::default())
    }

    pub fn direct() -> Self {
        ProcessingCommand::Direct(DirectCommand::default())
    }

    pub fn dummy(text: impl Into<String>) -> Self {
        ProcessingCommand::Dummy(DummyCommand::new(text))
    }

    pub fn extension(renderer: Arc<dyn CommandRenderer>) -> Self {
        ProcessingCommand::Extension(ExtensionCommand { renderer })
    }

    fn renderer(&self) -> &dyn CommandRenderer {
        match self {
            ProcessingCommand::Pbs(cmd) => cmd,
            ProcessingCommand::Sge(cmd) => cmd,
            ProcessingCommand::Lsf(cmd) => cmd,
            ProcessingCommand::Slurm(cmd) => cmd,
            ProcessingCommand::Direct(cmd) => cmd,
            ProcessingCommand::Dummy(cmd) => cmd,
            ProcessingCommand::Extension(ext) => ext.renderer.as_ref(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.renderer().backend_kind()
    }

    pub fn render(&self, spec: &JobSpec) -> Vec<String> {
        self.renderer().render(spec)
    }

    pub fn render_dependencies(&self, predecessors: &[JobHandle]) -> Vec<String> {
        if predecessors.is_empty() {
            return Vec::new();
        }
        self.renderer().render_dependencies(predecessors)
    }
}

impl fmt::Display for ProcessingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.renderer().label())
    }
}

macro_rules! impl_from_command {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ProcessingCommand {
                fn from(cmd: $ty) -> Self {
                    ProcessingCommand::$variant(cmd)
                }
            }
        )*
    };
}

impl_from_command!(
    Pbs => PbsCommand,
    Sge => SgeCommand,
    Lsf => LsfCommand,
    Slurm => SlurmCommand,
    Direct => DirectCommand,
    Dummy => DummyCommand,
);

/// Command for a backend registered outside the core
///
/// Two extension commands are equal when they target the same backend and
/// describe themselves identically.
#[derive(Debug, Clone)]
pub struct ExtensionCommand {
    renderer: Arc<dyn CommandRenderer>,
}

impl PartialEq for ExtensionCommand {
    fn eq(&self, other: &Self) -> bool {
        self.renderer.backend_kind() == other.renderer.backend_kind()
            && self.renderer.label() == other.renderer.label()
    }
}

/// Formats a duration as `HH:MM:SS`, hours unbounded
pub(crate) fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Formats a duration as `HH:MM`, rounding partial minutes up
pub(crate) fn format_hm(duration: Duration) -> String {
    let minutes = duration.as_secs().div_ceil(60).max(1);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Pushes `flag value` as two tokens
pub(crate) fn push_pair(tokens: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    tokens.push(flag.to_string());
    tokens.push(value.into());
}
