//! Direct (local, synchronous) execution
//!
//! There is no scheduler in between, so the rendered tokens are the local
//! invocation itself. Resource and queue requests have no local meaning and
//! are ignored.

use crate::domain::handle::BackendKind;
use crate::domain::job::JobSpec;

use super::CommandRenderer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectCommand {
    pub shell: String,
}

impl Default for DirectCommand {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

impl DirectCommand {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandRenderer for DirectCommand {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn render(&self, spec: &JobSpec) -> Vec<String> {
        vec![self.shell.clone(), "-c".to_string(), spec.command.clone()]
    }

    fn label(&self) -> String {
        format!("Direct({})", self.shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_local_invocation() {
        let spec = JobSpec::new("j", "echo hi > out.txt").with_cpus(16);
        assert_eq!(
            DirectCommand::with_shell("/bin/bash").render(&spec),
            vec!["/bin/bash", "-c", "echo hi > out.txt"]
        );
    }
}
