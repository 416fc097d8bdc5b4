//! External process invocation
//!
//! Every scheduler tool (`qsub`, `sacct`, `bkill`, ...) and every direct job
//! runs through a [`CommandExecutor`]:
//! - Spawning the program with optional stdin, environment and working dir
//! - Capturing stdout/stderr
//! - Enforcing a per-call timeout, killing the child when it fires

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

/// Maximum bytes captured per output stream
const MAX_OUTPUT_BYTES: u64 = 4 * 1024 * 1024;

/// One external program call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Program and arguments joined for log output
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl InvocationOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors that prevent an invocation from producing output
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external programs
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<InvocationOutput, InvocationError>;
}

/// Executor backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<InvocationOutput, InvocationError> {
        debug!("Executing: {}", invocation.display());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| InvocationError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        // Written concurrently so a child that never reads stdin stays bounded
        // by the timeout
        let stdin_task = match (&invocation.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.clone();
                Some(tokio::spawn(async move {
                    // The child may exit without reading stdin; that is its business
                    let _ = stdin.write_all(input.as_bytes()).await;
                }))
            }
            _ => None,
        };

        // On timeout `child` is dropped, and kill_on_drop terminates it
        let waited = tokio::time::timeout(timeout, child.wait()).await;
        if let Some(task) = stdin_task {
            task.abort();
        }

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(InvocationError::Io {
                    program: invocation.program.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(InvocationError::TimedOut {
                    program: invocation.program.clone(),
                    timeout,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let output = InvocationOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };

        if !output.stderr.trim().is_empty() {
            debug!("{} stderr: {}", invocation.program, output.stderr.trim());
        }
        debug!(
            "{} finished: exit_code={:?}, stdout_len={}",
            invocation.program,
            output.exit_code,
            output.stdout.len()
        );

        Ok(output)
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(reader) = handle {
        let _ = reader.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

/// Checks that a scheduler tool is installed and answers
pub async fn probe(
    executor: &dyn CommandExecutor,
    invocation: &Invocation,
    timeout: Duration,
) -> anyhow::Result<()> {
    let output = executor
        .execute(invocation, timeout)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run '{}': {}", invocation.display(), e))?;

    if !output.success() {
        anyhow::bail!(
            "'{}' exited with {:?}: {}",
            invocation.display(),
            output.exit_code,
            output.stderr.trim()
        );
    }

    let version = output.stdout.lines().next().unwrap_or_default();
    info!("{} is available: {}", invocation.program, version.trim());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let invocation = Invocation::new("/bin/sh").args(["-c", "echo hello; exit 3"]);
        let output = ProcessExecutor
            .execute(&invocation, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_pipes_stdin_and_env() {
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let invocation = Invocation::new("/bin/sh")
            .args(["-c", "read line; echo \"$GREETING $line\""])
            .stdin("there\n")
            .env(env);
        let output = ProcessExecutor
            .execute(&invocation, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hi there");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let invocation = Invocation::new("/bin/sh").args(["-c", "sleep 30"]);
        let result = ProcessExecutor
            .execute(&invocation, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(InvocationError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        // Larger than any pipe buffer, so the write can only finish if read
        let script = "x".repeat(1024 * 1024);
        let invocation = Invocation::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .stdin(script);

        let started = std::time::Instant::now();
        let result = ProcessExecutor
            .execute(&invocation, Duration::from_millis(200))
            .await;

        assert!(matches!(result, Err(InvocationError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let invocation = Invocation::new("/definitely/not/a/scheduler");
        let result = ProcessExecutor
            .execute(&invocation, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(InvocationError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_probe() {
        let ok = Invocation::new("/bin/sh").args(["-c", "echo sh 1.0"]);
        assert!(probe(&ProcessExecutor, &ok, Duration::from_secs(5)).await.is_ok());

        let bad = Invocation::new("/bin/sh").args(["-c", "exit 1"]);
        assert!(probe(&ProcessExecutor, &bad, Duration::from_secs(5)).await.is_err());
    }

    #[test]
    fn test_display() {
        let invocation = Invocation::new("qstat").args(["-f", "12.srv"]);
        assert_eq!(invocation.display(), "qstat -f 12.srv");
    }
}
