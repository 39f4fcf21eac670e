//! Central helper for running external tools.
//!
//! Every driver goes through [`CommandRunner`] so tests can swap in the
//! recording [`FakeRunner`] and never spawn `qemu-img` or `zfs` for real.

use crate::{Result, SiloError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec {
            argv: argv.into_iter().map(Into::into).collect(),
            timeout: None,
            stdin: None,
            cwd: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Rendering used in error messages and logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a nonzero exit into the standard command error, stderr attached.
    pub fn into_checked(self, command: &str) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            let mut stderr = self.stderr.trim().to_string();
            if stderr.is_empty() {
                stderr = format!("exit code {}", self.status);
            }
            Err(SiloError::CommandFailed {
                command: command.to_string(),
                stderr,
            })
        }
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            status: 0,
        }
    }

    pub fn fail(status: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.into(),
            status,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Spawn failures and timeouts are errors;
    /// a nonzero exit status is a normal [`CommandOutput`] so callers can
    /// inspect stderr before deciding.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;

    /// Run and require a zero exit status.
    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let command = spec.display();
        self.run(spec).await?.into_checked(&command)
    }
}

/// Production runner backed by `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let program = spec
            .argv
            .first()
            .ok_or_else(|| SiloError::Storage("empty command line".to_string()))?;

        debug!(command = %spec.display(), "running external command");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&spec.argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if spec.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| SiloError::CommandFailed {
            command: spec.display(),
            stderr: format!("failed to spawn: {e}"),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                SiloError::CommandTimeout {
                    command: spec.display(),
                    timeout,
                }
            })??,
            None => wait.await?,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

/// Scripted runner for tests: records every spec and replays queued results.
/// An empty queue answers with a successful empty output.
#[derive(Default)]
pub struct FakeRunner {
    responses: Mutex<VecDeque<Result<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, output: CommandOutput) {
        self.responses.lock().unwrap().push_back(Ok(output));
    }

    pub fn enqueue_err(&self, err: SiloError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    /// All commands run so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// The argv lists run so far, joined for easy assertions.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.display())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec);
        match self.responses.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(CommandOutput::ok("")),
        }
    }
}
