//! Process execution contract.
//!
//! The git manager never spawns processes directly; it hands a
//! [`CommandSpec`] to a [`ProcessRunner`]. Production uses
//! [`TokioProcessRunner`]; tests use [`ScriptedRunner`] to replay canned
//! outputs and record the exact invocations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The command did not finish before its deadline and was killed.
    /// Timeouts are recoverable: the caller may retry with a fresh deadline.
    #[error("command timed out after {timeout_secs}s: {program}")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

// ---------------------------------------------------------------------------
// CommandSpec / CommandOutput
// ---------------------------------------------------------------------------

/// One command to execute: program, arguments, working directory,
/// additional environment, and a hard deadline.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Shorthand for a git invocation.
    pub fn git<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new("git");
        spec.args = args.into_iter().map(Into::into).collect();
        spec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command as it would appear on a shell line (for logs).
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Async command execution under a timeout.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// TokioProcessRunner
// ---------------------------------------------------------------------------

/// Real runner backed by `tokio::process`. The child is killed when the
/// deadline passes.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let start = std::time::Instant::now();

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                return Err(ProcessError::Timeout {
                    program: spec.program,
                    timeout_secs: spec.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner — test double
// ---------------------------------------------------------------------------

/// A runner that replays a script of canned results in FIFO order and
/// records every invocation. When the script runs dry it answers with a
/// successful empty output, which keeps incidental commands out of tests.
pub struct ScriptedRunner {
    script: std::sync::Mutex<std::collections::VecDeque<Result<CommandOutput>>>,
    calls: std::sync::Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful output with the given stdout.
    pub fn push_ok(self, stdout: impl Into<String>) -> Self {
        self.script.lock().unwrap().push_back(Ok(CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 1,
        }));
        self
    }

    /// Queue a failing output with the given exit code and stderr.
    pub fn push_fail(self, exit_code: i32, stderr: impl Into<String>) -> Self {
        self.script.lock().unwrap().push_back(Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 1,
        }));
        self
    }

    /// Queue a runner-level error (spawn failure, timeout).
    pub fn push_error(self, error: ProcessError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    /// Every spec this runner has executed, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Display lines of every executed command, for compact assertions.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.display_line()).collect()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
