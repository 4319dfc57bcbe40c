//! External command execution.
//!
//! Everything devdock does to a project goes through [`CommandExecutor`]:
//! `docker compose`, `composer`, `npm`, `php artisan`, `ngrok`. The trait
//! keeps "binary missing", "non-zero exit", "timeout" and "cancelled" apart
//! so callers can report them distinctly.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecError;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Build from a program-plus-args prefix such as `["docker", "compose"]`.
    pub fn from_prefix(prefix: &[String]) -> Self {
        let mut iter = prefix.iter();
        let program = iter.next().cloned().unwrap_or_else(|| "docker".to_string());
        Self::new(program).args(iter.cloned())
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

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line for logs and push events.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Turn a non-zero exit into [`ExecError::NonZeroExit`].
    pub fn into_result(self) -> Result<CommandOutput, ExecError> {
        if self.success {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(ExecError::NonZeroExit {
                code: self.exit_code.unwrap_or(-1),
                stderr,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s,
        }
    }

    pub fn stream(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Stderr(_) => "stderr",
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion and capture output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Run while forwarding each output line to `sink`; killing the child when
    /// `cancel` fires.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecError>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl SystemExecutor {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_error(spec: &CommandSpec, e: std::io::Error) -> ExecError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecError::NotFound(spec.program.clone())
        } else {
            ExecError::Io {
                program: spec.program.clone(),
                source: e,
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        tracing::debug!(command = %spec.display(), cwd = ?spec.cwd, "running command");
        let child = Self::command(spec)
            .spawn()
            .map_err(|e| Self::spawn_error(spec, e))?;

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            // The child is dropped on timeout and kill_on_drop reaps it.
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ExecError::Timeout(limit.as_secs()))?,
            None => wait.await,
        }
        .map_err(|e| ExecError::Io {
            program: spec.program.clone(),
            source: e,
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: mpsc::UnboundedSender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        tracing::debug!(command = %spec.display(), cwd = ?spec.cwd, "streaming command");
        let mut child = Self::command(spec)
            .spawn()
            .map_err(|e| Self::spawn_error(spec, e))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, sink.clone(), OutputLine::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, sink, OutputLine::Stderr)));

        let deadline = async {
            match spec.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| ExecError::Io {
                program: spec.program.clone(),
                source: e,
            })?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(command = %spec.display(), error = %e, "failed to kill cancelled command");
                }
                return Err(ExecError::Cancelled);
            }
            _ = deadline => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(command = %spec.display(), error = %e, "failed to kill timed out command");
                }
                return Err(ExecError::Timeout(spec.timeout.map(|t| t.as_secs()).unwrap_or(0)));
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandOutput {
            success: status.success(),
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }
}

/// Forward lines to the sink and return everything read, newline-joined.
async fn forward_lines<R, F>(
    reader: R,
    sink: mpsc::UnboundedSender<OutputLine>,
    wrap: F,
) -> String
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> OutputLine,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push_str(&line);
        collected.push('\n');
        // Receiver may be gone; keep draining so the child never blocks on a full pipe.
        let _ = sink.send(wrap(line));
    }
    collected
}

#[cfg(test)]
pub mod testing {
    //! Scripted executor used by unit tests across the dashboard.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Output {
            code: i32,
            stdout: String,
            stderr: String,
        },
        NotFound,
        Timeout,
    }

    impl Scripted {
        pub fn ok(stdout: &str) -> Self {
            Self::Output {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn fail(code: i32, stderr: &str) -> Self {
            Self::Output {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    /// Matches the joined command line against substrings; first match wins.
    /// Unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        rules: Mutex<Vec<(String, Scripted)>>,
        calls: Mutex<Vec<CommandSpec>>,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn on(&self, needle: &str, response: Scripted) -> &Self {
            self.rules
                .lock()
                .unwrap()
                .push((needle.to_string(), response));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(CommandSpec::display)
                .collect()
        }

        pub fn specs(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        fn respond(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
            self.calls.lock().unwrap().push(spec.clone());
            let line = spec.display();
            let response = self
                .rules
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| Scripted::ok(""));
            match response {
                Scripted::Output {
                    code,
                    stdout,
                    stderr,
                } => Ok(CommandOutput {
                    success: code == 0,
                    stdout,
                    stderr,
                    exit_code: Some(code),
                }),
                Scripted::NotFound => Err(ExecError::NotFound(spec.program.clone())),
                Scripted::Timeout => Err(ExecError::Timeout(1)),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.respond(spec)
        }

        async fn run_streaming(
            &self,
            spec: &CommandSpec,
            sink: mpsc::UnboundedSender<OutputLine>,
            cancel: CancellationToken,
        ) -> Result<CommandOutput, ExecError> {
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                }
            }
            let output = self.respond(spec)?;
            for line in output.stdout.lines() {
                let _ = sink.send(OutputLine::Stdout(line.to_string()));
            }
            for line in output.stderr.lines() {
                let _ = sink.send(OutputLine::Stderr(line.to_string()));
            }
            Ok(output)
        }
    }
}
