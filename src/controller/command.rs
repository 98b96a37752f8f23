//! External command execution
//!
//! Every privileged operation goes through [`CommandExecutor`]. Commands are
//! typed argv vectors; nothing is ever handed to a shell, so SSIDs and
//! passphrases cannot be reinterpreted by quoting rules.

use super::error::{HotspotError, HotspotResult};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A single external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The argv as borrowed strings, program first.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best human-readable failure message: stderr, else stdout.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Convert a non-zero exit into [`HotspotError::CommandFailed`].
    pub fn check(self, cmd: &Cmd) -> HotspotResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HotspotError::CommandFailed {
                command: cmd.to_string(),
                message: self.error_message(),
            })
        }
    }
}

/// Runs external commands one at a time.
///
/// A non-zero exit is never an error at this layer; only a failure to spawn
/// the process is.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, cmd: &Cmd) -> HotspotResult<CommandOutput>;
}

/// Executor backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, cmd: &Cmd) -> HotspotResult<CommandOutput> {
        tracing::debug!(command = %cmd, "Executing command");

        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|source| HotspotError::ExecutionFailed {
                program: cmd.program.clone(),
                source,
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if !result.stderr.trim().is_empty() {
            tracing::debug!(
                command = %cmd,
                exit_code = ?result.exit_code,
                stderr = %result.stderr.trim(),
                "Command wrote to stderr"
            );
        }

        Ok(result)
    }
}

/// Bounded retry with multiplicative backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: 1.0,
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay to wait before attempt `attempt` (1-based). The first attempt
    /// never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        self.delay.mul_f64(self.backoff.max(1.0).powi(exponent))
    }

    /// Run `probe` until it yields `true` or attempts run out. Returns whether
    /// the probe ever succeeded.
    pub async fn run<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for attempt in 1..=self.max_attempts.max(1) {
            let wait = self.delay_before(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            if probe(attempt).await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_display_joins_argv() {
        let cmd = Cmd::new("ip").args(["link", "set", "wlan0", "up"]);
        assert_eq!(cmd.to_string(), "ip link set wlan0 up");
        assert_eq!(cmd.argv(), vec!["ip", "link", "set", "wlan0", "up"]);
    }

    #[test]
    fn test_check_prefers_stderr() {
        let cmd = Cmd::new("iw");
        let output = CommandOutput {
            stdout: "ignored".into(),
            stderr: "command failed: Device or resource busy (-16)\n".into(),
            exit_code: Some(240),
        };
        match output.check(&cmd) {
            Err(HotspotError::CommandFailed { message, .. }) => {
                assert_eq!(message, "command failed: Device or resource busy (-16)");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_executor_honors_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().canonicalize().unwrap();

        let output = SystemExecutor
            .execute(&Cmd::new("pwd").current_dir(dir.path()))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), expected.display().to_string());
    }

    #[test]
    fn test_retry_delays_grow_with_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).with_backoff(2.0);
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let mut calls = 0;
        let ok = policy
            .run(|_| {
                calls += 1;
                async { false }
            })
            .await;
        assert!(!ok);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_retry_returns_on_first_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let ok = policy
            .run(|attempt| {
                calls += 1;
                async move { attempt == 2 }
            })
            .await;
        assert!(ok);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_execution_failure() {
        let cmd = Cmd::new("/nonexistent/deck-hotspot-test-binary");
        match SystemExecutor.execute(&cmd).await {
            Err(HotspotError::ExecutionFailed { program, .. }) => {
                assert_eq!(program, "/nonexistent/deck-hotspot-test-binary");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
