//! External command execution.
//!
//! Interface configuration (`ip`, `sysctl`, `modprobe`) and firewall
//! manipulation (`iptables`) go through [`CommandRunner`] so the callers can
//! be exercised without root privileges.

use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs an external program and captures its output.
///
/// `run` only fails when the program cannot be spawned; a non-zero exit is
/// reported through [`CommandOutput::success`].
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = GatewayResult<CommandOutput>> + Send;
}

/// Run a command and turn a non-zero exit into [`GatewayError::Command`].
pub async fn run_checked<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
) -> GatewayResult<String> {
    let output = runner.run(program, args).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(GatewayError::Command(format!(
            "{} {}: {}",
            program,
            args.join(" "),
            output.stderr.trim()
        )))
    }
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

impl CommandRunner for SystemCommand {
    async fn run(&self, program: &str, args: &[String]) -> GatewayResult<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| GatewayError::Command(format!("Failed to execute {}: {}", program, e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argument vector from string slices.
pub(crate) fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let runner = RecordingRunner::new();
        runner.fail_on("link set");
        let err = run_checked(&runner, "ip", &args(["link", "set", "dev", "tun0", "up"]))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ip link set dev tun0 up"));
        assert!(msg.contains("operation not permitted"));
    }

    #[tokio::test]
    async fn test_run_checked_returns_stdout() {
        let runner = RecordingRunner::new();
        let out = run_checked(&runner, "true", &[]).await.unwrap();
        assert_eq!(out, "");
        assert_eq!(runner.calls(), vec!["true ".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_command_captures_exit_status() {
        let ok = SystemCommand.run("sh", &args(["-c", "echo hi"])).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = SystemCommand
            .run("sh", &args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_system_command_missing_program() {
        let err = SystemCommand
            .run("definitely-not-a-real-binary-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Command(_)));
    }
}
