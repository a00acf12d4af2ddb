use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{path::PathBuf, process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use trait_variant::make;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{program}: timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program}: failed to launch: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
}

/// Captured result of a finished external command
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub success: bool,
}

/// Runs one-shot external commands with a hard time bound.
///
/// A non-zero exit is not an error at this boundary; callers inspect
/// `success` and decide. Only failure to launch or a timeout is an error.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner {
    async fn run(
        &self,
        program: PathBuf,
        args: Vec<String>,
        limit: Duration,
    ) -> Result<CommandOutput, RunnerError>;
}

#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: PathBuf,
        args: Vec<String>,
        limit: Duration,
    ) -> Result<CommandOutput, RunnerError> {
        let name = program.display().to_string();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(limit, command.output()).await {
            Err(_) => {
                return Err(RunnerError::Timeout {
                    program: name,
                    timeout: limit,
                });
            }
            Ok(Err(source)) => {
                return Err(RunnerError::Launch {
                    program: name,
                    source,
                });
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            debug!(
                "{name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let runner = SystemCommandRunner;
        let output = runner
            .run(
                "/bin/sh".into(),
                vec!["-c".into(), "echo hello".into()],
                Duration::from_secs(5),
            )
            .await
            .expect("run failed");

        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let runner = SystemCommandRunner;
        let output = runner
            .run(
                "/bin/sh".into(),
                vec!["-c".into(), "exit 3".into()],
                Duration::from_secs(5),
            )
            .await
            .expect("run failed");

        assert!(!output.success);
    }

    #[tokio::test]
    async fn times_out_instead_of_hanging() {
        let runner = SystemCommandRunner;
        let result = runner
            .run(
                "/bin/sh".into(),
                vec!["-c".into(), "sleep 5".into()],
                Duration::from_millis(100),
            )
            .await;

        assert!(matches!(result, Err(RunnerError::Timeout { .. })));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_launch() {
        let runner = SystemCommandRunner;
        let result = runner
            .run(
                "/nonexistent/binary".into(),
                vec![],
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(result, Err(RunnerError::Launch { .. })));
    }
}
