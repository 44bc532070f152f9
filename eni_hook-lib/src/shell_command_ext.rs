use thiserror::Error;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::Output;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command execution failed [status: {code:?}]: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// How loudly a failing command is reported.
///
/// Read-only queries are expected to fail now and then (a routing table that
/// was never created) and only show up at debug level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command and discard stdout.
    /// Unconditionally captures stdout and stderr regardless of command settings.
    /// See tokio's output behaviour: https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.output
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        self.run_stdout(logs).await.map(|_| ())
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (output.stderr.is_empty(), output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            match logs {
                Logs::Print => {
                    tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command")
                }
                Logs::Suppress => {
                    tracing::debug!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command")
                }
            }
            Err(Error::CommandFailed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}
