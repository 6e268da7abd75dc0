// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::input::Input;
use crate::output::Output;
use std::process::ExitStatus;

/// Stand-in for output we refuse to keep around, because it may carry a
/// secret.
pub const REDACTED: &str = "<redacted>";

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailureInfo {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> ExitStatus {
        self.status
    }

    /// The exit code of the process, if it exited normally.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("I/O error while waiting for [{command}]: {err}")]
    ExecutionWait { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to parse command output: {0}")]
    ParseFailure(String),
}

impl ExecutionError {
    pub fn from_output(
        command: &std::process::Command,
        output: &Output,
    ) -> Self {
        Self::from_input(Input::from(command), output, false)
    }

    /// Like [Self::from_output], but never retains the child's stdout.
    pub fn from_redacted_output(
        command: &std::process::Command,
        output: &Output,
    ) -> Self {
        Self::from_input(Input::from(command), output, true)
    }

    fn from_input(input: Input, output: &Output, redact: bool) -> Self {
        let stdout = if redact {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(&output.stdout).to_string()
        };
        ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
            command: input.to_string(),
            status: output.status,
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }))
    }

    /// Returns the exit code when the command ran and exited unsuccessfully.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::CommandFailure(info) => info.code(),
            _ => None,
        }
    }

    pub fn parse<E: std::fmt::Display>(what: &str, err: E) -> Self {
        ExecutionError::ParseFailure(format!("{what}: {err}"))
    }
}
