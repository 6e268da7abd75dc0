// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::ConfigError;
use crate::poll::PollLimit;
use camino::Utf8PathBuf;
use edge_exec::ExecutionError;
use std::time::Duration;

/// Errors that end a provisioning run.
///
/// Timeouts are kept apart from tool failures: a timeout usually means the
/// target is still converging and a re-run may succeed, while a tool
/// failure needs an operator to look at the log.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{host}:{port} is unreachable: {err}")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        err: std::io::Error,
    },

    #[error(
        "active subscription is {actual}, expected {expected}, and switching \
         did not take effect"
    )]
    SubscriptionMismatch { expected: String, actual: String },

    #[error("{context}")]
    Tool {
        context: String,
        #[source]
        err: ExecutionError,
    },

    #[error(
        "timed out waiting for {what} after {attempts} attempts \
         ({elapsed:?}, limit {limit})"
    )]
    Timeout {
        what: String,
        attempts: u32,
        elapsed: Duration,
        limit: PollLimit,
    },

    #[error("could not resolve principal {principal_id} to a client id")]
    IdentityResolution { principal_id: String },

    #[error(
        "no automation credentials available: run the devops layer or set \
         {}, {} and {}",
        crate::identity::ENV_APP_ID,
        crate::identity::ENV_TENANT_ID,
        crate::identity::ENV_SECRET
    )]
    MissingCredentials,

    #[error(
        "{} must be set when the edge or validation layer is selected",
        crate::tools::GUEST_PASSWORD_ENV
    )]
    MissingGuestCredential,

    #[error("edge cluster deployment on {vm} did not register")]
    DeploymentNotRegistered { vm: String },

    #[error("image build finished but {path} does not exist")]
    ArtifactMissing { path: Utf8PathBuf },

    #[error("{what} does not exist; run the {layer} layer first")]
    MissingPrerequisite { what: String, layer: &'static str },

    #[error("confirmation not given; nothing was changed")]
    Aborted,

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to write run report to {path}")]
    Report {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ProvisionError {
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        ProvisionError::Io { context: context.into(), err }
    }

    pub(crate) fn timeout<E>(
        what: impl Into<String>,
        err: crate::poll::PollError<E>,
    ) -> Self
    where
        ProvisionError: From<E>,
    {
        match err {
            crate::poll::PollError::TimedOut { attempts, elapsed, limit } => {
                ProvisionError::Timeout {
                    what: what.into(),
                    attempts,
                    elapsed,
                    limit,
                }
            }
            crate::poll::PollError::PermanentError(err) => err.into(),
        }
    }
}

/// Attaches a description of what we were doing to a failed tool call.
pub trait ToolContext<T> {
    fn tool_context<C: Into<String>>(
        self,
        context: C,
    ) -> Result<T, ProvisionError>;

    fn with_tool_context<C, F>(self, f: F) -> Result<T, ProvisionError>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ToolContext<T> for Result<T, ExecutionError> {
    fn tool_context<C: Into<String>>(
        self,
        context: C,
    ) -> Result<T, ProvisionError> {
        self.map_err(|err| ProvisionError::Tool {
            context: context.into(),
            err,
        })
    }

    fn with_tool_context<C, F>(self, f: F) -> Result<T, ProvisionError>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| ProvisionError::Tool { context: f().into(), err })
    }
}
