//! Error taxonomy for remote command execution.
//!
//! Every failure inside the bridge is surfaced as an [`ExecError`]. Nothing is
//! retried: the first failure is returned to the caller of
//! [`Executor::execute`](super::exec::Executor::execute).
//!
//! # Classification
//!
//! Errors are split into two kinds for the HTTP boundary:
//!
//! 1. **Client errors**: the request itself is unusable (empty host or
//!    command). These map to `400 Bad Request`.
//!
//! 2. **Server errors**: everything that goes wrong after the request was
//!    accepted (resolution, credentials, connection, remote failure). These map
//!    to `500 Internal Server Error`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Who caused an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent input the bridge cannot act on.
    Client,
    /// The bridge or the remote side failed.
    Server,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("failed to fetch the host details for '{host}': {reason}")]
    HostNotResolvable { host: String, reason: String },

    #[error("failed to read private key {}: {source}", .path.display())]
    CredentialUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse the private key {}: {reason}", .path.display())]
    CredentialInvalid { path: PathBuf, reason: String },

    #[error("failed to dial to remote {address}: {reason}")]
    DialFailed { address: String, reason: String },

    #[error("authentication rejected for {user}@{address}")]
    AuthenticationRejected { user: String, address: String },

    #[error("failed to create session: {0}")]
    ChannelAllocationFailed(String),

    #[error("failed to request xterm: {0}")]
    PtyRequestFailed(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("command timed out after {0:?}")]
    CommandTimedOut(Duration),
}

impl ExecError {
    /// Classify the error for status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::InvalidInput(_) => ErrorKind::Client,
            _ => ErrorKind::Server,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.kind() == ErrorKind::Client
    }
}
