//! Error taxonomy for the jailer core.
//!
//! Every fallible operation in this crate terminates the process on failure
//! (see `main.rs`); this enum only distinguishes error kinds so that the
//! caller can pick the right exit code and decoration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JailError {
    /// Malformed CLI, unknown option/type, non-absolute path where one is
    /// required.
    #[error("usage error: {0}")]
    Usage(String),

    /// A system call failed.
    #[error("system error: {0}")]
    System(#[from] nix::Error),

    /// A sync-protocol or netlink ack mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Requested an operation that the environment cannot satisfy (no
    /// newuidmap helper while unprivileged, overlay requested without
    /// kernel support, etc).
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, JailError>;

impl JailError {
    pub fn usage<S: Into<String>>(msg: S) -> Self {
        JailError::Usage(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        JailError::Protocol(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        JailError::Config(msg.into())
    }

    /// Exit code to use when this error reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            JailError::Usage(_) => 64,
            _ => 1,
        }
    }
}
