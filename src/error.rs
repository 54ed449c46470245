//! Error types for IronFrame

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::container::ContainerState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Invalid state: container is {current}, expected {expected}")]
    InvalidState {
        current: ContainerState,
        expected: String,
    },

    #[error("Object has been disposed: {0}")]
    Disposed(String),

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Container host failed to start: {0}")]
    HostStartup(String),

    #[error("Container host is not available")]
    HostUnavailable,

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<String>,
    },

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("A process with key '{0}' is already being tracked.")]
    DuplicateProcessKey(Uuid),

    #[error("A process with key '{0}' is not being tracked.")]
    ProcessNotTracked(Uuid),

    #[error("Process has not exited")]
    ProcessNotExited,

    #[error("{operation} failed with OS error {code}: {message}")]
    Os {
        operation: String,
        code: i32,
        message: String,
    },

    #[error("Command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Container creation failed: {source}; {} cleanup action(s) also failed: {}", .cleanup.len(), summarize(.cleanup))]
    CreationRollback {
        source: Box<Error>,
        cleanup: Vec<Error>,
    },

    #[error("Cleanup failed: {}", summarize(.0))]
    Cleanup(Vec<Error>),

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Caller mistakes that retrying will never fix
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::ContainerAlreadyExists(_)
        )
    }

    pub fn is_state_violation(&self) -> bool {
        matches!(self, Error::InvalidState { .. } | Error::Disposed(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ContainerNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Wrap a native failure with the name of the call that produced it
    #[cfg(windows)]
    pub fn win32(operation: &str, err: windows::core::Error) -> Self {
        Error::Os {
            operation: operation.to_string(),
            code: err.code().0,
            message: err.message().to_string(),
        }
    }

    pub fn os(operation: &str, err: std::io::Error) -> Self {
        Error::Os {
            operation: operation.to_string(),
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }
}
