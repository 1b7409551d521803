use crate::sense::Diagnostic;
use crate::transport::Status;
use std::path::PathBuf;
use thiserror::Error;

/// Failures acquiring a device handle.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("{}: no such device", .0.display())]
    NotFound(PathBuf),
    #[error("{}: permission denied (root or administrator privileges are required)", .0.display())]
    PermissionDenied(PathBuf),
    #[error("{}: not a block or controller device", .0.display())]
    NotADevice(PathBuf),
    /// The operating system offers no pass-through for this device class.
    #[error("{}: pass-through not supported: {reason}", .path.display())]
    Unsupported { path: PathBuf, reason: &'static str },
    #[error("{}: {source}", .path.display())]
    Os {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the pass-through call itself, before the device's own
/// status is looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("permission denied issuing pass-through command")]
    PermissionDenied,
    #[error("device busy")]
    DeviceBusy,
    #[error("command timed out")]
    Timeout,
    #[error("pass-through not supported: {0}")]
    Unsupported(&'static str),
    #[error("I/O error (os error {0})")]
    Io(i32),
}

/// The device accepted the command but reported that it failed.
///
/// The raw sense/status is kept so callers can display it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command failed: {diagnostic}")]
pub struct CommandFailure {
    pub status: Status,
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed {structure}: expected at least {expected} bytes, got {actual}")]
pub struct MalformedResponse {
    pub structure: &'static str,
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Error)]
pub enum SmartError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Command(#[from] Box<CommandFailure>),
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),
    #[error("{}: device is not open", .0.display())]
    Closed(PathBuf),
    #[error("{}: device is already open", .0.display())]
    AlreadyOpen(PathBuf),
    #[error("data buffer is {supplied} bytes but the command declares {declared}")]
    BufferLength { declared: usize, supplied: usize },
    #[error("invalid command descriptor block length {0}")]
    InvalidCdb(usize),
    #[error("data phase direction does not match the command")]
    DirectionMismatch,
    /// I/O outside the pass-through path, e.g. listing devices.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CommandFailure> for SmartError {
    fn from(err: CommandFailure) -> Self {
        SmartError::Command(Box::new(err))
    }
}

impl SmartError {
    /// Short name of the error kind, for CLI reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SmartError::Transport(TransportError::PermissionDenied)
            | SmartError::Open(OpenError::PermissionDenied(_)) => "permission-denied",
            SmartError::Transport(TransportError::Unsupported(_))
            | SmartError::Open(OpenError::Unsupported { .. }) => "unsupported",
            SmartError::Open(_) => "open",
            SmartError::Transport(_) => "transport",
            SmartError::Command(_) => "command-failure",
            SmartError::Malformed(_) => "malformed-response",
            SmartError::Closed(_) | SmartError::AlreadyOpen(_) => "device-state",
            SmartError::BufferLength { .. }
            | SmartError::InvalidCdb(_)
            | SmartError::DirectionMismatch => "invalid-request",
            SmartError::Io(_) => "io",
        }
    }

    /// Native OS error code, when one is behind this error.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SmartError::Transport(TransportError::Io(code)) => Some(*code),
            SmartError::Open(OpenError::Os { source, .. }) | SmartError::Io(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

pub type Result<T, E = SmartError> = std::result::Result<T, E>;
