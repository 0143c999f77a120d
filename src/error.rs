//! Error taxonomy for the transport.
//!
//! The set of failures a caller can observe is closed: every error is an
//! [`ErrorKind`] wrapped with the context needed to diagnose it against a
//! packet capture (the lifecycle phase at the time of failure, the command
//! tag, how long the device had been in that phase, and how many attempts
//! the transport made before giving up).

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Phase;
use crate::protocol::CswError;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, without context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// A bulk endpoint signalled a halt condition.
    #[error("bulk endpoint stalled")]
    PipeStall,
    /// The OS reported the device or interface busy.
    #[error("USB resource busy")]
    ResourceBusy,
    /// A transfer stage exceeded its timeout and the retry budget.
    #[error("transfer timed out")]
    Timeout,
    /// The CSW carried a tag the current phase policy rejects.
    #[error("CSW tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: u32, actual: u32 },
    /// The status wrapper failed structural validation twice in a row.
    #[error("invalid CSW: {0}")]
    InvalidCsw(CswError),
    /// The device fell off the bus. The handle is poisoned until reopened.
    #[error("device gone")]
    DeviceGone,
    /// The device reported command failure (CSW status {status}).
    #[error("SCSI command failed with status {status}")]
    ScsiFailure { status: u8, residue: u32 },
    /// The caller's cancel signal fired at a suspension point.
    #[error("operation cancelled")]
    Cancelled,
    /// No device with the requested VID/PID is attached.
    #[error("device not found")]
    NotFound,
    /// The device exists but could not be claimed.
    #[error("device busy")]
    Busy,
    /// The OS denied access to the device node.
    #[error("permission denied")]
    PermissionDenied,
}

/// An [`ErrorKind`] plus the transport state it was observed in.
#[derive(Debug, Clone, Error)]
#[error("{kind} (phase {phase}, tag {tag}, {elapsed_in_phase:?} in phase, attempt {attempts})")]
pub struct Error {
    pub kind: ErrorKind,
    /// Inferred lifecycle phase at the moment of failure.
    pub phase: Phase,
    /// Tag of the command in flight, or 0 if none was allocated yet.
    pub tag: u32,
    /// Time spent in `phase` when the error occurred.
    pub elapsed_in_phase: Duration,
    /// Number of attempts made, including the failing one.
    pub attempts: u32,
}

impl Error {
    /// An error observed before any transport state exists (during `open`).
    pub fn on_open(kind: ErrorKind) -> Self {
        Error {
            kind,
            phase: Phase::Unknown,
            tag: 0,
            elapsed_in_phase: Duration::ZERO,
            attempts: 1,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True if this error poisoned the handle.
    pub fn is_device_gone(&self) -> bool {
        self.kind == ErrorKind::DeviceGone
    }
}
