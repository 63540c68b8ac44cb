//! Error types for observatory control
//!
//! Device operations return explicit result types whose failure kind is
//! distinguishable (connection vs. transient vs. driver fault), so callers
//! can decide between retrying a command and replacing a worker.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Broad classification of a device failure, used for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The device never came online; treat it as entirely unavailable.
    Connection,
    /// A single command failed; retrying is reasonable.
    Transient,
    /// The driver stopped responding or reported an internal fault;
    /// the worker must be replaced before further commands.
    Fault,
}

/// Errors surfaced by hardware workers.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("{device}: not connected")]
    NotConnected { device: String },

    #[error("{device}: {operation} failed: {message}")]
    CommandFailed {
        device: String,
        operation: String,
        message: String,
    },

    #[error("{device}: driver fault: {message}")]
    DriverFault { device: String, message: String },

    #[error("{device}: command queue closed")]
    QueueClosed { device: String },

    #[error("{device}: {operation} timed out after {timeout:?}")]
    Timeout {
        device: String,
        operation: String,
        timeout: Duration,
    },
}

impl DeviceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeviceError::NotConnected { .. } => FailureKind::Connection,
            DeviceError::CommandFailed { .. } => FailureKind::Transient,
            DeviceError::Timeout { .. } => FailureKind::Transient,
            DeviceError::DriverFault { .. } => FailureKind::Fault,
            DeviceError::QueueClosed { .. } => FailureKind::Fault,
        }
    }
}

/// Configuration loading and validation errors. Invalid documents are
/// rejected outright, never silently defaulted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ticket validation errors. A ticket that fails validation is rejected
/// before scheduling begins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TicketError {
    #[error("{name}: right ascension {ra} h outside [0, 24)")]
    RaOutOfRange { name: String, ra: f64 },

    #[error("{name}: declination {dec}° outside [-90, 90]")]
    DecOutOfRange { name: String, dec: f64 },

    #[error("{name}: cannot parse coordinate {value:?}")]
    BadCoordinate { name: String, value: String },

    #[error("{name}: end time is not after start time")]
    EmptyWindow { name: String },

    #[error("{name}: exposure time {seconds} s below minimum {minimum} s")]
    ExposureTooShort {
        name: String,
        seconds: f64,
        minimum: f64,
    },

    #[error("{name}: no filters requested")]
    NoFilters { name: String },

    #[error("{name}: filter {filter:?} has no slot in the filter wheel map")]
    UnknownFilter { name: String, filter: String },
}

/// Top-level observation run errors.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_classification() {
        let e = DeviceError::NotConnected {
            device: "camera".into(),
        };
        assert_eq!(e.kind(), FailureKind::Connection);

        let e = DeviceError::Timeout {
            device: "camera".into(),
            operation: "expose".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(e.kind(), FailureKind::Transient);

        let e = DeviceError::DriverFault {
            device: "telescope".into(),
            message: "no response".into(),
        };
        assert_eq!(e.kind(), FailureKind::Fault);
    }

    #[test]
    fn device_error_display_includes_device() {
        let e = DeviceError::CommandFailed {
            device: "dome".into(),
            operation: "open_shutter".into(),
            message: "motor stall".into(),
        };
        let text = e.to_string();
        assert!(text.contains("dome"));
        assert!(text.contains("open_shutter"));
    }
}
