use std::{fmt, result, sync::mpsc};

use serde::{Deserialize, Serialize};

use crate::codec::DeviceErrorCode;

pub type Result<T> = result::Result<T, Error>;

/// Error kinds surfaced by the gateway core
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The transport is not live
    NotConnected,
    /// The connection has not completed synchronization
    NotSynchronized,
    /// A bounded wait elapsed
    Timeout,
    /// The operation was cancelled by shutdown or disconnect
    Cancelled,
    /// No block with the given string id
    UnknownSid,
    /// No block with the given numeric id
    UnknownNid,
    /// The string id is already in use
    DuplicateSid,
    /// The numeric id is already in use
    DuplicateNid,
    /// No schema descriptor for the block type
    UnknownType,
    /// A typed link could not be resolved
    UnknownLink,
    /// A quantity carried an unrecognized unit
    UnknownUnit,
    /// A scaled value does not fit its wire integer
    OutOfRange,
    /// A frame or record could not be decoded
    MalformedFrame,
    /// The controller replied with a non-zero error code
    CommandFailed(DeviceErrorCode),
    /// The handshake protocol version does not match [crate::PROTO_VERSION]
    IncompatibleFirmware,
    /// The handshake device id does not match the configured id
    InvalidDeviceId,
    /// Device discovery found no single usable device
    DiscoveryAborted,
    /// The peer closed or answered with the wrong protocol
    ConnectionReset,
    /// A firmware transfer was aborted
    UpdateFailed,
    /// Generic failure code
    Failure,
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotConnected => "NOT_CONNECTED",
            ErrorKind::NotSynchronized => "NOT_SYNCHRONIZED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::UnknownSid => "UNKNOWN_SID",
            ErrorKind::UnknownNid => "UNKNOWN_NID",
            ErrorKind::DuplicateSid => "DUPLICATE_SID",
            ErrorKind::DuplicateNid => "DUPLICATE_NID",
            ErrorKind::UnknownType => "UNKNOWN_TYPE",
            ErrorKind::UnknownLink => "UNKNOWN_LINK",
            ErrorKind::UnknownUnit => "UNKNOWN_UNIT",
            ErrorKind::OutOfRange => "OUT_OF_RANGE",
            ErrorKind::MalformedFrame => "MALFORMED_FRAME",
            ErrorKind::CommandFailed(_) => "COMMAND_FAILED",
            ErrorKind::IncompatibleFirmware => "INCOMPATIBLE_FIRMWARE",
            ErrorKind::InvalidDeviceId => "INVALID_DEVICE_ID",
            ErrorKind::DiscoveryAborted => "DISCOVERY_ABORTED",
            ErrorKind::ConnectionReset => "CONNECTION_RESET",
            ErrorKind::UpdateFailed => "UPDATE_FAILED",
            ErrorKind::Failure => "FAILURE",
        }
    }
}

impl From<&ErrorKind> for &'static str {
    fn from(kind: &ErrorKind) -> Self {
        (*kind).into()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed(code) => write!(f, "COMMAND_FAILED({code})"),
            kind => write!(f, "{}", <&'static str>::from(kind)),
        }
    }
}

/// Error type shared by every layer of the gateway
#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    /// Create an Error with the given kind
    pub fn new<S>(kind: ErrorKind, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a generic failure Error
    pub fn failure<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorKind::Failure, message)
    }

    /// Create a timeout Error
    pub fn timeout<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Create a not-connected Error
    pub fn not_connected<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorKind::NotConnected, message)
    }

    /// Create a cancelled Error
    pub fn cancelled<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Create a malformed-frame Error
    pub fn malformed<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorKind::MalformedFrame, message)
    }

    /// Create an Error for a non-zero controller error code
    pub fn command_failed(code: DeviceErrorCode) -> Self {
        Self::new(
            ErrorKind::CommandFailed(code),
            format!("controller error: {code}"),
        )
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind: {}, message: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(format!("I/O timeout: {err}"))
            }
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                Self::new(ErrorKind::ConnectionReset, format!("I/O error: {err}"))
            }
            _ => Self::failure(format!("I/O error: {err}")),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::failure(format!("serial port error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::failure(format!("JSON error: {err}"))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Self::malformed(format!("hex error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("datastore timeout: {err}"))
        } else {
            Self::failure(format!("datastore error: {err}"))
        }
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Self::failure(format!("datetime error: {err}"))
    }
}

impl<T> From<mpsc::SendError<T>> for Error {
    fn from(err: mpsc::SendError<T>) -> Self {
        Self::not_connected(format!("failed to send an item to the queue: {err}"))
    }
}

impl From<mpsc::RecvTimeoutError> for Error {
    fn from(err: mpsc::RecvTimeoutError) -> Self {
        match err {
            mpsc::RecvTimeoutError::Timeout => Self::timeout("queue receive timed out"),
            mpsc::RecvTimeoutError::Disconnected => Self::cancelled("queue sender dropped"),
        }
    }
}

impl From<mpsc::RecvError> for Error {
    fn from(_err: mpsc::RecvError) -> Self {
        Self::cancelled("queue sender dropped")
    }
}
