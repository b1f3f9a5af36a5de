//! Error types for the conditional access manager.

use thiserror::Error;

/// Errors raised while encoding or decoding the application message catalog.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid magic bytes in frame header.
    #[error("Invalid magic bytes: expected 'CAMB', got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Message type is unknown or unsupported.
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Message type exists but travels in the other direction.
    #[error("Message type {0} is not valid in this direction")]
    WrongDirection(&'static str),

    /// Frame payload is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// Frame payload is incomplete.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Failed to decode message payload.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    /// Failed to encode message payload.
    #[error("Failed to encode message: {0}")]
    EncodeError(String),
}

/// Errors returned by every CA manager, plug-in and codec operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaError {
    /// The back-end does not implement this capability.
    #[error("Operation not supported")]
    NotSupported,

    /// The caller passed an invalid argument.
    #[error("Invalid parameter: {0}")]
    BadParam(String),

    /// Unknown plug-in or service.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A plug-in with this name is already registered.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The manager or plug-in is already open.
    #[error("Already open")]
    AlreadyOpen,

    /// The manager or plug-in has not been opened.
    #[error("Not open")]
    NotOpen,

    /// The plug-in is disabled and may not exchange messages.
    #[error("CA {0} is disabled")]
    Disabled(String),

    /// An allocation could not be satisfied.
    #[error("Out of memory")]
    NoMemory,

    /// Malformed message catalog data.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed program map table received from the network.
    #[error("Malformed PMT: {0}")]
    BadPmt(String),

    /// The hardware slot is absent, the card was removed, or a table never arrived.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Waiting for a message or table timed out.
    #[error("Timed out")]
    Timeout,

    /// Back-end specific failure.
    #[error("Back-end error: {0}")]
    Backend(String),
}

impl CaError {
    /// Numeric code used when the error crosses a process boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            CaError::NotSupported => ErrorCode::NotSupported,
            CaError::BadParam(_) => ErrorCode::BadParam,
            CaError::NotFound(_) => ErrorCode::NotFound,
            CaError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            CaError::AlreadyOpen => ErrorCode::AlreadyOpen,
            CaError::NotOpen => ErrorCode::NotOpen,
            CaError::Disabled(_) => ErrorCode::Disabled,
            CaError::NoMemory => ErrorCode::NoMemory,
            CaError::Protocol(_) => ErrorCode::ProtocolError,
            CaError::BadPmt(_) => ErrorCode::BadPmt,
            CaError::Unavailable(_) => ErrorCode::Unavailable,
            CaError::Timeout => ErrorCode::Timeout,
            CaError::Backend(_) => ErrorCode::Unknown,
        }
    }

    /// True for the "capability absent" outcome callers must treat as non-fatal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, CaError::NotSupported)
    }
}

impl From<std::collections::TryReserveError> for CaError {
    fn from(_: std::collections::TryReserveError) -> Self {
        CaError::NoMemory
    }
}

/// Error code carried in replies to out-of-process applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Operation succeeded.
    Success = 0x0000,
    /// Unknown error occurred.
    Unknown = 0x0001,
    NotSupported = 0x0002,
    BadParam = 0x0003,
    NotFound = 0x0004,
    AlreadyExists = 0x0005,
    AlreadyOpen = 0x0006,
    NotOpen = 0x0007,
    Disabled = 0x0008,
    NoMemory = 0x0009,
    ProtocolError = 0x000A,
    BadPmt = 0x000B,
    Unavailable = 0x000C,
    Timeout = 0x000D,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ErrorCode::Success,
            0x0002 => ErrorCode::NotSupported,
            0x0003 => ErrorCode::BadParam,
            0x0004 => ErrorCode::NotFound,
            0x0005 => ErrorCode::AlreadyExists,
            0x0006 => ErrorCode::AlreadyOpen,
            0x0007 => ErrorCode::NotOpen,
            0x0008 => ErrorCode::Disabled,
            0x0009 => ErrorCode::NoMemory,
            0x000A => ErrorCode::ProtocolError,
            0x000B => ErrorCode::BadPmt,
            0x000C => ErrorCode::Unavailable,
            0x000D => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value as u16
    }
}

impl ErrorCode {
    /// Returns true if this error code indicates success.
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}
