// ABOUTME: Crate-wide error types for the BLIP multiplexer
// ABOUTME: Distinguishes fatal wire-level protocol errors from synchronous programming errors

use thiserror::Error;

/// Errors that can terminate a BLIP session or be returned synchronously
/// to a caller that misused the API.
///
/// Wire-level variants (`BadFrame`, `BadData`) are fatal: the connection
/// records the error, closes the transport, and fires `on_close(error)`.
/// `ProgrammingError` is returned synchronously to the offending caller and
/// never closes the connection.
#[derive(Debug, Error)]
pub enum BlipError {
    /// A frame's varint header was malformed or its flags exceeded `MaxFlag`.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A property block or compressed payload could not be decoded.
    #[error("bad data: {0}")]
    BadData(String),

    /// The transport closed, or closed with a non-normal code.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The peer attempted an operation it is not permitted to perform.
    #[error("peer not allowed: {0}")]
    PeerNotAllowed(String),

    /// Catch-all for conditions that don't fit the other variants.
    #[error("internal error: {0}")]
    Misc(String),

    /// I/O failure from the underlying transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller misused the API (double-send, mutate-after-freeze, ...).
    ///
    /// Surfaced synchronously to the caller; does not close the connection.
    #[error("programming error: {0}")]
    ProgrammingError(String),
}

impl BlipError {
    /// The local error code, for diagnostics and for mapping onto a
    /// synthesized ERR response body.
    pub fn code(&self) -> LocalErrorCode {
        match self {
            BlipError::BadFrame(_) => LocalErrorCode::BadFrame,
            BlipError::BadData(_) => LocalErrorCode::BadData,
            BlipError::Disconnected(_) => LocalErrorCode::Disconnected,
            BlipError::PeerNotAllowed(_) => LocalErrorCode::PeerNotAllowed,
            BlipError::Misc(_) | BlipError::Io(_) | BlipError::ProgrammingError(_) => {
                LocalErrorCode::Misc
            }
        }
    }

    /// Whether this error is fatal to the session (should close the transport).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BlipError::ProgrammingError(_))
    }
}

/// Local-only error codes, never placed on the wire directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorCode {
    BadData,
    BadFrame,
    Disconnected,
    PeerNotAllowed,
    Misc,
}

/// Wire-visible error codes carried on ERR responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Forbidden,
    NotFound,
    BadRange,
    HandlerFailed,
    Unspecified,
    Other(u32),
}

impl ErrorCode {
    pub const UNSPECIFIED: u32 = 599;

    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::BadRange => 416,
            ErrorCode::HandlerFailed => 501,
            ErrorCode::Unspecified => Self::UNSPECIFIED,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_u32(code: u32) -> Self {
        match code {
            400 => ErrorCode::BadRequest,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            416 => ErrorCode::BadRange,
            501 => ErrorCode::HandlerFailed,
            Self::UNSPECIFIED => ErrorCode::Unspecified,
            other => ErrorCode::Other(other),
        }
    }
}

/// A specialized `Result` type for BLIP operations.
pub type BlipResult<T> = std::result::Result<T, BlipError>;
