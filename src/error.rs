//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 7540 Section 7.

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream closed (RFC 7540 Section 7 - Error code 0x5)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Refused stream (RFC 7540 Section 7 - Error code 0x7)
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Stream cancelled (RFC 7540 Section 7 - Error code 0x8)
    #[error("Stream cancelled: {0}")]
    Cancel(u32),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// A connection-level failure carrying the code that was (or must be)
    /// sent in GOAWAY.
    #[error("Connection error: {0}")]
    Connection(ErrorCode),

    /// A stream-level failure carrying the code sent in RST_STREAM.
    #[error("Stream {0} error: {1}")]
    Stream(u32, ErrorCode),

    /// Invalid stream ID
    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    /// Connection not ready
    #[error("Connection not ready")]
    NotReady,

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Too many streams
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Missing or malformed connection preface
    #[error("Missing connection preface")]
    MissingPreface,

    /// Invalid header
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// h2c upgrade exchange failed
    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),
}

impl Error {
    /// Map this error onto the RFC 7540 error code it corresponds to.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::Internal(_) => ErrorCode::InternalError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::RefusedStream(_) => ErrorCode::RefusedStream,
            Error::Cancel(_) => ErrorCode::Cancel,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Connection(code) => *code,
            Error::Stream(_, code) => *code,
            _ => ErrorCode::InternalError,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    ///
    /// Unknown codes map to `InternalError` so that a GOAWAY or RST_STREAM
    /// carrying a code from a future RFC still fails the right scope.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Severity of a framing error (RFC 7540 Section 5.4).
///
/// A connection-scoped error tears the whole engine down with GOAWAY; a
/// stream-scoped error resets only the offending stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Connection,
    Stream,
}

/// Classify a FRAME_SIZE_ERROR raised for the given frame type and stream.
///
/// RFC 7540 Section 4.2: a frame size error in a frame that could alter the
/// state of the entire connection (HEADERS, SETTINGS, PUSH_PROMISE,
/// WINDOW_UPDATE) MUST be treated as a connection error.
pub fn frame_size_error_scope(frame_type: u8, stream_id: u32) -> ErrorScope {
    use crate::frames::FrameType;
    if stream_id == 0 {
        return ErrorScope::Connection;
    }
    match FrameType::from_u8(frame_type) {
        Some(FrameType::Headers)
        | Some(FrameType::Settings)
        | Some(FrameType::PushPromise)
        | Some(FrameType::WindowUpdate) => ErrorScope::Connection,
        _ => ErrorScope::Stream,
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 0x1);
        assert_eq!(ErrorCode::Http11Required.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from_u32(0x9), ErrorCode::CompressionError);
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_name() {
        assert_eq!(ErrorCode::NoError.name(), "NO_ERROR");
        assert_eq!(ErrorCode::ProtocolError.name(), "PROTOCOL_ERROR");
        assert_eq!(ErrorCode::FlowControlError.name(), "FLOW_CONTROL_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("test error".to_string());
        assert_eq!(err.to_string(), "Protocol error: test error");

        let err = Error::StreamClosed(42);
        assert_eq!(err.to_string(), "Stream closed: 42");
    }

    #[test]
    fn test_frame_size_error_scope() {
        // Stream-scoped for DATA on a stream.
        assert_eq!(frame_size_error_scope(0x0, 1), ErrorScope::Stream);
        // Connection-scoped for the four state-bearing types.
        assert_eq!(frame_size_error_scope(0x1, 1), ErrorScope::Connection);
        assert_eq!(frame_size_error_scope(0x4, 0), ErrorScope::Connection);
        assert_eq!(frame_size_error_scope(0x5, 3), ErrorScope::Connection);
        assert_eq!(frame_size_error_scope(0x8, 3), ErrorScope::Connection);
        // Anything on stream 0 fails the connection.
        assert_eq!(frame_size_error_scope(0x0, 0), ErrorScope::Connection);
    }

    #[test]
    fn test_error_to_code_mapping() {
        assert_eq!(
            Error::Compression("bad index".into()).error_code(),
            ErrorCode::CompressionError
        );
        assert_eq!(
            Error::Stream(3, ErrorCode::StreamClosed).error_code(),
            ErrorCode::StreamClosed
        );
    }
}
