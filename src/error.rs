use std::fmt;
use std::io;
use std::panic::Location;

use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};

/// Category tag carried by every proxy error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP/IO failures: connect, peek, read, write, resolve
    Network,
    /// TLS / WebSocket handshake and framing failures
    Protocol,
    /// Policy violations: blacklist hits, configuration failures
    Security,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Security => "SECURITY",
        };
        f.write_str(tag)
    }
}

/// Error type for the whole proxy pipeline
///
/// Carries a free-form message, a category tag and the source location of the
/// construction site (captured via `#[track_caller]`).
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {message} ({location})")]
pub struct ProxyError {
    kind: ErrorKind,
    message: String,
    location: &'static Location<'static>,
}

impl ProxyError {
    #[track_caller]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn security(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Security,
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source location where the error was constructed
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Check whether an I/O error indicates normal termination or cancellation
///
/// Graceful errors are never escalated to a [`ProxyError`]; every read and
/// write in the pipeline consults this before deciding whether to propagate.
pub fn is_graceful_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Graceful classification for WebSocket errors
///
/// A closed stream (in either tungstenite's or the transport's eyes) counts
/// as a normal end of traffic, not a failure.
pub fn is_graceful_ws(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io_err) => is_graceful_io(io_err),
        _ => false,
    }
}
