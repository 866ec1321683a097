//! Stable error taxonomy surfaced to callers (spec.md §7).
//!
//! Every lower-level error is classified into one of these kinds at the
//! boundary of the component that produced it; raw transport/codec errors
//! never escape a component unconverted.

use std::fmt;

/// Closed set of error kinds. Adding a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParam,
    NotInitialised,
    InvalidState,
    NotRegistered,
    AuthFailed,
    Network,
    Protocol,
    Timeout,
    Memory,
    Crypto,
    NotConnected,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidParam => "invalid_param",
            ErrorKind::NotInitialised => "not_initialised",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::NotRegistered => "not_registered",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Memory => "memory",
            ErrorKind::Crypto => "crypto",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// A classified error with a human-readable message.
///
/// This is the only error type that crosses the session-machine boundary to
/// the UI/driver callback; every component-local error type converts into it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParam, message)
    }

    pub fn not_registered(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotRegistered, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Crypto, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::network(err.to_string())
    }
}
