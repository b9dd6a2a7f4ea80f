//! Client error type.
//!
//! Every failure the engine surfaces carries the wire status it would have
//! (or did) travel with, so callers can branch on the errno-style code no
//! matter whether the failure came from a replica, the transport, or was
//! synthesized locally.

use std::fmt;

use strand_proto::{ErrorCode, WireError};

/// A reply-shaped error: wire status plus a human-readable message.
///
/// Cloneable on purpose; terminal errors fan out to every subscriber of an
/// async result.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
pub struct Error {
    status: i32,
    message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status(),
            message: message.into(),
        }
    }

    pub fn from_status(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Wire status, negative.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Known code for this status, if it is one the engine defines.
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_status(self.status)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.status == code.status()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.status)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {{ status: {}, message: {:?} }}", self.status, self.message)
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::new(ErrorCode::Protocol, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
