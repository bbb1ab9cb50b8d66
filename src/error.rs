// Maps every failure the server can hit onto a TFTP error code and message.
//
// Storage failures arrive as io::Error and are classified by kind. Protocol violations are
// raised directly with the matching code. Whatever the source, the result is exactly one ERROR
// packet for the peer.

use crate::tftp::{self, ErrorCode};
use std::error;
use std::fmt;
use std::io;

/// Message used when an unanticipated failure is reported to the peer.
const UNEXPECTED_ERROR: &str = "Unexpected error.";

/// A failure that ends a session, ready to be reported to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    code: ErrorCode,
    message: String,
}

impl TftpError {
    /// Builds an error carrying the canonical message for `code`.
    pub fn new(code: ErrorCode) -> TftpError {
        if code == ErrorCode::Undefined {
            return TftpError::undefined(UNEXPECTED_ERROR);
        }
        TftpError { code, message: code.message().to_string() }
    }

    /// Builds an Undefined error with a caller-supplied message.
    pub fn undefined(message: impl Into<String>) -> TftpError {
        TftpError { code: ErrorCode::Undefined, message: message.into() }
    }

    /// Builds an Illegal operation error with a more specific message than the canonical one.
    pub fn illegal(message: impl Into<String>) -> TftpError {
        TftpError { code: ErrorCode::IllegalOperation, message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The ERROR packet that reports this failure.
    pub fn to_response(&self) -> tftp::Response {
        tftp::Response::Error { code: self.code, message: self.message.clone() }
    }
}

impl error::Error for TftpError {}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TFTP Error ({}): {}", self.code as u16, self.message)
    }
}

impl From<io::Error> for TftpError {
    fn from(e: io::Error) -> TftpError {
        match ErrorCode::from(e.kind()) {
            ErrorCode::Undefined => {
                log::warn!("Unexpected storage error: {e}");
                TftpError::undefined(UNEXPECTED_ERROR)
            }
            code => TftpError::new(code),
        }
    }
}

impl From<tftp::PacketError> for TftpError {
    fn from(e: tftp::PacketError) -> TftpError {
        TftpError::undefined(e.to_string())
    }
}
