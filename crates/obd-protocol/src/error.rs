//! OBD-II Error Types

use crate::classify::AdapterError;
use crate::connection::{InitStep, LinkState};
use crate::catalog::ParameterKind;
use thiserror::Error;

/// Errors that can occur during OBD-II communication
///
/// Connection and protocol errors are fatal to a session. Everything else is
/// recoverable and ends up inside an invalid `Reading` on the reader side.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObdError {
    /// Serial port unavailable, failed to open, or hung up
    #[error("Serial port error: {0}")]
    Connection(String),

    /// Operation not permitted in the current link state
    #[error("Operation not permitted while link is {0:?}")]
    InvalidState(LinkState),

    /// No prompt within the deadline; carries whatever arrived before it
    #[error("Timeout waiting for adapter prompt after {elapsed_ms}ms ({} bytes received)", .partial.len())]
    Timeout { elapsed_ms: u64, partial: Vec<u8> },

    /// Initialization handshake failed
    #[error("Adapter initialization failed at {step}: {response:?}")]
    Protocol { step: InitStep, response: String },

    /// Adapter answered with one of its error tokens
    #[error("Adapter error: {0}")]
    Adapter(AdapterError),

    /// ECU answered with a UDS negative response
    #[error("Negative response to service {service:02X}: {} (NRC {nrc:02X})", nrc_display(.nrc))]
    NegativeResponse { service: u8, nrc: u8 },

    /// Identifier not present in the parameter catalog
    #[error("Unknown {kind} {id:#06X}")]
    UnknownParameter { id: u16, kind: ParameterKind },

    /// Payload could not be parsed or decoded
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ObdError {
    /// Whether this error ends the session rather than a single read
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObdError::Connection(_) | ObdError::InvalidState(_) | ObdError::Protocol { .. }
        )
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Connection(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Connection(err.to_string())
    }
}

impl From<AdapterError> for ObdError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Malformed => ObdError::MalformedResponse("unrecognized adapter output".into()),
            other => ObdError::Adapter(other),
        }
    }
}

fn nrc_display(nrc: &u8) -> &'static str {
    nrc_reason(*nrc)
}

/// Human-readable name for a UDS negative response code (ISO 14229-1)
pub fn nrc_reason(nrc: u8) -> &'static str {
    match nrc {
        0x10 => "general reject",
        0x11 => "service not supported",
        0x12 => "sub-function not supported",
        0x13 => "incorrect message length",
        0x14 => "response too long",
        0x22 => "conditions not correct",
        0x31 => "request out of range",
        0x33 => "security access denied",
        0x78 => "response pending",
        0x7E => "sub-function not supported in active session",
        0x7F => "service not supported in active session",
        _ => "unknown error",
    }
}
