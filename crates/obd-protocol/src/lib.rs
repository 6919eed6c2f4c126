//! OBD-II Protocol Implementation
//!
//! This crate provides async serial/Bluetooth communication with
//! ELM327-compatible OBD-II adapters: the port transport, the adapter
//! handshake, classification of adapter replies and the catalog of
//! standard PIDs and VAG data identifiers.

mod catalog;
mod classify;
mod connection;
mod error;
mod protocol;
mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use catalog::{
    Category, Formula, ParameterCatalog, ParameterDefinition, ParameterKind, Value, COMMON_PIDS,
    TEMPERATURE_PIDS, VAG_OIL_TEMP_DIDS,
};
pub use classify::{classify, find_token, is_informational, AdapterError, Classification};
pub use connection::{
    AdapterInfo, AdapterResponse, Command, Connection, ConnectionConfig, ConnectionManager,
    InitStep, LinkState,
};
pub use error::{nrc_reason, ObdError};
pub use protocol::ProtocolMode;
pub use transport::{PlatformHint, RawResponse, Transport, PROMPT};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Offset added to the mode in a positive reply
    pub const RESPONSE_OFFSET: u8 = 0x40;
}

/// UDS (ISO 14229) service constants
pub mod service {
    /// DiagnosticSessionControl
    pub const SESSION_CONTROL: u8 = 0x10;
    /// ReadDataByIdentifier
    pub const READ_DATA_BY_ID: u8 = 0x22;
    /// Negative response service identifier
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// NRC: sub-function not supported in the active session
    pub const SUB_FUNCTION_NOT_SUPPORTED_IN_SESSION: u8 = 0x7E;
    /// NRC: service not supported in the active session
    pub const SERVICE_NOT_SUPPORTED_IN_SESSION: u8 = 0x7F;
    /// Extended diagnostic session sub-function
    pub const EXTENDED_SESSION: u8 = 0x03;
    /// Default session sub-function
    pub const DEFAULT_SESSION: u8 = 0x01;
}
