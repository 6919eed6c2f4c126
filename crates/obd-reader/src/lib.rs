//! OBD-II / VAG Diagnostic Reader
//!
//! Reads standard Mode 01 PIDs and VAG UDS data identifiers over an
//! initialized ELM327 connection, scans PID support, decodes stored DTCs and
//! tracks the UDS diagnostic session.

mod dtc;
mod reader;
mod reading;
mod response;

pub use dtc::{decode_dtc, parse_mode03, parse_with_status, DtcRecord};
pub use reader::{DiagnosticReader, DiagnosticSession, ReaderConfig};
pub use reading::Reading;
