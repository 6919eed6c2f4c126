//! Parameter readings

use obd_protocol::{ObdError, ParameterDefinition, ParameterKind, Value};
use serde::{Serialize, Serializer};
use std::fmt;

/// Result of one read call.
///
/// Failures are carried inline: `is_valid()` is false and `error()` says why.
/// A reading is never modified after it is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    id: u16,
    kind: ParameterKind,
    name: &'static str,
    unit: &'static str,
    #[serde(serialize_with = "hex_bytes")]
    raw: Vec<u8>,
    value: Option<Value>,
    valid: bool,
    #[serde(serialize_with = "error_text")]
    error: Option<ObdError>,
    timestamp_ms: u64,
}

impl Reading {
    /// Decode `outcome` (the data bytes after the reply header) with `def`
    pub(crate) fn from_outcome(def: &ParameterDefinition, outcome: Result<Vec<u8>, ObdError>) -> Self {
        let (raw, decoded) = match outcome {
            Ok(raw) => {
                let decoded = def.decode(&raw);
                (raw, decoded)
            }
            Err(e) => (Vec::new(), Err(e)),
        };

        let (value, error) = match decoded {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };

        Self {
            id: def.id,
            kind: def.kind,
            name: def.name,
            unit: def.unit,
            raw,
            valid: value.is_some(),
            value,
            error,
            timestamp_ms: now_ms(),
        }
    }

    /// A reading for an identifier the catalog does not know
    pub(crate) fn unknown(id: u16, kind: ParameterKind, error: ObdError) -> Self {
        Self {
            id,
            kind,
            name: "Unknown",
            unit: "",
            raw: Vec::new(),
            value: None,
            valid: false,
            error: Some(error),
            timestamp_ms: now_ms(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    /// Data bytes after the reply header
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&ObdError> {
        self.error.as_ref()
    }

    /// Capture time, Unix milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.value, &self.error) {
            (Some(value), _) if self.unit.is_empty() => write!(f, "{}: {}", self.name, value),
            (Some(value), _) => write!(f, "{}: {} {}", self.name, value, self.unit),
            (None, Some(error)) => write!(f, "{}: N/A ({})", self.name, error),
            (None, None) => write!(f, "{}: N/A", self.name),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&crate::response::hex(bytes))
}

fn error_text<S: Serializer>(error: &Option<ObdError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}
