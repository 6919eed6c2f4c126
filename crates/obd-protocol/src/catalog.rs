//! OBD-II PID and VAG DID Definitions
//!
//! Defines the standard Mode 01 Parameter IDs and the vendor-specific UDS data
//! identifiers together with their decoding formulas. Every formula is a pure
//! function of the payload bytes.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// How a parameter is requested from the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// OBD-II Mode 01 PID (one byte identifier)
    StandardPid,
    /// UDS ReadDataByIdentifier DID (two byte identifier)
    VagDid,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::StandardPid => f.write_str("PID"),
            ParameterKind::VagDid => f.write_str("DID"),
        }
    }
}

/// Grouping used by display collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Engine,
    Fuel,
    Temperature,
    Pressure,
    Electrical,
    Emissions,
    Speed,
    Identification,
}

/// Decoding formula, named after the SAE J1979 / VAG conventions.
///
/// `A`, `B` denote the first and second payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Formula {
    /// A
    Raw,
    /// A - 40
    Temperature,
    /// A * 100 / 255
    Percent,
    /// (A - 128) * 100 / 128
    PercentCentered,
    /// ((A * 256) + B) / 4
    Rpm,
    /// A / 2 - 64
    TimingAdvance,
    /// ((A * 256) + B) / 100
    AirFlow,
    /// ((A * 256) + B) * 10
    FuelRailPressure,
    /// ((A * 256) + B) / 1000
    ModuleVoltage,
    /// ((A * 256) + B) / 10 - 40
    CatalystTemperature,
    /// ((A * 256) + B) / 20
    FuelRate,
    /// A - 125
    TorquePercent,
    /// (A * 256) + B
    Word,
    /// ((A * 256) + B) * 100 / 255
    AbsoluteLoad,
    /// ((A * 256) + B) * 0.1
    BoostPressure,
    /// A * 0.75 - 48
    IgnitionAngle,
    /// Printable ASCII, NUL padding stripped
    Ascii,
}

/// A decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Numeric(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Numeric(v) => write!(f, "{:.1}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl Formula {
    /// Minimum number of payload bytes the formula reads
    pub fn min_bytes(&self) -> usize {
        match self {
            Formula::Raw
            | Formula::Temperature
            | Formula::Percent
            | Formula::PercentCentered
            | Formula::TimingAdvance
            | Formula::TorquePercent
            | Formula::IgnitionAngle
            | Formula::Ascii => 1,
            _ => 2,
        }
    }

    /// Decode payload bytes. Returns `None` when there are too few bytes.
    pub fn decode(&self, bytes: &[u8]) -> Option<Value> {
        if bytes.len() < self.min_bytes() {
            return None;
        }
        let a = bytes[0] as f64;
        let word = || (bytes[0] as f64 * 256.0) + bytes[1] as f64;

        let value = match self {
            Formula::Raw => a,
            Formula::Temperature => a - 40.0,
            Formula::Percent => a * 100.0 / 255.0,
            Formula::PercentCentered => (a - 128.0) * 100.0 / 128.0,
            Formula::Rpm => word() / 4.0,
            Formula::TimingAdvance => a / 2.0 - 64.0,
            Formula::AirFlow => word() / 100.0,
            Formula::FuelRailPressure => word() * 10.0,
            Formula::ModuleVoltage => word() / 1000.0,
            Formula::CatalystTemperature => word() / 10.0 - 40.0,
            Formula::FuelRate => word() / 20.0,
            Formula::TorquePercent => a - 125.0,
            Formula::Word => word(),
            Formula::AbsoluteLoad => word() * 100.0 / 255.0,
            Formula::BoostPressure => word() * 0.1,
            Formula::IgnitionAngle => a * 0.75 - 48.0,
            Formula::Ascii => {
                let text: String = bytes
                    .iter()
                    .filter(|b| b.is_ascii_graphic() || **b == b' ')
                    .map(|&b| b as char)
                    .collect();
                return Some(Value::Text(text.trim().to_string()));
            }
        };
        Some(Value::Numeric(value))
    }
}

/// Static description of one readable parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterDefinition {
    /// PID (0x00-0xFF) or DID (0x0000-0xFFFF)
    pub id: u16,
    pub kind: ParameterKind,
    pub name: &'static str,
    pub short_name: &'static str,
    pub unit: &'static str,
    pub category: Category,
    /// Number of data bytes the ECU returns after the header
    pub response_len: usize,
    pub formula: Formula,
    /// DID only readable in the extended diagnostic session
    pub requires_extended_session: bool,
}

impl ParameterDefinition {
    const fn pid(
        id: u8,
        name: &'static str,
        short_name: &'static str,
        unit: &'static str,
        category: Category,
        response_len: usize,
        formula: Formula,
    ) -> Self {
        Self {
            id: id as u16,
            kind: ParameterKind::StandardPid,
            name,
            short_name,
            unit,
            category,
            response_len,
            formula,
            requires_extended_session: false,
        }
    }

    const fn did(
        id: u16,
        name: &'static str,
        short_name: &'static str,
        unit: &'static str,
        category: Category,
        response_len: usize,
        formula: Formula,
    ) -> Self {
        Self {
            id,
            kind: ParameterKind::VagDid,
            name,
            short_name,
            unit,
            category,
            response_len,
            formula,
            requires_extended_session: false,
        }
    }

    const fn extended(self) -> Self {
        Self {
            requires_extended_session: true,
            ..self
        }
    }

    /// Request text sent to the adapter (`010C`, `22F486`)
    pub fn request(&self) -> String {
        match self.kind {
            ParameterKind::StandardPid => format!("{:02X}{:02X}", crate::mode::CURRENT_DATA, self.id),
            ParameterKind::VagDid => format!("{:02X}{:04X}", crate::service::READ_DATA_BY_ID, self.id),
        }
    }

    /// Decode a payload, checking the expected length first
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, ObdError> {
        if bytes.len() < self.response_len {
            return Err(ObdError::MalformedResponse(format!(
                "{} {:#06X}: expected {} data bytes, got {}",
                self.kind,
                self.id,
                self.response_len,
                bytes.len()
            )));
        }
        let data = match self.formula {
            Formula::Ascii => bytes,
            _ => &bytes[..self.response_len],
        };
        self.formula.decode(data).ok_or_else(|| {
            ObdError::MalformedResponse(format!("{} {:#06X}: formula needs more bytes", self.kind, self.id))
        })
    }
}

const STANDARD_PIDS: &[ParameterDefinition] = &[
    ParameterDefinition::pid(0x04, "Calculated Engine Load", "Load", "%", Category::Engine, 1, Formula::Percent),
    ParameterDefinition::pid(0x05, "Engine Coolant Temperature", "Coolant", "°C", Category::Temperature, 1, Formula::Temperature),
    ParameterDefinition::pid(0x06, "Short Term Fuel Trim Bank 1", "STFT B1", "%", Category::Fuel, 1, Formula::PercentCentered),
    ParameterDefinition::pid(0x07, "Long Term Fuel Trim Bank 1", "LTFT B1", "%", Category::Fuel, 1, Formula::PercentCentered),
    ParameterDefinition::pid(0x0B, "Intake Manifold Pressure", "MAP", "kPa", Category::Pressure, 1, Formula::Raw),
    ParameterDefinition::pid(0x0C, "Engine RPM", "RPM", "rpm", Category::Engine, 2, Formula::Rpm),
    ParameterDefinition::pid(0x0D, "Vehicle Speed", "Speed", "km/h", Category::Speed, 1, Formula::Raw),
    ParameterDefinition::pid(0x0E, "Timing Advance", "Timing", "°", Category::Engine, 1, Formula::TimingAdvance),
    ParameterDefinition::pid(0x0F, "Intake Air Temperature", "IAT", "°C", Category::Temperature, 1, Formula::Temperature),
    ParameterDefinition::pid(0x10, "MAF Air Flow Rate", "MAF", "g/s", Category::Engine, 2, Formula::AirFlow),
    ParameterDefinition::pid(0x11, "Throttle Position", "TPS", "%", Category::Engine, 1, Formula::Percent),
    ParameterDefinition::pid(0x1F, "Run Time Since Engine Start", "Runtime", "s", Category::Engine, 2, Formula::Word),
    ParameterDefinition::pid(0x23, "Fuel Rail Gauge Pressure", "FRP", "kPa", Category::Fuel, 2, Formula::FuelRailPressure),
    ParameterDefinition::pid(0x2F, "Fuel Tank Level", "Fuel", "%", Category::Fuel, 1, Formula::Percent),
    ParameterDefinition::pid(0x33, "Barometric Pressure", "Baro", "kPa", Category::Pressure, 1, Formula::Raw),
    ParameterDefinition::pid(0x3C, "Catalyst Temp Bank 1 Sensor 1", "Cat B1S1", "°C", Category::Emissions, 2, Formula::CatalystTemperature),
    ParameterDefinition::pid(0x3D, "Catalyst Temp Bank 2 Sensor 1", "Cat B2S1", "°C", Category::Emissions, 2, Formula::CatalystTemperature),
    ParameterDefinition::pid(0x3E, "Catalyst Temp Bank 1 Sensor 2", "Cat B1S2", "°C", Category::Emissions, 2, Formula::CatalystTemperature),
    ParameterDefinition::pid(0x3F, "Catalyst Temp Bank 2 Sensor 2", "Cat B2S2", "°C", Category::Emissions, 2, Formula::CatalystTemperature),
    ParameterDefinition::pid(0x42, "Control Module Voltage", "Voltage", "V", Category::Electrical, 2, Formula::ModuleVoltage),
    ParameterDefinition::pid(0x43, "Absolute Load Value", "Abs Load", "%", Category::Engine, 2, Formula::AbsoluteLoad),
    ParameterDefinition::pid(0x46, "Ambient Air Temperature", "Ambient", "°C", Category::Temperature, 1, Formula::Temperature),
    ParameterDefinition::pid(0x5C, "Engine Oil Temperature", "Oil Temp", "°C", Category::Temperature, 1, Formula::Temperature),
    ParameterDefinition::pid(0x5E, "Engine Fuel Rate", "Fuel Rate", "L/h", Category::Fuel, 2, Formula::FuelRate),
    ParameterDefinition::pid(0x62, "Actual Engine Torque", "Torque %", "%", Category::Engine, 1, Formula::TorquePercent),
    ParameterDefinition::pid(0x63, "Engine Reference Torque", "Ref Torque", "Nm", Category::Engine, 2, Formula::Word),
];

// MK5 GTI (EA113 2.0T FSI / Bosch MED9.1)
const VAG_DIDS: &[ParameterDefinition] = &[
    ParameterDefinition::did(0xF486, "Engine Oil Temperature", "Oil Temp", "°C", Category::Temperature, 1, Formula::Temperature),
    ParameterDefinition::did(0xF40E, "Oil Temperature (Alt)", "Oil Temp", "°C", Category::Temperature, 1, Formula::Temperature).extended(),
    ParameterDefinition::did(0x2028, "Oil Temperature (2028)", "Oil Temp", "°C", Category::Temperature, 1, Formula::Temperature).extended(),
    ParameterDefinition::did(0x1040, "Oil Temperature (1040)", "Oil Temp", "°C", Category::Temperature, 1, Formula::Temperature).extended(),
    ParameterDefinition::did(0xF406, "Boost Pressure Actual", "Boost", "mbar", Category::Pressure, 2, Formula::BoostPressure),
    ParameterDefinition::did(0xF41F, "Ignition Timing Cylinder 1", "Ign Cyl1", "°", Category::Engine, 1, Formula::IgnitionAngle).extended(),
    ParameterDefinition::did(0xF189, "ECU Software Version", "SW Ver", "", Category::Identification, 1, Formula::Ascii),
    ParameterDefinition::did(0xF190, "VIN", "VIN", "", Category::Identification, 17, Formula::Ascii),
];

/// PIDs polled by default: load, coolant, MAP, RPM, speed, IAT, MAF, TPS
pub const COMMON_PIDS: &[u8] = &[0x04, 0x05, 0x0B, 0x0C, 0x0D, 0x0F, 0x10, 0x11];

/// Standard PIDs reporting a temperature: coolant, IAT, ambient, oil
pub const TEMPERATURE_PIDS: &[u8] = &[0x05, 0x0F, 0x46, 0x5C];

/// VAG DIDs known to carry the engine oil temperature, most reliable first
pub const VAG_OIL_TEMP_DIDS: &[u16] = &[0xF486, 0xF40E, 0x2028, 0x1040];

/// Registry of parameter definitions keyed by (kind, id)
#[derive(Debug)]
pub struct ParameterCatalog {
    entries: HashMap<(ParameterKind, u16), ParameterDefinition>,
}

impl ParameterCatalog {
    /// Build a catalog from a table. Later duplicates of a (kind, id) key are
    /// rejected so lookups stay unambiguous.
    pub fn from_table(table: &[ParameterDefinition]) -> Result<Self, ObdError> {
        let mut entries = HashMap::with_capacity(table.len());
        for def in table {
            if entries.insert((def.kind, def.id), *def).is_some() {
                return Err(ObdError::MalformedResponse(format!(
                    "duplicate catalog entry for {} {:#06X}",
                    def.kind, def.id
                )));
            }
        }
        Ok(Self { entries })
    }

    /// The built-in catalog, built on first use and never mutated afterwards
    pub fn builtin() -> &'static ParameterCatalog {
        static CATALOG: OnceLock<ParameterCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| {
            let mut entries = HashMap::with_capacity(STANDARD_PIDS.len() + VAG_DIDS.len());
            for def in STANDARD_PIDS.iter().chain(VAG_DIDS) {
                entries.insert((def.kind, def.id), *def);
            }
            ParameterCatalog { entries }
        })
    }

    /// Look up a definition
    pub fn lookup(&self, id: u16, kind: ParameterKind) -> Result<&ParameterDefinition, ObdError> {
        self.entries
            .get(&(kind, id))
            .ok_or(ObdError::UnknownParameter { id, kind })
    }

    /// All definitions of one kind, ordered by identifier
    pub fn all(&self, kind: ParameterKind) -> Vec<&ParameterDefinition> {
        let mut defs: Vec<_> = self.entries.values().filter(|d| d.kind == kind).collect();
        defs.sort_by_key(|d| d.id);
        defs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
