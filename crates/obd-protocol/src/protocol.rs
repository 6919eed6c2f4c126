//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Vehicle protocols selectable on an ELM327 with `ATSP<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud), the default for modern VAG cars
    #[default]
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939Can,
    /// User-defined CAN slot 1
    User1Can,
    /// User-defined CAN slot 2
    User2Can,
}

impl ProtocolMode {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ProtocolMode::Auto => "ATSP0",
            ProtocolMode::J1850Pwm => "ATSP1",
            ProtocolMode::J1850Vpw => "ATSP2",
            ProtocolMode::Iso9141_2 => "ATSP3",
            ProtocolMode::Iso14230_4Kwp => "ATSP4",
            ProtocolMode::Iso14230_4KwpFast => "ATSP5",
            ProtocolMode::Iso15765_4Can11bit500 => "ATSP6",
            ProtocolMode::Iso15765_4Can29bit500 => "ATSP7",
            ProtocolMode::Iso15765_4Can11bit250 => "ATSP8",
            ProtocolMode::Iso15765_4Can29bit250 => "ATSP9",
            ProtocolMode::SaeJ1939Can => "ATSPA",
            ProtocolMode::User1Can => "ATSPB",
            ProtocolMode::User2Can => "ATSPC",
        }
    }

    /// Parse the protocol number reported by `ATDPN` (an `A` prefix means
    /// the adapter picked it automatically)
    pub fn from_elm_number(text: &str) -> Option<Self> {
        let upper = text.trim().to_ascii_uppercase();
        let digit = match upper.len() {
            2 => upper.strip_prefix('A').unwrap_or(upper.as_str()),
            _ => upper.as_str(),
        };
        let mode = match digit {
            "0" => ProtocolMode::Auto,
            "1" => ProtocolMode::J1850Pwm,
            "2" => ProtocolMode::J1850Vpw,
            "3" => ProtocolMode::Iso9141_2,
            "4" => ProtocolMode::Iso14230_4Kwp,
            "5" => ProtocolMode::Iso14230_4KwpFast,
            "6" => ProtocolMode::Iso15765_4Can11bit500,
            "7" => ProtocolMode::Iso15765_4Can29bit500,
            "8" => ProtocolMode::Iso15765_4Can11bit250,
            "9" => ProtocolMode::Iso15765_4Can29bit250,
            "A" => ProtocolMode::SaeJ1939Can,
            "B" => ProtocolMode::User1Can,
            "C" => ProtocolMode::User2Can,
            _ => return None,
        };
        Some(mode)
    }

    /// Human-readable protocol name
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMode::Auto => "Automatic",
            ProtocolMode::J1850Pwm => "SAE J1850 PWM",
            ProtocolMode::J1850Vpw => "SAE J1850 VPW",
            ProtocolMode::Iso9141_2 => "ISO 9141-2",
            ProtocolMode::Iso14230_4Kwp => "ISO 14230-4 KWP (5 baud init)",
            ProtocolMode::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            ProtocolMode::Iso15765_4Can11bit500 => "ISO 15765-4 CAN (11 bit, 500 kbaud)",
            ProtocolMode::Iso15765_4Can29bit500 => "ISO 15765-4 CAN (29 bit, 500 kbaud)",
            ProtocolMode::Iso15765_4Can11bit250 => "ISO 15765-4 CAN (11 bit, 250 kbaud)",
            ProtocolMode::Iso15765_4Can29bit250 => "ISO 15765-4 CAN (29 bit, 250 kbaud)",
            ProtocolMode::SaeJ1939Can => "SAE J1939 CAN",
            ProtocolMode::User1Can => "User1 CAN",
            ProtocolMode::User2Can => "User2 CAN",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ProtocolMode::Iso15765_4Can11bit500
                | ProtocolMode::Iso15765_4Can29bit500
                | ProtocolMode::Iso15765_4Can11bit250
                | ProtocolMode::Iso15765_4Can29bit250
                | ProtocolMode::SaeJ1939Can
                | ProtocolMode::User1Can
                | ProtocolMode::User2Can
        )
    }
}
