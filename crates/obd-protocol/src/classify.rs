//! Adapter Response Classification
//!
//! Maps the ELM327's textual replies onto a fixed vocabulary so the reader can
//! tell a hex payload apart from an adapter-side failure.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error tokens emitted by ELM327-compatible adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterError {
    /// `NO DATA` (or an empty reply): the ECU did not answer
    NoData,
    /// `UNABLE TO CONNECT`: no protocol could be established with the vehicle
    UnableToConnect,
    /// `?`: the adapter did not understand the command
    UnknownCommand,
    /// `STOPPED`: the request was interrupted
    Stopped,
    /// `BUS INIT: ERROR`: slow/fast init failed on a K-line protocol
    BusInitError,
    /// `CAN ERROR`: bus problem while sending or receiving frames
    CanError,
    /// `BUFFER FULL`: adapter receive buffer overflow
    BufferFull,
    /// bare `ERROR`
    Generic,
    /// Anything else that is neither a token nor a hex payload
    Malformed,
}

impl AdapterError {
    /// The adapter text this variant corresponds to
    pub fn token(&self) -> &'static str {
        match self {
            AdapterError::NoData => "NO DATA",
            AdapterError::UnableToConnect => "UNABLE TO CONNECT",
            AdapterError::UnknownCommand => "?",
            AdapterError::Stopped => "STOPPED",
            AdapterError::BusInitError => "BUS INIT: ERROR",
            AdapterError::CanError => "CAN ERROR",
            AdapterError::BufferFull => "BUFFER FULL",
            AdapterError::Generic => "ERROR",
            AdapterError::Malformed => "MALFORMED",
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Outcome of classifying one adapter reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Hex digits only, ready to be parsed into bytes
    Payload,
    /// An adapter error token (or malformed text)
    Error(AdapterError),
}

impl Classification {
    pub fn is_payload(&self) -> bool {
        matches!(self, Classification::Payload)
    }
}

/// Lines the adapter prints while it works; they carry no payload
pub fn is_informational(line: &str) -> bool {
    let upper = line.trim().to_ascii_uppercase();
    upper.starts_with("SEARCHING")
        || (upper.starts_with("BUS INIT") && upper.ends_with("OK"))
}

/// Classify a reply (one or more lines) from the adapter.
///
/// Total: every input maps to exactly one variant. Informational lines are
/// ignored, multi-frame index prefixes (`0:`) are accepted as payload.
pub fn classify(text: &str) -> Classification {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_informational(l))
        .collect();

    if lines.is_empty() {
        return Classification::Error(AdapterError::NoData);
    }

    if let Some(err) = lines.iter().find_map(|l| match_token(l)) {
        return Classification::Error(err);
    }

    // a bare byte count is only valid as the header of indexed frames
    let well_formed = lines.iter().enumerate().all(|(i, line)| {
        let opens_frames = is_byte_count(line)
            && lines.get(i + 1).map_or(false, |next| next.contains(':'));
        opens_frames || is_hex_line(line)
    });

    if well_formed {
        Classification::Payload
    } else {
        Classification::Error(AdapterError::Malformed)
    }
}

/// Find the first adapter error token in a reply, ignoring everything else
pub fn find_token(text: &str) -> Option<AdapterError> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_informational(l))
        .find_map(match_token)
}

fn match_token(line: &str) -> Option<AdapterError> {
    let upper = line.to_ascii_uppercase();
    let compact: String = upper.split_whitespace().collect::<Vec<_>>().join(" ");

    let err = match compact.as_str() {
        "?" => AdapterError::UnknownCommand,
        s if s.contains("NO DATA") => AdapterError::NoData,
        s if s.contains("UNABLE TO CONNECT") => AdapterError::UnableToConnect,
        s if s.contains("STOPPED") => AdapterError::Stopped,
        s if s.starts_with("BUS INIT") && s.ends_with("ERROR") => AdapterError::BusInitError,
        s if s.contains("CAN ERROR") => AdapterError::CanError,
        s if s.contains("BUFFER FULL") => AdapterError::BufferFull,
        s if s.contains("ERROR") => AdapterError::Generic,
        _ => return None,
    };
    Some(err)
}

/// A payload line: hex digit pairs, optionally after a `N:` frame index
fn is_hex_line(line: &str) -> bool {
    let body = match line.split_once(':') {
        Some((index, rest)) => {
            let index = index.trim();
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_hexdigit()) {
                return false;
            }
            rest
        }
        None => line,
    };

    let digits: Vec<char> = body.chars().filter(|c| !c.is_whitespace()).collect();
    !digits.is_empty() && digits.len() % 2 == 0 && digits.iter().all(char::is_ascii_hexdigit)
}

/// The first line of a multi-frame reply is a bare byte count (`014`)
fn is_byte_count(line: &str) -> bool {
    let t = line.trim();
    t.len() == 3 && t.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_tokens() {
        let cases = [
            ("NO DATA", AdapterError::NoData),
            ("UNABLE TO CONNECT", AdapterError::UnableToConnect),
            ("?", AdapterError::UnknownCommand),
            ("STOPPED", AdapterError::Stopped),
            ("BUS INIT: ERROR", AdapterError::BusInitError),
            ("BUS INIT: ...ERROR", AdapterError::BusInitError),
            ("CAN ERROR", AdapterError::CanError),
            ("BUFFER FULL", AdapterError::BufferFull),
            ("ERROR", AdapterError::Generic),
        ];
        for (text, expected) in cases {
            assert_eq!(classify(text), Classification::Error(expected), "{text}");
        }
    }

    #[test]
    fn test_token_after_searching_line() {
        assert_eq!(
            classify("SEARCHING...\nUNABLE TO CONNECT"),
            Classification::Error(AdapterError::UnableToConnect)
        );
    }

    #[test]
    fn test_hex_payload() {
        assert!(classify("41 0C 1A F8").is_payload());
        assert!(classify("410C1AF8").is_payload());
        assert!(classify("SEARCHING...\n41 05 7B").is_payload());
    }

    #[test]
    fn test_multiframe_payload() {
        let text = "014\n0: 62 F1 90 57 56 57\n1: 5A 5A 5A 31 4B 5A 37\n2: 57 30 30 30 30 30 31";
        assert!(classify(text).is_payload());
    }

    #[test]
    fn test_three_digit_line_is_not_a_payload() {
        for text in ["ABC", "7E8", "012"] {
            assert_eq!(classify(text), Classification::Error(AdapterError::Malformed), "{}", text);
        }
        // a count followed by unindexed data is not a multi-frame reply
        assert_eq!(
            classify("014\n62 F1 90"),
            Classification::Error(AdapterError::Malformed)
        );
        // nor is a trailing count
        assert_eq!(
            classify("0: 62 F1 90\n014"),
            Classification::Error(AdapterError::Malformed)
        );
        // a pending reply may precede the counted frames
        assert!(classify("7F 22 78\n009\n0: 62 F1 90 57 56 57\n1: 5A 5A 5A").is_payload());
    }

    #[test]
    fn test_malformed() {
        assert_eq!(classify("HELLO"), Classification::Error(AdapterError::Malformed));
        assert_eq!(classify("41 0"), Classification::Error(AdapterError::Malformed));
        assert_eq!(classify("41 0C ZZ"), Classification::Error(AdapterError::Malformed));
    }

    #[test]
    fn test_find_token_ignores_banner() {
        assert_eq!(find_token("ELM327 v1.5"), None);
        assert_eq!(find_token("OK"), None);
        assert_eq!(find_token("BUS INIT: ...ERROR"), Some(AdapterError::BusInitError));
    }

    #[test]
    fn test_empty_is_no_data() {
        assert_eq!(classify(""), Classification::Error(AdapterError::NoData));
        assert_eq!(classify("  \r\n "), Classification::Error(AdapterError::NoData));
    }

    proptest! {
        #[test]
        fn classify_is_total(text in ".*") {
            let first = classify(&text);
            prop_assert_eq!(first, classify(&text));
        }

        #[test]
        fn hex_pairs_are_payload(bytes in proptest::collection::vec(any::<u8>(), 1..16)) {
            let text = bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
            prop_assert!(classify(&text).is_payload());
        }
    }
}
