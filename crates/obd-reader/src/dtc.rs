//! Diagnostic Trouble Code decoding (ISO 15031-6 / SAE J2012)

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stored trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcRecord {
    /// Letter plus four hex digits, e.g. `P0100`
    pub code: String,
    /// DTC status byte; 0x00 when the reply carries none (Mode 03)
    pub status: u8,
}

impl DtcRecord {
    pub fn new(b1: u8, b2: u8, status: u8) -> Self {
        Self {
            code: decode_dtc(b1, b2),
            status,
        }
    }

    /// Vehicle system named by the code letter
    pub fn system(&self) -> &'static str {
        match self.code.as_bytes().first() {
            Some(b'P') => "Powertrain",
            Some(b'C') => "Chassis",
            Some(b'B') => "Body",
            _ => "Network",
        }
    }
}

impl fmt::Display for DtcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Decode the two code bytes.
///
/// The top two bits of the first byte select the letter (P, C, B, U); the
/// remaining 14 bits are printed as four hex digits.
pub fn decode_dtc(b1: u8, b2: u8) -> String {
    let letter = match b1 >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let number = (((b1 & 0x3F) as u16) << 8) | b2 as u16;
    format!("{}{:04X}", letter, number)
}

/// Parse the bytes following the Mode 03 reply header (0x43).
///
/// Two bytes per code, no status byte. CAN replies put a code count in front
/// of the pairs, which shows up as an odd number of remaining bytes.
/// `00 00` pairs are padding.
pub fn parse_mode03(data: &[u8]) -> Vec<DtcRecord> {
    let pairs = if data.len() % 2 == 1 { &data[1..] } else { data };

    pairs
        .chunks_exact(2)
        .filter(|pair| pair[0] != 0 || pair[1] != 0)
        .map(|pair| DtcRecord::new(pair[0], pair[1], 0x00))
        .collect()
}

/// Parse three-byte records (two code bytes plus status), as carried in
/// UDS ReadDTCInformation payloads
pub fn parse_with_status(data: &[u8]) -> Vec<DtcRecord> {
    data.chunks_exact(3)
        .filter(|record| record[0] != 0 || record[1] != 0)
        .map(|record| DtcRecord::new(record[0], record[1], record[2]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_letters() {
        assert_eq!(decode_dtc(0x01, 0x00), "P0100");
        assert_eq!(decode_dtc(0x03, 0x00), "P0300");
        assert_eq!(decode_dtc(0x41, 0x23), "C0123");
        assert_eq!(decode_dtc(0x80, 0x01), "B0001");
        assert_eq!(decode_dtc(0xC1, 0x23), "U0123");
    }

    #[test]
    fn test_mode03_single_pair() {
        let records = parse_mode03(&[0x01, 0x00]);
        assert_eq!(records, vec![DtcRecord { code: "P0100".into(), status: 0x00 }]);
    }

    #[test]
    fn test_mode03_with_count_byte() {
        let records = parse_mode03(&[0x02, 0x01, 0x33, 0xC1, 0x23]);
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["P0133", "U0123"]);
    }

    #[test]
    fn test_mode03_skips_padding() {
        let records = parse_mode03(&[0x01, 0x71, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, "P0171");
        assert_eq!(records[0].system(), "Powertrain");
    }

    #[test]
    fn test_parse_with_status() {
        let records = parse_with_status(&[0x03, 0x01, 0x2F, 0x00, 0x00, 0x00]);
        assert_eq!(records, vec![DtcRecord { code: "P0301".into(), status: 0x2F }]);
    }

    proptest! {
        #[test]
        fn decoded_code_is_letter_and_four_hex_digits(b1 in any::<u8>(), b2 in any::<u8>()) {
            let code = decode_dtc(b1, b2);
            prop_assert_eq!(code.len(), 5);
            prop_assert!("PCBU".contains(&code[..1]));
            prop_assert!(code[1..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
