//! Reply assembly
//!
//! Turns the adapter's cleaned reply lines into ECU messages: one message per
//! single-frame line, one per multi-frame block (`014` / `0:` / `1:` ...).

use obd_protocol::service::NEGATIVE_RESPONSE;
use obd_protocol::{classify, is_informational, AdapterError, Classification, ObdError};
use tracing::debug;

/// NRC sent while the ECU is still working on the request
const RESPONSE_PENDING: u8 = 0x78;

/// Classify the reply and split it into messages.
///
/// Adapter error tokens come back as `ObdError::Adapter`; text that is neither
/// a token nor hex is `MalformedResponse`. "Response pending" messages are
/// dropped in favour of the ones that follow.
pub fn messages(lines: &[String]) -> Result<Vec<Vec<u8>>, ObdError> {
    let text = lines.join("\n");
    match classify(&text) {
        Classification::Payload => {}
        Classification::Error(AdapterError::Malformed) => {
            return Err(ObdError::MalformedResponse(text));
        }
        Classification::Error(e) => return Err(ObdError::Adapter(e)),
    }

    let mut messages = Vec::new();
    let mut block: Option<MultiFrame> = None;

    for line in lines.iter().map(|l| l.trim()).filter(|l| !is_informational(l)) {
        if let Some((_, rest)) = line.split_once(':') {
            block
                .get_or_insert_with(MultiFrame::default)
                .bytes
                .extend(parse_hex(rest)?);
        } else if line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Some(done) = block.take() {
                messages.push(done.finish());
            }
            let announced = usize::from_str_radix(line, 16)
                .map_err(|_| ObdError::MalformedResponse(line.to_string()))?;
            block = Some(MultiFrame {
                announced: Some(announced),
                bytes: Vec::with_capacity(announced),
            });
        } else {
            if let Some(done) = block.take() {
                messages.push(done.finish());
            }
            messages.push(parse_hex(line)?);
        }
    }
    if let Some(done) = block.take() {
        messages.push(done.finish());
    }

    messages.retain(|m| {
        let pending = is_response_pending(m);
        if pending {
            debug!("ECU response pending (service {:02X})", m[1]);
        }
        !pending
    });
    Ok(messages)
}

/// Data bytes following `header` in the first message that contains it.
///
/// When no message carries the header, a negative response to `service`
/// becomes `NegativeResponse`; anything else is `MalformedResponse`.
pub fn extract(messages: &[Vec<u8>], header: &[u8], service: u8) -> Result<Vec<u8>, ObdError> {
    for message in messages {
        if let Some(pos) = find(message, header) {
            return Ok(message[pos + header.len()..].to_vec());
        }
    }

    if let Some(nrc) = negative_code(messages, service) {
        return Err(ObdError::NegativeResponse { service, nrc });
    }

    Err(ObdError::MalformedResponse(format!(
        "no {} in reply {}",
        hex(header),
        messages.iter().map(|m| hex(m)).collect::<Vec<_>>().join(" | ")
    )))
}

/// NRC of a `7F <service> <nrc>` message, if any
pub fn negative_code(messages: &[Vec<u8>], service: u8) -> Option<u8> {
    messages.iter().find_map(|m| {
        let pos = find(m, &[NEGATIVE_RESPONSE, service])?;
        m.get(pos + 2).copied()
    })
}

pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Default)]
struct MultiFrame {
    announced: Option<usize>,
    bytes: Vec<u8>,
}

impl MultiFrame {
    fn finish(mut self) -> Vec<u8> {
        if let Some(len) = self.announced {
            self.bytes.truncate(len);
        }
        self.bytes
    }
}

fn is_response_pending(message: &[u8]) -> bool {
    message.len() >= 3 && message[0] == NEGATIVE_RESPONSE && message[2] == RESPONSE_PENDING
}

fn find(message: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || message.len() < needle.len() {
        return None;
    }
    message.windows(needle.len()).position(|w| w == needle)
}

fn parse_hex(text: &str) -> Result<Vec<u8>, ObdError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(ObdError::MalformedResponse(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| ObdError::MalformedResponse(text.to_string()))
        })
        .collect()
}
