//! Serial / Bluetooth Transport
//!
//! Byte-level access to the adapter's port. The transport is half-duplex:
//! callers write one command and then read until the adapter prompt.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

/// ELM327 prompt character, sent when the adapter is ready for a new command
pub const PROMPT: u8 = b'>';

/// Platform capabilities relevant to port teardown, decided once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformHint {
    /// Closing the port corrupts the receive channel until the peer is
    /// re-paired (macOS Bluetooth serial stack)
    pub defective_serial_close: bool,
}

impl PlatformHint {
    /// Capabilities of the platform this binary was built for
    pub fn detect() -> Self {
        Self {
            defective_serial_close: cfg!(target_os = "macos"),
        }
    }
}

impl Default for PlatformHint {
    fn default() -> Self {
        Self::detect()
    }
}

/// Bytes received up to (not including) the terminator
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
}

impl RawResponse {
    /// Response as text with NUL bytes dropped
    pub fn text(&self) -> String {
        let filtered: Vec<u8> = self.bytes.iter().copied().filter(|&b| b != 0).collect();
        String::from_utf8_lossy(&filtered).into_owned()
    }
}

/// Exclusively owned port handle
pub struct Transport<S = SerialStream> {
    stream: S,
    port: String,
    baud_rate: u32,
}

impl Transport<SerialStream> {
    /// Open a serial (or rfcomm / virtual COM) port, 8N1 without flow control
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self, ObdError> {
        info!("Opening {} at {} baud", port, baud_rate);

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| ObdError::Connection(format!("Failed to open {}: {}", port, e)))?;

        Ok(Self::from_stream(stream, port, baud_rate))
    }
}

impl<S> Transport<S> {
    /// Wrap an already-open byte stream
    pub fn from_stream(stream: S, port: &str, baud_rate: u32) -> Self {
        Self {
            stream,
            port: port.to_string(),
            baud_rate,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Release the port.
    ///
    /// On platforms flagged with a defective serial close the OS handle is
    /// deliberately leaked: only in-process state is released here and the
    /// descriptor goes away when the process exits.
    pub fn close(self, hint: PlatformHint) {
        if hint.defective_serial_close {
            warn!(
                "Skipping close of {}: platform serial teardown is defective, handle released at process exit",
                self.port
            );
            std::mem::forget(self.stream);
        } else {
            drop(self.stream);
            info!("Closed {}", self.port);
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Write all bytes and flush within `timeout`.
    ///
    /// A stalled link (peer not draining the rfcomm channel) ends in
    /// `ObdError::Timeout` with no partial bytes.
    pub async fn write_bytes(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, ObdError> {
        let start = Instant::now();
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };

        match tokio::time::timeout_at(start + timeout, write).await {
            Ok(Ok(())) => Ok(bytes.len()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!("Write to {} stalled for {}ms", self.port, elapsed_ms);
                Err(ObdError::Timeout {
                    elapsed_ms,
                    partial: Vec::new(),
                })
            }
        }
    }

    /// Drop bytes already waiting on the line without blocking
    ///
    /// Late output from a command that timed out would otherwise be read as
    /// the reply to the next one.
    pub async fn discard_pending(&mut self) -> Result<usize, ObdError> {
        let mut chunk = [0u8; 256];
        let mut discarded = 0;

        loop {
            match tokio::time::timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if discarded > 0 {
            debug!("Discarded {} stale bytes on {}", discarded, self.port);
        }
        Ok(discarded)
    }

    /// Accumulate bytes until `terminator` or until `timeout` elapses.
    ///
    /// On timeout the bytes received so far are returned inside the error.
    pub async fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<RawResponse, ObdError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut buf = Vec::with_capacity(128);
        let mut chunk = [0u8; 256];

        loop {
            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(ObdError::Connection(format!("{} closed by peer", self.port)));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    debug!("Timeout on {} after {}ms, {} bytes pending", self.port, elapsed_ms, buf.len());
                    return Err(ObdError::Timeout { elapsed_ms, partial: buf });
                }
            };

            let data = &chunk[..n];
            if let Some(pos) = data.iter().position(|&b| b == terminator) {
                buf.extend_from_slice(&data[..pos]);
                let trailing = n - pos - 1;
                if trailing > 0 {
                    debug!("Ignoring {} bytes after prompt on {}", trailing, self.port);
                }
                return Ok(RawResponse {
                    bytes: buf,
                    elapsed: start.elapsed(),
                });
            }
            buf.extend_from_slice(data);
        }
    }
}
