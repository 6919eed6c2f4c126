//! ELM327 Connection Manager
//!
//! Drives the adapter handshake and exposes one synchronous
//! command/response primitive. Replies are returned as cleaned lines;
//! interpreting them is left to the caller.

use crate::classify::{find_token, AdapterError};
use crate::error::ObdError;
use crate::protocol::ProtocolMode;
use crate::transport::{PlatformHint, Transport, PROMPT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_serial::SerialStream;
use tracing::{debug, error, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// `ATZ` reboots the chip, which takes noticeably longer
const DEFAULT_RESET_TIMEOUT_MS: u64 = 5000;

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port device path (e.g., "/dev/rfcomm0" or "COM3")
    pub port: String,
    /// Baud rate (OBDLink MX+ uses 115200, cheap ELM327 clones often 38400)
    pub baud_rate: u32,
    /// Vehicle protocol selected during initialization
    pub protocol: ProtocolMode,
    /// Timeout for regular commands
    pub command_timeout_ms: u64,
    /// Timeout for the reset step
    pub reset_timeout_ms: u64,
    /// Pause after opening the port before the first command
    pub settle_delay_ms: u64,
    /// Platform capabilities used when closing the port
    pub platform: PlatformHint,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/rfcomm0".to_string(),
            baud_rate: 115200,
            protocol: ProtocolMode::default(),
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            settle_delay_ms: 500,
            platform: PlatformHint::detect(),
        }
    }
}

impl ConnectionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Lifecycle of the link to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Closed,
    /// Port open, handshake not yet completed
    Opening,
    Ready,
    /// Handshake failed; the port must be re-opened
    Faulted,
}

/// Port identity and lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    port: String,
    baud_rate: u32,
    state: LinkState,
}

impl Connection {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn state(&self) -> LinkState {
        self.state
    }
}

/// One step of the adapter handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStep {
    Reset,
    EchoOff,
    LineFeedsOff,
    SetProtocol,
}

impl InitStep {
    pub const SEQUENCE: [InitStep; 4] = [
        InitStep::Reset,
        InitStep::EchoOff,
        InitStep::LineFeedsOff,
        InitStep::SetProtocol,
    ];

    pub fn command(&self, protocol: ProtocolMode) -> &'static str {
        match self {
            InitStep::Reset => "ATZ",
            InitStep::EchoOff => "ATE0",
            InitStep::LineFeedsOff => "ATL0",
            InitStep::SetProtocol => protocol.to_elm_command(),
        }
    }
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStep::Reset => f.write_str("reset (ATZ)"),
            InitStep::EchoOff => f.write_str("echo off (ATE0)"),
            InitStep::LineFeedsOff => f.write_str("linefeeds off (ATL0)"),
            InitStep::SetProtocol => f.write_str("set protocol (ATSP)"),
        }
    }
}

/// An outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub terminator: u8,
    pub timeout: Duration,
}

impl Command {
    pub fn new(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            terminator: PROMPT,
            timeout,
        }
    }

    /// Wire bytes: the command followed by a carriage return
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(b'\r');
        bytes
    }
}

/// Reply lines with echo, blank lines and the prompt removed
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResponse {
    pub lines: Vec<String>,
    pub elapsed: Duration,
}

impl AdapterResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Whether any line is the literal `OK` token
    pub fn is_ok(&self) -> bool {
        self.lines.iter().any(|l| l.eq_ignore_ascii_case("OK"))
    }
}

/// Information reported by the adapter itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// `ATI` identification string
    pub device_id: String,
    /// `ATRV` supply voltage at the OBD socket
    pub voltage: Option<f64>,
    /// `ATDP` protocol description
    pub protocol_name: Option<String>,
    /// `ATDPN` protocol number
    pub protocol: Option<ProtocolMode>,
}

/// Owns the transport and the connection lifecycle.
///
/// All command methods take `&mut self`, so at most one command is in flight
/// per connection.
pub struct ConnectionManager<S = SerialStream> {
    transport: Option<Transport<S>>,
    connection: Connection,
    protocol: Option<ProtocolMode>,
    config: ConnectionConfig,
}

impl ConnectionManager<SerialStream> {
    /// Open the configured serial port
    pub async fn open(config: ConnectionConfig) -> Result<Self, ObdError> {
        let transport = Transport::open(&config.port, config.baud_rate).await?;
        // Allow adapter to settle
        tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
        Ok(Self::with_transport(transport, config))
    }
}

impl<S> ConnectionManager<S> {
    /// Manage an already-open transport
    pub fn with_transport(transport: Transport<S>, config: ConnectionConfig) -> Self {
        let connection = Connection {
            port: transport.port().to_string(),
            baud_rate: transport.baud_rate(),
            state: LinkState::Opening,
        };
        Self {
            transport: Some(transport),
            connection,
            protocol: None,
            config,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> LinkState {
        self.connection.state
    }

    /// Protocol selected by a successful initialization
    pub fn protocol(&self) -> Option<ProtocolMode> {
        self.protocol
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Close the port using the platform hint chosen at setup
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(transport) = self.transport.take() {
            info!("Disconnecting from {}", self.connection.port);
            transport.close(self.config.platform);
        }
        self.connection.state = LinkState::Closed;
    }
}

impl<S> Drop for ConnectionManager<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionManager<S> {
    /// Run the adapter handshake: reset, echo off, linefeeds off, set protocol.
    ///
    /// Any step answered with an error token, or not answered in time, leaves
    /// the connection `Faulted`.
    pub async fn initialize(&mut self, protocol: ProtocolMode) -> Result<(), ObdError> {
        if self.connection.state != LinkState::Opening {
            return Err(ObdError::InvalidState(self.connection.state));
        }

        info!("Initializing ELM327 adapter on {}", self.connection.port);

        for step in InitStep::SEQUENCE {
            let timeout = match step {
                InitStep::Reset => self.config.reset_timeout(),
                _ => self.config.command_timeout(),
            };
            let command = Command::new(step.command(protocol), timeout);

            let outcome = match self.exchange(&command).await {
                Ok(response) => check_step(step, &response),
                Err(ObdError::Timeout { partial, .. }) => Err(ObdError::Protocol {
                    step,
                    response: String::from_utf8_lossy(&partial).trim().to_string(),
                }),
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                error!("Adapter initialization failed: {}", e);
                self.connection.state = LinkState::Faulted;
                return Err(e);
            }
        }

        self.protocol = Some(protocol);
        self.connection.state = LinkState::Ready;
        info!("Adapter ready ({})", protocol.name());
        Ok(())
    }

    /// Send one command and wait for the prompt
    pub async fn send_command(&mut self, command: &Command) -> Result<AdapterResponse, ObdError> {
        if self.connection.state != LinkState::Ready {
            return Err(ObdError::InvalidState(self.connection.state));
        }
        self.exchange(command).await
    }

    /// Send a command with the configured default timeout
    pub async fn query(&mut self, text: &str) -> Result<AdapterResponse, ObdError> {
        let command = Command::new(text, self.config.command_timeout());
        self.send_command(&command).await
    }

    /// Read identification, supply voltage and the active protocol
    pub async fn adapter_info(&mut self) -> Result<AdapterInfo, ObdError> {
        let device_id = self.query("ATI").await?.text();
        let voltage = parse_voltage(&self.query("ATRV").await?.text());
        let protocol_name = non_empty(self.query("ATDP").await?.text());
        let protocol = ProtocolMode::from_elm_number(&self.query("ATDPN").await?.text());

        Ok(AdapterInfo {
            device_id,
            voltage,
            protocol_name,
            protocol,
        })
    }

    /// Set the CAN transmit header (e.g. 0x7E0 for the engine ECU)
    pub async fn set_header(&mut self, can_id: u16) -> Result<(), ObdError> {
        let response = self.query(&format!("ATSH{:03X}", can_id)).await?;
        expect_ok(&response)
    }

    /// Only accept frames from one CAN ID (e.g. 0x7E8 for the engine ECU)
    pub async fn set_receive_filter(&mut self, can_id: u16) -> Result<(), ObdError> {
        let response = self.query(&format!("ATCRA{:03X}", can_id)).await?;
        expect_ok(&response)
    }

    async fn exchange(&mut self, command: &Command) -> Result<AdapterResponse, ObdError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ObdError::InvalidState(self.connection.state))?;

        transport.discard_pending().await?;
        debug!("TX: {}", command.text);
        let start = Instant::now();
        transport.write_bytes(&command.to_bytes(), command.timeout).await?;

        // the write and the reply share one deadline
        let remaining = command.timeout.saturating_sub(start.elapsed());
        let raw = transport.read_until(command.terminator, remaining).await?;
        let lines = clean_lines(&raw.text(), &command.text);
        debug!("RX: {:?} ({}ms)", lines, raw.elapsed.as_millis());

        Ok(AdapterResponse {
            lines,
            elapsed: raw.elapsed,
        })
    }
}

fn check_step(step: InitStep, response: &AdapterResponse) -> Result<(), ObdError> {
    let failed = || ObdError::Protocol {
        step,
        response: response.text(),
    };

    if find_token(&response.text()).is_some() {
        return Err(failed());
    }

    match step {
        InitStep::Reset if response.is_ok() => Ok(()),
        InitStep::Reset => {
            let banner = response.lines.last().ok_or_else(failed)?;
            let known = ["ELM", "OBDLINK", "STN"]
                .iter()
                .any(|id| banner.to_ascii_uppercase().contains(id));
            if known {
                info!("Adapter identified: {}", banner);
            } else {
                warn!("Unexpected reset response: {}", banner);
            }
            Ok(())
        }
        _ if response.is_ok() => Ok(()),
        _ => Err(failed()),
    }
}

fn expect_ok(response: &AdapterResponse) -> Result<(), ObdError> {
    if response.is_ok() {
        return Ok(());
    }
    let text = response.text();
    match find_token(&text) {
        Some(token) => Err(ObdError::Adapter(token)),
        None if text.is_empty() => Err(ObdError::Adapter(AdapterError::NoData)),
        None => Err(ObdError::MalformedResponse(text)),
    }
}

/// Split a raw reply into trimmed, non-empty lines, dropping a leading echo
fn clean_lines(text: &str, command: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .split(|c| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let echoed = lines
        .first()
        .map(|first| strip_spaces(first).eq_ignore_ascii_case(&strip_spaces(command)))
        .unwrap_or(false);
    if echoed {
        lines.remove(0);
    }
    lines
}

fn strip_spaces(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_voltage(text: &str) -> Option<f64> {
    let number: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn manager(builder: crate::mock::MockAdapterBuilder) -> (ConnectionManager<DuplexStream>, MockAdapter) {
        let (transport, adapter) = builder.spawn();
        let config = ConnectionConfig {
            platform: PlatformHint { defective_serial_close: false },
            ..Default::default()
        };
        (ConnectionManager::with_transport(transport, config), adapter)
    }

    #[tokio::test]
    async fn test_initialize_runs_handshake_in_order() {
        let (mut conn, adapter) = manager(MockAdapter::builder().with_echo().handshake("ATSP6"));

        conn.initialize(ProtocolMode::Iso15765_4Can11bit500).await.unwrap();

        assert_eq!(conn.state(), LinkState::Ready);
        assert_eq!(conn.protocol(), Some(ProtocolMode::Iso15765_4Can11bit500));
        assert_eq!(adapter.received(), vec!["ATZ", "ATE0", "ATL0", "ATSP6"]);
    }

    #[tokio::test]
    async fn test_initialize_error_token_faults_connection() {
        let (mut conn, adapter) = manager(
            MockAdapter::builder()
                .expect("ATZ", "ELM327 v1.5")
                .expect("ATE0", "OK")
                .expect("ATL0", "?"),
        );

        let err = conn.initialize(ProtocolMode::default()).await.unwrap_err();
        assert_eq!(
            err,
            ObdError::Protocol {
                step: InitStep::LineFeedsOff,
                response: "?".to_string()
            }
        );
        assert_eq!(conn.state(), LinkState::Faulted);

        // no further commands accepted until re-open
        let refused = conn.query("010C").await.unwrap_err();
        assert_eq!(refused, ObdError::InvalidState(LinkState::Faulted));
        assert_eq!(adapter.received(), vec!["ATZ", "ATE0", "ATL0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_timeout_faults_connection() {
        let (mut conn, _adapter) = manager(
            MockAdapter::builder()
                .expect("ATZ", "ELM327 v1.5")
                .silent("ATE0"),
        );

        let err = conn.initialize(ProtocolMode::default()).await.unwrap_err();
        assert!(matches!(err, ObdError::Protocol { step: InitStep::EchoOff, .. }));
        assert_eq!(conn.state(), LinkState::Faulted);
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_ok() {
        let (mut conn, _adapter) = manager(
            MockAdapter::builder()
                .expect("ATZ", "ELM327 v1.5")
                .expect("ATE0", "OK")
                .expect("ATL0", "OK")
                .expect("ATSP6", "BUSY"),
        );

        let err = conn.initialize(ProtocolMode::default()).await.unwrap_err();
        assert!(matches!(err, ObdError::Protocol { step: InitStep::SetProtocol, .. }));
    }

    #[tokio::test]
    async fn test_send_command_requires_ready() {
        let (mut conn, adapter) = manager(MockAdapter::builder());

        let err = conn.query("0105").await.unwrap_err();
        assert_eq!(err, ObdError::InvalidState(LinkState::Opening));
        assert!(adapter.received().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_returns_clean_lines() {
        let (mut conn, _adapter) = manager(
            MockAdapter::builder()
                .handshake("ATSP6")
                .expect("0100", "SEARCHING...\n41 00 BE 1F A8 13\n"),
        );
        conn.initialize(ProtocolMode::default()).await.unwrap();

        let response = conn.query("0100").await.unwrap();
        assert_eq!(response.lines, vec!["SEARCHING...", "41 00 BE 1F A8 13"]);
    }

    #[tokio::test]
    async fn test_adapter_info() {
        let (mut conn, _adapter) = manager(
            MockAdapter::builder()
                .handshake("ATSP6")
                .expect("ATI", "ELM327 v1.5")
                .expect("ATRV", "12.6V")
                .expect("ATDP", "ISO 15765-4 (CAN 11/500)")
                .expect("ATDPN", "6"),
        );
        conn.initialize(ProtocolMode::default()).await.unwrap();

        let info = conn.adapter_info().await.unwrap();
        assert_eq!(info.device_id, "ELM327 v1.5");
        assert_eq!(info.voltage, Some(12.6));
        assert_eq!(info.protocol_name.as_deref(), Some("ISO 15765-4 (CAN 11/500)"));
        assert_eq!(info.protocol, Some(ProtocolMode::Iso15765_4Can11bit500));
    }

    #[tokio::test]
    async fn test_set_header_and_filter() {
        let (mut conn, _adapter) = manager(
            MockAdapter::builder()
                .handshake("ATSP6")
                .expect("ATSH7E0", "OK")
                .expect("ATCRA7E8", "?"),
        );
        conn.initialize(ProtocolMode::default()).await.unwrap();

        conn.set_header(0x7E0).await.unwrap();
        let err = conn.set_receive_filter(0x7E8).await.unwrap_err();
        assert_eq!(err, ObdError::Adapter(AdapterError::UnknownCommand));
    }

    #[tokio::test]
    async fn test_close_marks_closed() {
        let (mut conn, _adapter) = manager(MockAdapter::builder().handshake("ATSP6"));
        conn.initialize(ProtocolMode::default()).await.unwrap();
        conn.release();
        assert_eq!(conn.state(), LinkState::Closed);
        assert!(conn.query("0105").await.is_err());
    }

    /// Manager over a bare pipe whose far end the test drives by hand
    fn bare_manager(capacity: usize, defective_serial_close: bool) -> (ConnectionManager<DuplexStream>, DuplexStream) {
        let (near, far) = duplex(capacity);
        let config = ConnectionConfig {
            platform: PlatformHint { defective_serial_close },
            ..Default::default()
        };
        let transport = Transport::from_stream(near, "test", 115200);
        (ConnectionManager::with_transport(transport, config), far)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_faults_initialization() {
        // 2 byte pipe that is never drained: "ATZ\r" cannot be written
        let (mut conn, _far) = bare_manager(2, false);

        let err = conn.initialize(ProtocolMode::default()).await.unwrap_err();
        assert!(matches!(err, ObdError::Protocol { step: InitStep::Reset, .. }));
        assert_eq!(conn.state(), LinkState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_faulted_manager_releases_port() {
        let (mut conn, mut far) = bare_manager(256, false);
        conn.initialize(ProtocolMode::default()).await.unwrap_err();
        assert_eq!(conn.state(), LinkState::Faulted);

        drop(conn);
        let mut sent = Vec::new();
        far.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"ATZ\r".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_keeps_handle_on_defective_platform() {
        let (mut conn, mut far) = bare_manager(256, true);
        conn.initialize(ProtocolMode::default()).await.unwrap_err();

        drop(conn);
        let mut sent = Vec::new();
        let read = tokio::time::timeout(Duration::from_millis(100), far.read_to_end(&mut sent)).await;
        assert!(read.is_err(), "peer saw a hangup");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_port() {
        let (mut conn, mut far) = bare_manager(256, false);
        conn.initialize(ProtocolMode::default()).await.unwrap_err();

        conn.close();
        let mut sent = Vec::new();
        far.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"ATZ\r".to_vec());
    }

    #[test]
    fn test_clean_lines_strips_echo() {
        let lines = clean_lines("ATZ\r\r\rELM327 v1.5\r\r", "ATZ");
        assert_eq!(lines, vec!["ELM327 v1.5"]);

        let lines = clean_lines("41 0C 1A F8\r\r", "010C");
        assert_eq!(lines, vec!["41 0C 1A F8"]);
    }

    #[test]
    fn test_parse_voltage() {
        assert_eq!(parse_voltage("12.6V"), Some(12.6));
        assert_eq!(parse_voltage("?"), None);
    }
}
