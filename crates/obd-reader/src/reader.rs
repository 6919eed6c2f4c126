//! Diagnostic Reader Implementation

use crate::dtc::{self, DtcRecord};
use crate::reading::Reading;
use crate::response;
use obd_protocol::{
    mode, service, AdapterError, Command, ConnectionManager, ObdError, ParameterCatalog,
    ParameterDefinition, ParameterKind, VAG_OIL_TEMP_DIDS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

/// Standard PID reporting engine oil temperature
const OIL_TEMP_PID: u8 = 0x5C;

/// Each support bitmask covers 32 PIDs
const PIDS_PER_GROUP: u16 = 0x20;

/// Configuration for the diagnostic reader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Timeout for Mode 01 requests
    pub pid_timeout_ms: u64,
    /// Timeout for ReadDataByIdentifier; VAG gateways answer slower than the engine ECU
    pub did_timeout_ms: u64,
    /// Timeout for DiagnosticSessionControl
    pub session_timeout_ms: u64,
    /// Timeout for Mode 03
    pub dtc_timeout_ms: u64,
    /// Upper bound on support bitmask groups requested by a scan
    pub max_scan_groups: u8,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            pid_timeout_ms: 2000,
            did_timeout_ms: 3000,
            session_timeout_ms: 1000,
            dtc_timeout_ms: 3000,
            max_scan_groups: 8,
        }
    }
}

/// UDS diagnostic session the ECU is believed to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiagnosticSession {
    #[default]
    Default,
    Extended,
}

/// Reads parameters and trouble codes over a ready connection.
///
/// Per-parameter failures never propagate: they come back as invalid
/// [`Reading`]s so one unsupported parameter cannot abort a batch.
pub struct DiagnosticReader<S = SerialStream> {
    manager: ConnectionManager<S>,
    catalog: &'static ParameterCatalog,
    session: DiagnosticSession,
    config: ReaderConfig,
}

impl<S> DiagnosticReader<S> {
    /// Create a reader using the built-in catalog. The session starts as Default.
    pub fn new(manager: ConnectionManager<S>, config: ReaderConfig) -> Self {
        Self {
            manager,
            catalog: ParameterCatalog::builtin(),
            session: DiagnosticSession::Default,
            config,
        }
    }

    pub fn session(&self) -> DiagnosticSession {
        self.session
    }

    /// Forget any session upgrade, e.g. after the ECU was power cycled
    pub fn reset_session(&mut self) {
        if self.session != DiagnosticSession::Default {
            info!("Diagnostic session reset to Default");
        }
        self.session = DiagnosticSession::Default;
    }

    pub fn catalog(&self) -> &'static ParameterCatalog {
        self.catalog
    }

    pub fn manager(&self) -> &ConnectionManager<S> {
        &self.manager
    }

    /// Access the connection for adapter-level commands (ATI, ATSH, ...)
    pub fn manager_mut(&mut self) -> &mut ConnectionManager<S> {
        &mut self.manager
    }

    pub fn into_manager(self) -> ConnectionManager<S> {
        self.manager
    }

    /// Close the underlying connection
    pub fn close(self) {
        self.manager.close();
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DiagnosticReader<S> {
    /// Read a standard Mode 01 PID
    pub async fn read_pid(&mut self, pid: u8) -> Reading {
        let def = match self.catalog.lookup(pid as u16, ParameterKind::StandardPid) {
            Ok(def) => *def,
            Err(e) => {
                warn!("PID {:02X} is not in the catalog", pid);
                return Reading::unknown(pid as u16, ParameterKind::StandardPid, e);
            }
        };

        let outcome = self.fetch(&def).await;
        Reading::from_outcome(&def, outcome)
    }

    /// Read a VAG data identifier with UDS ReadDataByIdentifier.
    ///
    /// DIDs flagged as extended-only get a session upgrade first. An
    /// unflagged DID refused with "not supported in active session" while in
    /// the Default session gets one upgrade and one retry.
    pub async fn read_vag_did(&mut self, did: u16) -> Reading {
        let def = match self.catalog.lookup(did, ParameterKind::VagDid) {
            Ok(def) => *def,
            Err(e) => {
                warn!("DID {:04X} is not in the catalog", did);
                return Reading::unknown(did, ParameterKind::VagDid, e);
            }
        };

        let mut upgraded = false;
        if def.requires_extended_session && self.session == DiagnosticSession::Default {
            upgraded = true;
            debug!("DID {:04X} requires the extended session", did);
            if let Err(e) = self.enter_extended_session().await {
                return Reading::from_outcome(&def, Err(e));
            }
        }

        let mut outcome = self.fetch(&def).await;

        let session_refused = matches!(
            outcome,
            Err(ObdError::NegativeResponse {
                nrc: service::SUB_FUNCTION_NOT_SUPPORTED_IN_SESSION
                    | service::SERVICE_NOT_SUPPORTED_IN_SESSION,
                ..
            })
        );
        if session_refused && !upgraded && self.session == DiagnosticSession::Default {
            info!("DID {:04X} refused in Default session, retrying in extended session", did);
            if self.enter_extended_session().await.is_ok() {
                outcome = self.fetch(&def).await;
            }
        }

        Reading::from_outcome(&def, outcome)
    }

    /// Switch the ECU to the extended diagnostic session (10 03).
    ///
    /// The session only changes after a positive `50 03` reply.
    pub async fn enter_extended_session(&mut self) -> Result<(), ObdError> {
        let request = format!("{:02X}{:02X}", service::SESSION_CONTROL, service::EXTENDED_SESSION);
        let timeout = Duration::from_millis(self.config.session_timeout_ms);
        info!("Requesting extended diagnostic session");

        let result = self.request(&request, timeout).await.and_then(|messages| {
            let header = [
                service::SESSION_CONTROL + mode::RESPONSE_OFFSET,
                service::EXTENDED_SESSION,
            ];
            response::extract(&messages, &header, service::SESSION_CONTROL)
        });

        match result {
            Ok(_) => {
                self.session = DiagnosticSession::Extended;
                info!("Extended diagnostic session active");
                Ok(())
            }
            Err(e) => {
                warn!("Extended session request failed: {}", e);
                Err(e)
            }
        }
    }

    /// Read several PIDs, one reading per id in order
    pub async fn read_pids(&mut self, pids: &[u8]) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(pids.len());
        for &pid in pids {
            readings.push(self.read_pid(pid).await);
        }
        readings
    }

    /// Read several VAG DIDs, one reading per id in order
    pub async fn read_vag_dids(&mut self, dids: &[u16]) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(dids.len());
        for &did in dids {
            readings.push(self.read_vag_did(did).await);
        }
        readings
    }

    /// Discover supported PIDs from the support bitmasks (PIDs 00, 20, 40, ...).
    ///
    /// Bit N of a group's bitmask (MSB first) means PID base+N+1 is supported.
    /// The scan stops at a group that fails, at a bitmask whose last bit
    /// (support for the next group) is clear, or after `max_scan_groups`.
    pub async fn scan_supported_pids(&mut self) -> BTreeSet<u16> {
        let mut supported = BTreeSet::new();
        let timeout = Duration::from_millis(self.config.pid_timeout_ms);

        for group in 0..self.config.max_scan_groups as u16 {
            let base = group * PIDS_PER_GROUP;
            let Ok(base_pid) = u8::try_from(base) else {
                break;
            };

            let request = format!("{:02X}{:02X}", mode::CURRENT_DATA, base_pid);
            let header = [mode::CURRENT_DATA + mode::RESPONSE_OFFSET, base_pid];
            let bitmask = match self
                .request(&request, timeout)
                .await
                .and_then(|messages| response::extract(&messages, &header, mode::CURRENT_DATA))
            {
                Ok(data) if data.len() >= 4 => data,
                Ok(data) => {
                    warn!("Support bitmask for {:02X} too short: {} bytes", base_pid, data.len());
                    break;
                }
                Err(e) => {
                    debug!("Support group {:02X} unavailable: {}", base_pid, e);
                    break;
                }
            };

            for (byte_idx, byte) in bitmask[..4].iter().enumerate() {
                for bit in 0..8 {
                    if byte & (0x80 >> bit) != 0 {
                        supported.insert(base + (byte_idx as u16 * 8) + bit + 1);
                    }
                }
            }

            if bitmask[3] & 0x01 == 0 {
                break;
            }
        }

        info!("Found {} supported PIDs", supported.len());
        supported
    }

    /// DIDs (the catalog's when `dids` is None) that produce a valid reading
    pub async fn scan_vag_dids(&mut self, dids: Option<&[u16]>) -> Vec<u16> {
        let candidates: Vec<u16> = match dids {
            Some(dids) => dids.to_vec(),
            None => self
                .catalog
                .all(ParameterKind::VagDid)
                .iter()
                .map(|def| def.id)
                .collect(),
        };

        let mut supported = Vec::new();
        for did in candidates {
            let reading = self.read_vag_did(did).await;
            if reading.is_valid() {
                info!("Found supported DID {:04X}: {}", did, reading);
                supported.push(did);
            }
        }
        supported
    }

    /// Oil temperature from PID 5C, falling back to the VAG oil DIDs
    pub async fn find_oil_temperature(&mut self) -> Option<Reading> {
        let reading = self.read_pid(OIL_TEMP_PID).await;
        if reading.is_valid() {
            info!("Oil temperature found via PID {:02X}", OIL_TEMP_PID);
            return Some(reading);
        }

        for &did in VAG_OIL_TEMP_DIDS {
            let reading = self.read_vag_did(did).await;
            if reading.is_valid() {
                info!("Oil temperature found via DID {:04X}", did);
                return Some(reading);
            }
        }

        warn!("Could not find an oil temperature source");
        None
    }

    /// Read stored trouble codes (Mode 03), in arrival order.
    ///
    /// `NO DATA` means no stored codes. Other failures are returned.
    pub async fn read_dtcs(&mut self) -> Result<Vec<DtcRecord>, ObdError> {
        let request = format!("{:02X}", mode::READ_DTC);
        let timeout = Duration::from_millis(self.config.dtc_timeout_ms);

        let messages = match self.request(&request, timeout).await {
            Ok(messages) => messages,
            Err(ObdError::Adapter(AdapterError::NoData)) => {
                debug!("No stored DTCs");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let header = mode::READ_DTC + mode::RESPONSE_OFFSET;
        let mut records = Vec::new();
        let mut answered = false;
        for message in &messages {
            if let Some(pos) = message.iter().position(|&b| b == header) {
                answered = true;
                records.extend(dtc::parse_mode03(&message[pos + 1..]));
            }
        }

        if !answered {
            if let Some(nrc) = response::negative_code(&messages, mode::READ_DTC) {
                return Err(ObdError::NegativeResponse {
                    service: mode::READ_DTC,
                    nrc,
                });
            }
            return Err(ObdError::MalformedResponse(format!(
                "no {:02X} in DTC reply",
                header
            )));
        }

        info!("Read {} DTCs", records.len());
        Ok(records)
    }

    /// Request one parameter and return the data bytes after its header
    async fn fetch(&mut self, def: &ParameterDefinition) -> Result<Vec<u8>, ObdError> {
        let (header, service, timeout_ms) = match def.kind {
            ParameterKind::StandardPid => (
                vec![mode::CURRENT_DATA + mode::RESPONSE_OFFSET, def.id as u8],
                mode::CURRENT_DATA,
                self.config.pid_timeout_ms,
            ),
            ParameterKind::VagDid => {
                let [hi, lo] = def.id.to_be_bytes();
                (
                    vec![service::READ_DATA_BY_ID + mode::RESPONSE_OFFSET, hi, lo],
                    service::READ_DATA_BY_ID,
                    self.config.did_timeout_ms,
                )
            }
        };

        let messages = self
            .request(&def.request(), Duration::from_millis(timeout_ms))
            .await?;
        let data = response::extract(&messages, &header, service)?;
        debug!("{} {:04X}: {}", def.kind, def.id, response::hex(&data));
        Ok(data)
    }

    async fn request(&mut self, text: &str, timeout: Duration) -> Result<Vec<Vec<u8>>, ObdError> {
        let reply = self.manager.send_command(&Command::new(text, timeout)).await?;
        response::messages(&reply.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{MockAdapter, MockAdapterBuilder};
    use obd_protocol::{ConnectionConfig, PlatformHint, ProtocolMode, Value};
    use tokio::io::DuplexStream;

    async fn reader_with(
        builder: MockAdapterBuilder,
        config: ReaderConfig,
    ) -> (DiagnosticReader<DuplexStream>, MockAdapter) {
        let (transport, adapter) = builder.spawn();
        let conn_config = ConnectionConfig {
            platform: PlatformHint { defective_serial_close: false },
            ..Default::default()
        };
        let mut manager = ConnectionManager::with_transport(transport, conn_config);
        manager.initialize(ProtocolMode::default()).await.unwrap();
        (DiagnosticReader::new(manager, config), adapter)
    }

    async fn reader(builder: MockAdapterBuilder) -> (DiagnosticReader<DuplexStream>, MockAdapter) {
        reader_with(builder, ReaderConfig::default()).await
    }

    fn script() -> MockAdapterBuilder {
        MockAdapter::builder().handshake("ATSP6")
    }

    fn numeric(reading: &Reading) -> f64 {
        reading.value().and_then(Value::as_f64).unwrap()
    }

    #[tokio::test]
    async fn test_read_coolant_temp() {
        let (mut reader, _adapter) = reader(script().expect("0105", "41 05 7B")).await;

        let reading = reader.read_pid(0x05).await;
        assert!(reading.is_valid());
        assert_eq!(numeric(&reading), 83.0);
        assert_eq!(reading.raw(), &[0x7B]);
        assert_eq!(reading.unit(), "°C");
    }

    #[tokio::test]
    async fn test_read_rpm_after_searching() {
        let (mut reader, _adapter) =
            reader(script().expect("010C", "SEARCHING...\n41 0C 1A F8")).await;

        let reading = reader.read_pid(0x0C).await;
        assert_eq!(numeric(&reading), 1726.0);
    }

    #[tokio::test]
    async fn test_unknown_pid_is_not_sent() {
        let (mut reader, adapter) = reader(script()).await;

        let reading = reader.read_pid(0xA6).await;
        assert!(!reading.is_valid());
        assert_eq!(
            reading.error(),
            Some(&ObdError::UnknownParameter { id: 0xA6, kind: ParameterKind::StandardPid })
        );
        assert_eq!(adapter.received().len(), 4);
    }

    #[tokio::test]
    async fn test_no_data_is_invalid_reading() {
        let (mut reader, _adapter) = reader(script().expect("015C", "NO DATA")).await;

        let reading = reader.read_pid(0x5C).await;
        assert!(!reading.is_valid());
        assert_eq!(reading.error(), Some(&ObdError::Adapter(AdapterError::NoData)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_invalid_reading() {
        let (mut reader, _adapter) = reader(script().silent("010D")).await;

        let reading = reader.read_pid(0x0D).await;
        assert!(!reading.is_valid());
        assert!(matches!(reading.error(), Some(ObdError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_mismatched_pid_is_malformed() {
        let (mut reader, _adapter) = reader(script().expect("010C", "41 0D 20")).await;

        let reading = reader.read_pid(0x0C).await;
        assert!(matches!(reading.error(), Some(ObdError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_scan_stops_at_clear_continuation_bit() {
        let (mut reader, adapter) = reader(
            script()
                .expect("0100", "41 00 BE 1F A8 13")
                .expect("0120", "41 20 80 00 00 00"),
        )
        .await;

        let supported = reader.scan_supported_pids().await;
        let expected: BTreeSet<u16> = [
            0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x13, 0x15,
            0x1C, 0x1F, 0x20, 0x21,
        ]
        .into_iter()
        .collect();
        assert_eq!(supported, expected);
        assert_eq!(adapter.count("0140"), 0);
    }

    #[tokio::test]
    async fn test_scan_stops_at_failed_group() {
        let (mut reader, adapter) = reader(
            script()
                .expect("0100", "41 00 BE 1F A8 13")
                .expect("0120", "NO DATA"),
        )
        .await;

        let supported = reader.scan_supported_pids().await;
        assert_eq!(supported.len(), 17);
        assert!(supported.contains(&0x20));
        assert_eq!(adapter.count("0140"), 0);
    }

    #[tokio::test]
    async fn test_scan_respects_group_limit() {
        let config = ReaderConfig {
            max_scan_groups: 1,
            ..Default::default()
        };
        let (mut reader, adapter) =
            reader_with(script().expect("0100", "41 00 BE 1F A8 13"), config).await;

        reader.scan_supported_pids().await;
        assert_eq!(adapter.count("0120"), 0);
    }

    #[tokio::test]
    async fn test_read_dtcs() {
        let (mut reader, _adapter) = reader(script().expect("03", "43 01 01 00")).await;

        let dtcs = reader.read_dtcs().await.unwrap();
        assert_eq!(dtcs, vec![DtcRecord { code: "P0100".into(), status: 0x00 }]);
    }

    #[tokio::test]
    async fn test_read_dtcs_multiple_ecus() {
        let (mut reader, _adapter) =
            reader(script().expect("03", "43 02 01 33 C1 23\n43 00")).await;

        let codes: Vec<String> = reader
            .read_dtcs()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["P0133", "U0123"]);
    }

    #[tokio::test]
    async fn test_read_dtcs_no_data_is_empty() {
        let (mut reader, _adapter) = reader(script().expect("03", "NO DATA")).await;
        assert!(reader.read_dtcs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extended_did_upgrades_session_once() {
        let (mut reader, adapter) = reader(
            script()
                .expect("1003", "50 03 00 32 01 F4")
                .expect("22F40E", "62 F4 0E 7B")
                .expect("222028", "62 20 28 82"),
        )
        .await;
        assert_eq!(reader.session(), DiagnosticSession::Default);

        let reading = reader.read_vag_did(0xF40E).await;
        assert_eq!(numeric(&reading), 83.0);
        assert_eq!(reader.session(), DiagnosticSession::Extended);

        // already extended: no second upgrade
        let reading = reader.read_vag_did(0x2028).await;
        assert_eq!(numeric(&reading), 90.0);
        assert_eq!(adapter.count("1003"), 1);
        let received = adapter.received();
        assert_eq!(&received[4..], &["1003", "22F40E", "222028"]);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_keeps_default_session() {
        let (mut reader, adapter) = reader(script().expect("1003", "7F 10 22")).await;

        let reading = reader.read_vag_did(0xF40E).await;
        assert!(!reading.is_valid());
        assert_eq!(
            reading.error(),
            Some(&ObdError::NegativeResponse { service: 0x10, nrc: 0x22 })
        );
        assert_eq!(reader.session(), DiagnosticSession::Default);
        assert_eq!(adapter.count("22F40E"), 0);
    }

    #[tokio::test]
    async fn test_session_refusal_retries_once_in_extended() {
        let (mut reader, adapter) = reader(
            script()
                .expect("22F486", "7F 22 7F")
                .expect("1003", "50 03")
                .expect("22F486", "62 F4 86 82"),
        )
        .await;

        let reading = reader.read_vag_did(0xF486).await;
        assert_eq!(numeric(&reading), 90.0);
        assert_eq!(adapter.count("1003"), 1);
        assert_eq!(adapter.count("22F486"), 2);
        assert_eq!(reader.session(), DiagnosticSession::Extended);
    }

    #[tokio::test]
    async fn test_sub_function_refusal_retries_in_extended() {
        let (mut reader, adapter) = reader(
            script()
                .expect("22F486", "7F 22 7E")
                .expect("1003", "50 03")
                .expect("22F486", "62 F4 86 82"),
        )
        .await;

        let reading = reader.read_vag_did(0xF486).await;
        assert_eq!(numeric(&reading), 90.0);
        assert_eq!(adapter.count("1003"), 1);
        assert_eq!(reader.session(), DiagnosticSession::Extended);
    }

    #[tokio::test]
    async fn test_other_negative_response_is_not_retried() {
        let (mut reader, adapter) = reader(script().expect("22F486", "7F 22 31")).await;

        let reading = reader.read_vag_did(0xF486).await;
        assert_eq!(
            reading.error(),
            Some(&ObdError::NegativeResponse { service: 0x22, nrc: 0x31 })
        );
        assert_eq!(adapter.count("1003"), 0);
    }

    #[tokio::test]
    async fn test_response_pending_then_value() {
        let (mut reader, _adapter) =
            reader(script().expect("22F486", "7F 22 78\n62 F4 86 7B")).await;

        let reading = reader.read_vag_did(0xF486).await;
        assert_eq!(numeric(&reading), 83.0);
    }

    #[tokio::test]
    async fn test_multiframe_vin() {
        let (mut reader, _adapter) = reader(script().expect(
            "22F190",
            "014\n0: 62 F1 90 57 56 57\n1: 5A 5A 5A 31 4B 5A 37\n2: 57 31 32 33 34 35 36",
        ))
        .await;

        let reading = reader.read_vag_did(0xF190).await;
        assert_eq!(reading.value(), Some(&Value::Text("WVWZZZ1KZ7W123456".into())));
    }

    #[tokio::test]
    async fn test_find_oil_temperature_falls_back_to_did() {
        let (mut reader, _adapter) = reader(
            script()
                .expect("015C", "NO DATA")
                .expect("22F486", "62 F4 86 82"),
        )
        .await;

        let reading = reader.find_oil_temperature().await.unwrap();
        assert_eq!(reading.id(), 0xF486);
        assert_eq!(numeric(&reading), 90.0);
    }

    #[tokio::test]
    async fn test_batch_reads_keep_order() {
        let (mut reader, _adapter) = reader(
            script()
                .expect("010C", "41 0C 1A F8")
                .expect("010D", "NO DATA")
                .expect("0105", "41 05 7B"),
        )
        .await;

        let readings = reader.read_pids(&[0x0C, 0x0D, 0x05]).await;
        let ids: Vec<u16> = readings.iter().map(Reading::id).collect();
        assert_eq!(ids, vec![0x0C, 0x0D, 0x05]);
        assert!(!readings[1].is_valid());
    }

    #[tokio::test]
    async fn test_scan_vag_dids() {
        let (mut reader, _adapter) = reader(
            script()
                .expect("22F486", "62 F4 86 7B")
                .expect("22F406", "NO DATA"),
        )
        .await;

        let found = reader.scan_vag_dids(Some(&[0xF486, 0xF406])).await;
        assert_eq!(found, vec![0xF486]);
    }

    #[tokio::test]
    async fn test_reset_session() {
        let (mut reader, _adapter) = reader(script().expect("1003", "50 03")).await;

        reader.enter_extended_session().await.unwrap();
        assert_eq!(reader.session(), DiagnosticSession::Extended);
        reader.reset_session();
        assert_eq!(reader.session(), DiagnosticSession::Default);
    }
}
