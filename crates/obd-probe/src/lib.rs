//! OBD Probe
//!
//! Drives one diagnostic session end to end and reports every result as a
//! JSON line on stdout. Logs go to stderr.

use anyhow::Context;
use config::{Config, Environment, File};
use obd_protocol::{AdapterInfo, ConnectionConfig, COMMON_PIDS};
use obd_reader::{DiagnosticReader, DtcRecord, Reading, ReaderConfig};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Probe configuration.
///
/// Loaded from an optional `obd-probe.toml` (or .json/.yaml) in the working
/// directory, then overridden by `OBD_PROBE_*` environment variables with
/// `__` between nested keys, e.g. `OBD_PROBE_CONNECTION__PORT=/dev/ttyUSB0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub connection: ConnectionConfig,
    pub reader: ReaderConfig,
    /// Maximum log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Standard PIDs to read
    pub pids: Vec<u8>,
    /// VAG DIDs to read
    pub dids: Vec<u16>,
    /// Look for an oil temperature source
    pub oil_temperature: bool,
    /// Read stored trouble codes
    pub read_dtcs: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reader: ReaderConfig::default(),
            log_level: "info".to_string(),
            pids: COMMON_PIDS.to_vec(),
            dids: Vec::new(),
            oil_temperature: true,
            read_dtcs: true,
        }
    }
}

/// Load the layered configuration
pub fn load_config() -> anyhow::Result<ProbeConfig> {
    let config = Config::builder()
        .add_source(File::with_name("obd-probe").required(false))
        .add_source(
            Environment::with_prefix("OBD_PROBE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to load configuration")?;

    config
        .try_deserialize()
        .context("Invalid configuration")
}

/// Initialize logging
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// One line of probe output
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    Adapter(AdapterInfo),
    SupportedPids { pids: Vec<u16> },
    Reading(Reading),
    OilTemperature(Reading),
    Dtcs { codes: Vec<DtcRecord> },
}

/// Run the session steps against an initialized reader, writing one JSON
/// line per result to `out`.
///
/// Only I/O errors on `out` abort the run; adapter and ECU failures are
/// logged or reported inline.
pub async fn run_session<S, W>(
    reader: &mut DiagnosticReader<S>,
    config: &ProbeConfig,
    out: &mut W,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write,
{
    match reader.manager_mut().adapter_info().await {
        Ok(info) => {
            info!(
                "Adapter: {} on {}",
                info.device_id,
                info.protocol_name.as_deref().unwrap_or("unknown protocol")
            );
            emit(out, &Report::Adapter(info))?;
        }
        Err(e) => warn!("Could not read adapter information: {}", e),
    }

    let supported = reader.scan_supported_pids().await;
    emit(
        out,
        &Report::SupportedPids {
            pids: supported.iter().copied().collect(),
        },
    )?;

    // an empty scan usually means the bitmask PIDs are unsupported, not the PIDs
    let pids: Vec<u8> = config
        .pids
        .iter()
        .copied()
        .filter(|pid| {
            let keep = supported.is_empty() || supported.contains(&(*pid as u16));
            if !keep {
                debug!("Skipping unsupported PID {:02X}", pid);
            }
            keep
        })
        .collect();

    for reading in reader.read_pids(&pids).await {
        info!("{}", reading);
        emit(out, &Report::Reading(reading))?;
    }

    for reading in reader.read_vag_dids(&config.dids).await {
        info!("{}", reading);
        emit(out, &Report::Reading(reading))?;
    }

    if config.oil_temperature {
        if let Some(reading) = reader.find_oil_temperature().await {
            info!("{}", reading);
            emit(out, &Report::OilTemperature(reading))?;
        }
    }

    if config.read_dtcs {
        match reader.read_dtcs().await {
            Ok(codes) => {
                if codes.is_empty() {
                    info!("No stored DTCs");
                }
                for code in &codes {
                    info!("DTC {} ({})", code, code.system());
                }
                emit(out, &Report::Dtcs { codes })?;
            }
            Err(e) => warn!("Could not read DTCs: {}", e),
        }
    }

    Ok(())
}

fn emit<W: Write>(out: &mut W, report: &Report) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, report)?;
    writeln!(out)?;
    Ok(())
}
