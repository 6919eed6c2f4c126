//! OBD Probe - Main Entry Point

use anyhow::Context;
use obd_probe::{init_logging, load_config, run_session};
use obd_protocol::ConnectionManager;
use obd_reader::DiagnosticReader;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config.log_level)?;

    info!("=== OBD Probe v{} ===", env!("CARGO_PKG_VERSION"));

    let mut manager = ConnectionManager::open(config.connection.clone())
        .await
        .with_context(|| format!("Could not open {}", config.connection.port))?;

    // on failure the manager is dropped here, which releases the port
    manager
        .initialize(config.connection.protocol)
        .await
        .context("Adapter initialization failed")?;

    let mut reader = DiagnosticReader::new(manager, config.reader.clone());
    let result = run_session(&mut reader, &config, &mut std::io::stdout()).await;
    reader.close();

    info!("Session finished");
    result
}
