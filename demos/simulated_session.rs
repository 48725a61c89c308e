//! Full acquisition against the simulated microscope.
//!
//! Starts a loopback DHM server, balances the optical path, evaluates a
//! reference hologram and writes one record next to the working directory.
//!
//! ```bash
//! cargo run --example simulated_session -- /tmp/holo/sample_001
//! ```

use anyhow::Result;
use dhm_daq::config::DhmConfig;
use dhm_daq::data::{JsonSidecarWriter, RecordWriter};
use dhm_daq::instrument::{MockDhmServer, SimulatedDhm};
use dhm_daq::logging;
use dhm_daq::session::HoloClient;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = DhmConfig::default();
    logging::init_from_config(&config)?;

    let server = MockDhmServer::start(SimulatedDhm::new().with_noise(1.0, 7)).await?;
    config.server = server.config();

    let mut holo = HoloClient::connect(&config).await?;
    let scan = holo.motor_scan(None).await?;
    info!(position = scan.position, "Path lengths balanced");

    let reference = holo.ref_image(None, None, None).await?;
    for (name, value) in reference.basis.names().iter().zip(&reference.coefficients) {
        info!(term = %name, value, "Reference phase coefficient");
    }

    let record = holo.container(true).await?;
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("holo/sample_001"));
    let files = JsonSidecarWriter::new().write(&record, &path).await?;
    info!(?files, "Record stored");

    holo.close().await?;
    Ok(())
}
