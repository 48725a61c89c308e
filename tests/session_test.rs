//! End-to-end acquisition tests: session over the loopback server, plus the
//! microscope-backed contrast probe running in-process.

use async_trait::async_trait;
use dhm_daq::config::DhmConfig;
use dhm_daq::data::storage::read_attributes;
use dhm_daq::data::{JsonSidecarWriter, RecordWriter};
use dhm_daq::error::DhmResult;
use dhm_daq::instrument::{DhmClient, MockDhmServer, SimulatedDhm, StageController};
use dhm_daq::metadata::StagePosition;
use dhm_daq::procedures::{ContrastProbe, ExposureOptimizer, MicroscopeProbe};
use dhm_daq::session::HoloClient;

const STAGE: StagePosition = StagePosition {
    x: 1.5,
    y: -2.0,
    z: 10.0,
};

struct FixedStage;

#[async_trait]
impl StageController for FixedStage {
    async fn position(&self, _axes: &str) -> DhmResult<StagePosition> {
        Ok(STAGE)
    }
}

/// Session with exposure optimization disabled during OPL scans, so every
/// contrast sample is taken at the default shutter.
async fn session(server: &MockDhmServer) -> HoloClient {
    let mut config = DhmConfig::default();
    config.opl.optimize_exposure = false;
    let client = DhmClient::connect(&server.config()).await.unwrap();
    HoloClient::new(client, &config).with_stage(Box::new(FixedStage))
}

#[tokio::test]
async fn test_optimized_image_is_well_exposed() {
    let server = MockDhmServer::start(SimulatedDhm::new()).await.unwrap();
    let mut holo = session(&server).await;

    let (frame, count) = holo.get_image(true).await.unwrap();
    let count = count.unwrap();
    assert!(count > 1 && count <= 100);

    let overflow = frame.iter().filter(|&&v| v >= 255).count();
    assert!(overflow <= 9);
    assert!(frame.iter().copied().max().unwrap() >= 250);

    let (plain, count) = holo.get_image(false).await.unwrap();
    assert_eq!(count, None);
    assert_eq!(plain.dim(), (128, 128));
}

#[tokio::test]
async fn test_motor_scan_finds_balanced_path() {
    let server = MockDhmServer::start(SimulatedDhm::new()).await.unwrap();
    let mut holo = session(&server).await;

    let result = holo.motor_scan(None).await.unwrap();
    assert_eq!(result.initial, Some(1000.0));
    assert!((result.position - 1375.0).abs() < 25.0, "{}", result.position);
    assert_eq!(holo.last_scan().map(|s| s.position), Some(result.position));

    let parked = server.state().lock().await.motor_position;
    assert!((parked - result.position).abs() < 0.01);
}

#[tokio::test]
async fn test_reference_hologram_metadata() {
    let mut dhm = SimulatedDhm::new();
    dhm.motor_position = dhm.coherence_center;
    let server = MockDhmServer::start(dhm).await.unwrap();
    let mut holo = session(&server).await;

    let fit = holo.ref_image(Some(4), None, None).await.unwrap();
    assert_eq!((fit.spectral_order.x, fit.spectral_order.y), (32, 32));
    assert_eq!(fit.coefficients.len(), 6);
    assert!(fit.coefficient("x").unwrap().abs() < 1e-3);
    assert!(fit.coefficient("y").unwrap().abs() < 1e-3);

    let metadata = fit.metadata.unwrap();
    assert!((metadata.motor_position - 1375.0).abs() < 1e-3);
    assert_eq!(metadata.shutter, 100);
    assert_eq!(metadata.stage, Some(STAGE));

    // Overrides persist for later calls
    assert_eq!(holo.reference_config().blur, 4);
    assert_eq!(holo.reference_config().order, 2);
}

#[tokio::test]
async fn test_container_round_trip_to_disk() {
    let server = MockDhmServer::start(SimulatedDhm::new()).await.unwrap();
    let mut holo = session(&server).await;

    let record = holo.container(true).await.unwrap();
    assert_eq!(record.stage, Some(STAGE));
    let image = &record.parameters.image;
    assert!(image.opt_count.is_some());
    assert!(image.overflow_pixel <= image.max_overflow);
    assert_eq!(record.parameters.opl.scan_result_um, None);
    assert_eq!(record.parameters.dhm.dhm.manufacturer, "LyncéeTec");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("holo").join("sample_001");
    let files = JsonSidecarWriter::new().write(&record, &path).await.unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.exists()));

    let attributes = read_attributes(&path).await.unwrap();
    assert_eq!(attributes["file"], "sample_001.pgm");
    assert_eq!(attributes["height"], 128);
    assert_eq!(attributes["maxValue"], 255);
    assert_eq!(attributes["stage"]["xPositionUm"], 1.5);
    assert_eq!(attributes["parameters"]["camera"]["manufacturer"], "Basler");
    assert_eq!(attributes["parameters"]["laser"]["wavelengthUm"].as_f64().map(|w| (w * 1e3).round()), Some(666.0));
    assert!(attributes["parameters"]["image"]["optCount"].is_u64());

    holo.close().await.unwrap();
}

#[tokio::test]
async fn test_probe_backs_off_after_optimizing() {
    let mut dhm = SimulatedDhm::new();
    // Far from the coherence center the frame is uniform at 0.5 per shutter unit
    dhm.motor_position = 0.0;
    let mut probe = MicroscopeProbe::new(&mut dhm, ExposureOptimizer::default(), 16);

    let contrast = probe.probe(0.0, true).await.unwrap();
    assert!(contrast < 0.01);
    drop(probe);
    // 508 is the last shutter below saturation
    assert_eq!(dhm.shutter, 506);
}

#[tokio::test]
async fn test_probe_measures_fringe_contrast() {
    let mut dhm = SimulatedDhm::new();
    let center = dhm.coherence_center;
    let mut probe = MicroscopeProbe::new(&mut dhm, ExposureOptimizer::default(), 16);

    let far = probe.probe(center - 500.0, false).await.unwrap();
    let near = probe.probe(center, false).await.unwrap();
    assert!(near > 0.3, "{near}");
    assert!(far < near / 10.0);
    probe.park(center).await.unwrap();
    assert_eq!(probe.current_position().await.unwrap(), center);
}
