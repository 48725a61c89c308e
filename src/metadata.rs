//! Measurement metadata.
//!
//! Every hologram leaves the instrument together with a description of the
//! state it was taken in. This module collects those records:
//!
//! - **`DhmParameters`**: snapshot of server, DHM, objective, camera, laser and
//!   motor state as reported by the server. Serialized with the camelCase keys
//!   of the parameter document stored alongside each hologram.
//! - **`OplParameters`** / **`ImageParameters`**: settings and results of the OPL
//!   scan and basic statistics of the stored frame.
//! - **`HoloParameters`**: the complete document, the DHM snapshot extended by the
//!   two sections above.
//! - **`AcquisitionMetadata`**: motor position, shutter, optional stage position
//!   and timestamp captured when a reference hologram is taken.
//!
//! Two pieces are attached to every parameter document: the software version
//! and the DHM manufacturer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manufacturer of the microscope served by the DHM server.
pub const DHM_MANUFACTURER: &str = "LyncéeTec";

/// Position of the sample stage in µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    #[serde(rename = "xPositionUm")]
    pub x: f64,
    #[serde(rename = "yPositionUm")]
    pub y: f64,
    #[serde(rename = "zPositionUm")]
    pub z: f64,
}

/// Instrument state captured together with a reference hologram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionMetadata {
    pub motor_position: f64,
    pub shutter: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StagePosition>,
    pub timestamp: DateTime<Utc>,
}

impl AcquisitionMetadata {
    pub fn new(motor_position: f64, shutter: i32, stage: Option<StagePosition>) -> Self {
        Self {
            motor_position,
            shutter,
            stage,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: i32,
    pub command_version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhmInfo {
    pub serial: String,
    pub config_id: i32,
    /// Name of the active configuration, if the server lists it
    pub config_name: Option<String>,
    pub manufacturer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveInfo {
    pub name: String,
    pub description: String,
    pub magnification: f64,
    pub numerical_aperture: f64,
    pub x_pixel_size_um: f64,
    pub y_pixel_size_um: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub serial: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    pub max_width: i32,
    pub max_height: i32,
    pub width: i32,
    pub height: i32,
    pub x_offset: i32,
    pub y_offset: i32,
    pub bit_per_pixel: i32,
    pub stride: i32,
    pub pixel_size_um: f32,
    pub min_shutter: i32,
    pub max_shutter: i32,
    pub shutter: i32,
    pub min_shutter_us: f32,
    pub max_shutter_us: f32,
    pub shutter_us: f32,
    pub min_gain: i32,
    pub max_gain: i32,
    pub gain: i32,
    pub min_brightness: i32,
    pub max_brightness: i32,
    pub brightness: i32,
}

impl CameraInfo {
    /// Camera vendor derived from the model name.
    pub fn detect_manufacturer(name: &str) -> Option<String> {
        name.contains("Basler").then(|| "Basler".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaserInfo {
    pub wavelength_um: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorInfo {
    pub min_coder_pos: i32,
    pub max_coder_pos: i32,
    pub coder_pos: i32,
    pub min_pos: f32,
    pub max_pos: f32,
    pub pos: f32,
    pub unit_pos: String,
}

/// Snapshot of the instrument state reported by the DHM server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhmParameters {
    pub server: ServerInfo,
    pub dhm: DhmInfo,
    pub objective: ObjectiveInfo,
    pub camera: CameraInfo,
    pub laser: LaserInfo,
    pub motor: MotorInfo,
}

/// Settings and outcome of the most recent OPL scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OplParameters {
    pub mode: String,
    pub short_steps: usize,
    pub step_size_um: f64,
    pub contrast_threshold: f64,
    pub min_contrast: f64,
    pub min_span_um: f64,
    pub opt_mode: bool,
    pub init_position_um: Option<f64>,
    pub scan_result_um: Option<f64>,
}

/// Basic evaluation of a stored hologram frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageParameters {
    /// Frames grabbed by the exposure optimization, if it ran
    pub opt_count: Option<usize>,
    pub max_overflow: usize,
    pub min_value: u16,
    pub max_value: u16,
    pub average_value: f64,
    pub contrast_quantile: f64,
    pub low_quantile_value: u16,
    pub median_value: u16,
    pub high_quantile_value: u16,
    pub underflow_pixel: usize,
    pub overflow_pixel: usize,
}

/// Complete parameter document of a stored hologram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoloParameters {
    #[serde(flatten)]
    pub dhm: DhmParameters,
    pub opl: OplParameters,
    pub image: ImageParameters,
    pub software_version: String,
}

impl HoloParameters {
    pub fn new(dhm: DhmParameters, opl: OplParameters, image: ImageParameters) -> Self {
        Self {
            dhm,
            opl,
            image,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_manufacturer() {
        assert_eq!(
            CameraInfo::detect_manufacturer("Basler acA1300-60gm"),
            Some("Basler".to_string())
        );
        assert_eq!(CameraInfo::detect_manufacturer("Simulated camera"), None);
    }

    #[test]
    fn test_stage_position_keys() {
        let stage = StagePosition {
            x: 1.0,
            y: 2.0,
            z: -3.5,
        };
        let json = serde_json::to_value(stage).unwrap();
        assert_eq!(json["xPositionUm"], 1.0);
        assert_eq!(json["zPositionUm"], -3.5);
    }

    #[test]
    fn test_acquisition_metadata_omits_missing_stage() {
        let meta = AcquisitionMetadata::new(1375.0, 120, None);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["motorPosition"], 1375.0);
        assert_eq!(json["shutter"], 120);
        assert!(json.get("stage").is_none());
    }
}
