//! Persistence of hologram records.
//!
//! A [`HoloRecord`] bundles a raw frame with its parameter document. Writers
//! implement [`RecordWriter`]; the container format is theirs to choose and is
//! never interpreted by the acquisition code. [`JsonSidecarWriter`] stores the
//! frame as a binary PGM image next to a JSON document with the attributes.
use crate::metadata::{HoloParameters, StagePosition};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use ndarray::Array2;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Frame and parameter document of one acquisition.
#[derive(Debug, Clone)]
pub struct HoloRecord {
    pub frame: Array2<u16>,
    pub parameters: HoloParameters,
    pub stage: Option<StagePosition>,
}

impl HoloRecord {
    /// Largest representable pixel value of the frame.
    pub fn max_value(&self) -> u16 {
        let bits = self.parameters.dhm.camera.bit_per_pixel.clamp(1, 16) as u32;
        ((1u32 << bits) - 1) as u16
    }
}

#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Writes `record` to `path`, returning the files created.
    async fn write(&self, record: &HoloRecord, path: &Path) -> Result<Vec<PathBuf>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameAttributes<'a> {
    file: String,
    height: usize,
    width: usize,
    max_value: u16,
    parameters: &'a HoloParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<StagePosition>,
}

/// Binary PGM frame plus JSON attribute document.
#[derive(Debug, Clone, Default)]
pub struct JsonSidecarWriter {
    pub pretty: bool,
}

impl JsonSidecarWriter {
    pub fn new() -> Self {
        Self { pretty: true }
    }
}

/// Encodes `frame` as binary PGM. Values above 255 use two bytes, most
/// significant first.
pub fn encode_pgm(frame: &Array2<u16>, max_value: u16) -> BytesMut {
    let (h, w) = frame.dim();
    let header = format!("P5\n{w} {h}\n{max_value}\n");
    let depth = if max_value > 255 { 2 } else { 1 };
    let mut buf = BytesMut::with_capacity(header.len() + h * w * depth);
    buf.put_slice(header.as_bytes());
    for &v in frame.iter() {
        let v = v.min(max_value);
        if depth == 2 {
            buf.put_u16(v);
        } else {
            buf.put_u8(v as u8);
        }
    }
    buf
}

#[async_trait]
impl RecordWriter for JsonSidecarWriter {
    async fn write(&self, record: &HoloRecord, path: &Path) -> Result<Vec<PathBuf>> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create storage directory at {:?}", dir))?;
        }
        let image_path = path.with_extension("pgm");
        let json_path = path.with_extension("json");

        let max_value = record.max_value();
        tokio::fs::write(&image_path, encode_pgm(&record.frame, max_value))
            .await
            .with_context(|| format!("Failed to write frame to {:?}", image_path))?;

        let (height, width) = record.frame.dim();
        let attributes = FrameAttributes {
            file: image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            height,
            width,
            max_value,
            parameters: &record.parameters,
            stage: record.stage,
        };
        let json = if self.pretty {
            serde_json::to_vec_pretty(&attributes)
        } else {
            serde_json::to_vec(&attributes)
        }
        .context("Failed to serialize record attributes to JSON")?;
        tokio::fs::write(&json_path, json)
            .await
            .with_context(|| format!("Failed to write attributes to {:?}", json_path))?;

        info!(path = %json_path.display(), height, width, "Hologram record written");
        Ok(vec![image_path, json_path])
    }
}

/// Reads the attribute document written next to a record.
pub async fn read_attributes(path: &Path) -> Result<serde_json::Value> {
    let json_path = path.with_extension("json");
    let text = tokio::fs::read(&json_path)
        .await
        .with_context(|| format!("Failed to read attributes from {:?}", json_path))?;
    serde_json::from_slice(&text).context("Failed to parse record attributes")
}
