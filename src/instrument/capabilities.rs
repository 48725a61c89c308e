use crate::error::DhmResult;
use crate::metadata::StagePosition;
use async_trait::async_trait;
use ndarray::Array2;

/// Capability for cameras whose exposure is set in integer shutter units.
///
/// Methods take `&mut self`: a session owns its instrument exclusively and
/// issues one request at a time.
#[async_trait]
pub trait HoloCamera: Send {
    /// Inclusive `(min, max)` shutter range.
    async fn shutter_range(&mut self) -> DhmResult<(i32, i32)>;
    async fn shutter(&mut self) -> DhmResult<i32>;
    async fn set_shutter(&mut self, shutter: i32) -> DhmResult<()>;
    /// Bits per pixel; a pixel at `(1 << bits) - 1` is saturated.
    async fn bit_depth(&mut self) -> DhmResult<u32>;
    async fn grab_frame(&mut self) -> DhmResult<Array2<u16>>;
}

/// Capability for the motor that balances the optical path lengths.
#[async_trait]
pub trait OplMotor: Send {
    /// Inclusive `(min, max)` travel in µm.
    async fn motor_range(&mut self) -> DhmResult<(f64, f64)>;
    async fn motor_position(&mut self) -> DhmResult<f64>;
    async fn move_motor(&mut self, position: f64) -> DhmResult<()>;
}

/// A holographic microscope: camera and OPL motor behind one connection.
pub trait Microscope: HoloCamera + OplMotor {}

impl<T: HoloCamera + OplMotor> Microscope for T {}

/// Capability for external sample stages.
#[async_trait]
pub trait StageController: Send + Sync {
    /// Position of the given axes, e.g. `"XYZ"`.
    async fn position(&self, axes: &str) -> DhmResult<StagePosition>;
}

/// Largest pixel value of a camera with the given bit depth.
pub fn saturation_value(bit_depth: u32) -> u16 {
    match bit_depth {
        0 => 0,
        1..=15 => (1u16 << bit_depth) - 1,
        _ => u16::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation_value() {
        assert_eq!(saturation_value(8), 255);
        assert_eq!(saturation_value(12), 4095);
        assert_eq!(saturation_value(16), u16::MAX);
    }
}
