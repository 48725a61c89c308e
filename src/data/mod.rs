//! Frame processing and storage.
//!
//! - [`hologram`]: reconstruction of the wave field and phase fit of a hologram
//! - [`stats`]: pixel statistics stored with each frame
//! - [`storage`]: writers for hologram records
//!
//! [`fft`], [`filters`] and [`unwrap`] are the numerical building blocks.

pub mod fft;
pub mod filters;
pub mod hologram;
pub mod stats;
pub mod storage;
pub mod unwrap;

pub use hologram::{reference_fit, PolynomialBasis, ReferenceFit, SpectralOrder};
pub use stats::ImageStatistics;
pub use storage::{HoloRecord, JsonSidecarWriter, RecordWriter};
