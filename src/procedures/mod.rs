//! Closed-loop measurement procedures.
//!
//! Both procedures are written against the capability traits in
//! [`crate::instrument::capabilities`] and run one request at a time.

pub mod exposure;
pub mod opl_scan;

pub use exposure::{ExposureOptimizer, OptimizedExposure};
pub use opl_scan::{ContrastProbe, ContrastSeries, MicroscopeProbe, OplScanResult, OplScanner};
