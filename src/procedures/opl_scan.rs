//! Optical path length balancing.
//!
//! Interference fringes are only visible while the object and reference beams
//! travel paths of nearly equal length. The OPL motor changes the length of
//! the reference arm; the contrast of a frame is the weight of its first
//! diffraction order. The scan runs in three phases:
//!
//! 1. **Coarse scan** over a range in fixed steps. A sample above the
//!    threshold gets four bracketing samples at ±0.3 and ±0.7 steps. The scan
//!    stops once the maximum has a neighbor on both sides and all three exceed
//!    the threshold.
//! 2. **Edge extension**: if the maximum sits at either end of the samples,
//!    sampling continues outwards one step at a time.
//! 3. **Bisection** of the larger half of the bracket around the maximum until
//!    either the contrast differences or the bracket width fall below their
//!    limits.
//!
//! All samples of a scan live in a [`ContrastSeries`] owned by that scan.

use crate::config::{OplConfig, ScanMode};
use crate::data::hologram::{locate_order, to_f64};
use crate::error::{DhmError, DhmResult};
use crate::instrument::capabilities::Microscope;
use crate::procedures::exposure::ExposureOptimizer;
use async_trait::async_trait;
use std::cmp::Ordering;
use tracing::{debug, info, instrument};

/// Upper bound on bisection steps.
const MAX_BISECTIONS: usize = 100;

/// Contrast samples ordered by motor position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContrastSeries {
    samples: Vec<(f64, f64)>,
}

impl ContrastSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Adds a sample. An existing sample at the same position gets the new value.
    pub fn insert(&mut self, position: f64, value: f64) {
        let i = self.samples.partition_point(|&(p, _)| p < position);
        match self.samples.get_mut(i) {
            Some(sample) if sample.0 == position => sample.1 = value,
            _ => self.samples.insert(i, (position, value)),
        }
    }

    pub fn get(&self, position: f64) -> Option<f64> {
        let i = self.samples.partition_point(|&(p, _)| p < position);
        self.samples
            .get(i)
            .filter(|&&(p, _)| p == position)
            .map(|&(_, v)| v)
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    /// Index of the first sample with maximum contrast.
    pub fn imax(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &(_, v)) in self.samples.iter().enumerate() {
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn min_position(&self) -> Option<f64> {
        self.samples.first().map(|s| s.0)
    }

    pub fn max_position(&self) -> Option<f64> {
        self.samples.last().map(|s| s.0)
    }

    /// Where the maximum lacks a neighbor: `Less` at the lower end, `Greater`
    /// at the upper end, `Equal` with neighbors on both sides.
    pub fn side(&self) -> Option<Ordering> {
        let imax = self.imax()?;
        Some(if imax == 0 {
            Ordering::Less
        } else if imax + 1 >= self.len() {
            Ordering::Greater
        } else {
            Ordering::Equal
        })
    }

    pub fn has_triple(&self) -> bool {
        self.side() == Some(Ordering::Equal)
    }

    fn triple_samples(&self) -> Option<&[(f64, f64)]> {
        if !self.has_triple() {
            return None;
        }
        let imax = self.imax()?;
        self.samples.get(imax - 1..imax + 2)
    }

    /// Positions of the maximum and its two neighbors.
    pub fn triple(&self) -> Option<[f64; 3]> {
        self.triple_samples().map(|s| [s[0].0, s[1].0, s[2].0])
    }

    pub fn triple_values(&self) -> Option<[f64; 3]> {
        self.triple_samples().map(|s| [s[0].1, s[1].1, s[2].1])
    }

    /// True when a triple exists and all of its contrasts exceed `threshold`.
    pub fn triple_above(&self, threshold: f64) -> bool {
        self.triple_values()
            .is_some_and(|values| values.iter().all(|&v| v > threshold))
    }

    pub fn max_above(&self, threshold: f64) -> bool {
        self.best().is_some_and(|(_, v)| v > threshold)
    }

    /// Sample with maximum contrast.
    pub fn best(&self) -> Option<(f64, f64)> {
        self.imax().map(|i| self.samples[i])
    }
}

/// Contrast measurement at a motor position.
#[async_trait]
pub trait ContrastProbe: Send {
    /// Inclusive `(min, max)` motor travel in µm.
    async fn travel_range(&mut self) -> DhmResult<(f64, f64)>;
    async fn current_position(&mut self) -> DhmResult<f64>;
    /// Moves to `position` and measures the contrast there, optionally after
    /// optimizing the exposure.
    async fn probe(&mut self, position: f64, optimize: bool) -> DhmResult<f64>;
    /// Leaves the motor at `position`.
    async fn park(&mut self, position: f64) -> DhmResult<()>;
}

/// Measures contrast as the first-order peak weight of live camera frames.
pub struct MicroscopeProbe<'a, M: Microscope + ?Sized> {
    microscope: &'a mut M,
    exposure: ExposureOptimizer,
    blur: usize,
}

impl<'a, M: Microscope + ?Sized> MicroscopeProbe<'a, M> {
    pub fn new(microscope: &'a mut M, exposure: ExposureOptimizer, blur: usize) -> Self {
        Self {
            microscope,
            exposure,
            blur,
        }
    }
}

#[async_trait]
impl<M: Microscope + ?Sized> ContrastProbe for MicroscopeProbe<'_, M> {
    async fn travel_range(&mut self) -> DhmResult<(f64, f64)> {
        self.microscope.motor_range().await
    }

    async fn current_position(&mut self) -> DhmResult<f64> {
        self.microscope.motor_position().await
    }

    async fn probe(&mut self, position: f64, optimize: bool) -> DhmResult<f64> {
        self.microscope.move_motor(position).await?;
        let frame = if optimize {
            let optimized = self.exposure.optimize(&mut *self.microscope).await?;
            // back off from the saturation limit for the following samples
            let (min_shutter, _) = self.microscope.shutter_range().await?;
            self.microscope
                .set_shutter((optimized.shutter - 2).max(min_shutter))
                .await?;
            optimized.frame
        } else {
            self.microscope.grab_frame().await?
        };
        match locate_order(&to_f64(&frame), self.blur) {
            Ok(order) => Ok(order.weight),
            Err(DhmError::NoDetectableOrder) => Ok(0.0),
            Err(e) => Err(e),
        }
    }

    async fn park(&mut self, position: f64) -> DhmResult<()> {
        self.microscope.move_motor(position).await
    }
}

/// Outcome of [`OplScanner::scan`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OplScanResult {
    /// Position of maximum contrast; the motor is left here.
    pub position: f64,
    /// Center of the short scan, if one ran.
    pub initial: Option<f64>,
    /// Bracket the bisection started from.
    pub triple: [f64; 3],
}

/// Samples and bracket of one coarse scan.
#[derive(Debug, Clone)]
pub struct CoarseScan {
    pub series: ContrastSeries,
    /// `None` when no interference was found.
    pub triple: Option<[f64; 3]>,
}

impl CoarseScan {
    fn best_contrast(&self) -> f64 {
        self.series.best().map_or(0.0, |(_, v)| v)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OplScanner {
    pub config: OplConfig,
}

impl OplScanner {
    pub fn new(config: OplConfig) -> Self {
        Self { config }
    }

    /// Coarse range of a short scan around `center`, shifted into the travel.
    pub fn short_range(&self, center: f64, travel: (f64, f64)) -> DhmResult<(f64, f64)> {
        let (min, max) = travel;
        let width = self.config.step_um * self.config.steps.saturating_sub(1) as f64;
        let mut start = (center - width / 2.0).max(min);
        let mut end = start + width;
        if end > max {
            end = max;
            start = end - width;
            if start < min {
                return Err(DhmError::RangeTooSmall {
                    start,
                    end,
                    min,
                    max,
                });
            }
        }
        Ok((start, end))
    }

    /// Scans `steps` positions around `center`.
    pub async fn short_scan<P: ContrastProbe + ?Sized>(&self, probe: &mut P, center: f64) -> DhmResult<CoarseScan> {
        let travel = probe.travel_range().await?;
        let (start, end) = self.short_range(center, travel)?;
        self.run_scan(probe, start, end, travel).await
    }

    /// Scans the full motor travel.
    pub async fn long_scan<P: ContrastProbe + ?Sized>(&self, probe: &mut P) -> DhmResult<CoarseScan> {
        let travel = probe.travel_range().await?;
        self.run_scan(probe, travel.0, travel.1, travel).await
    }

    /// Coarse scan from `start` to `end` followed by edge extension.
    #[instrument(skip(self, probe, travel))]
    pub async fn run_scan<P: ContrastProbe + ?Sized>(
        &self,
        probe: &mut P,
        start: f64,
        end: f64,
        travel: (f64, f64),
    ) -> DhmResult<CoarseScan> {
        self.config.validate()?;
        let dm = self.config.step_um;
        let threshold = self.config.threshold;
        let mut series = ContrastSeries::new();
        let mut optimize = self.config.optimize_exposure;

        let mut i = 0usize;
        loop {
            let m = end.min(start + i as f64 * dm);
            self.sample(probe, &mut series, m, optimize).await?;
            optimize = false;

            if series.get(m).is_some_and(|c| c > threshold) {
                for offset in [-0.7, -0.3, 0.3, 0.7] {
                    let bracket = (m + offset * dm).clamp(travel.0, travel.1);
                    self.sample(probe, &mut series, bracket, false).await?;
                }
            }
            if series.triple_above(threshold) || m >= end {
                break;
            }
            i += 1;
        }

        if !series.max_above(threshold) {
            return Ok(CoarseScan {
                series,
                triple: None,
            });
        }
        let triple = self.extend_edges(probe, &mut series, travel).await?;
        Ok(CoarseScan { series, triple })
    }

    /// Samples outwards until the maximum has a neighbor on both sides.
    ///
    /// Returns `None` if the maximum stays at the end of the motor travel.
    pub async fn extend_edges<P: ContrastProbe + ?Sized>(
        &self,
        probe: &mut P,
        series: &mut ContrastSeries,
        travel: (f64, f64),
    ) -> DhmResult<Option<[f64; 3]>> {
        let dm = self.config.step_um;
        while series.side() == Some(Ordering::Less) {
            let Some(lowest) = series.min_position() else {
                return Ok(None);
            };
            let m = (lowest - dm).max(travel.0);
            if m >= lowest {
                debug!(position = lowest, "Contrast maximum at lower travel limit");
                return Ok(None);
            }
            self.sample(probe, series, m, false).await?;
        }
        while series.side() == Some(Ordering::Greater) {
            let Some(highest) = series.max_position() else {
                return Ok(None);
            };
            let m = (highest + dm).min(travel.1);
            if m <= highest {
                debug!(position = highest, "Contrast maximum at upper travel limit");
                return Ok(None);
            }
            self.sample(probe, series, m, false).await?;
        }
        Ok(series.triple())
    }

    async fn sample<P: ContrastProbe + ?Sized>(
        &self,
        probe: &mut P,
        series: &mut ContrastSeries,
        position: f64,
        optimize: bool,
    ) -> DhmResult<()> {
        if series.get(position).is_some() {
            return Ok(());
        }
        let contrast = probe.probe(position, optimize).await?;
        series.insert(position, contrast);
        info!(sample = series.len(), position, contrast, "Motor scan");
        Ok(())
    }

    /// Narrows `triple` down to the position of maximum contrast.
    #[instrument(skip(self, probe))]
    pub async fn bisect_max<P: ContrastProbe + ?Sized>(&self, probe: &mut P, triple: [f64; 3]) -> DhmResult<f64> {
        let [mut m0, mut m1, mut m2] = triple;
        let mut c1 = probe.probe(m1, self.config.optimize_exposure).await?;
        let mut c0 = probe.probe(m0, false).await?;
        let mut c2 = probe.probe(m2, false).await?;
        if c0 > c1 || c2 > c1 {
            return Err(DhmError::NoContrastPeak {
                positions: [m0, m1, m2],
                contrast: [c0, c1, c2],
            });
        }

        let min_contrast = self.config.min_contrast;
        let min_span = self.config.min_span_um;
        for step in 1..=MAX_BISECTIONS {
            if (c1 - c0).abs().max((c1 - c2).abs()) <= min_contrast || m2 - m0 <= min_span {
                break;
            }
            if m1 - m0 > m2 - m1 {
                let m = (m0 + m1) / 2.0;
                let c = probe.probe(m, false).await?;
                if c > c1 {
                    (m2, c2) = (m1, c1);
                    (m1, c1) = (m, c);
                } else {
                    (m0, c0) = (m, c);
                }
            } else {
                let m = (m1 + m2) / 2.0;
                let c = probe.probe(m, false).await?;
                if c > c1 {
                    (m0, c0) = (m1, c1);
                    (m1, c1) = (m, c);
                } else {
                    (m2, c2) = (m, c);
                }
            }
            debug!(step, m0, m1, m2, c0, c1, c2, "Bisect");
        }

        let position = (m0 + m2) / 2.0;
        info!(position, "Bisection result");
        Ok(position)
    }

    /// Finds the position of maximum interference contrast and moves there.
    ///
    /// Short scans are centered on `start`, or on the current motor position.
    pub async fn scan<P: ContrastProbe + ?Sized>(&self, probe: &mut P, start: Option<f64>) -> DhmResult<OplScanResult> {
        let mode = self.config.mode;
        let mut initial = None;
        let mut triple = None;

        if matches!(mode, ScanMode::Short | ScanMode::Both) {
            let center = match start {
                Some(m) => m,
                None => probe.current_position().await?,
            };
            initial = Some(center);
            let short = self.short_scan(probe, center).await?;
            triple = short.triple;
            if triple.is_none() {
                if mode == ScanMode::Short {
                    return Err(DhmError::InterferenceNotFound {
                        mode: "Short",
                        best: short.best_contrast(),
                    });
                }
                info!(best = short.best_contrast(), "Short scan found no interference, scanning full travel");
            }
        }

        let triple = match triple {
            Some(triple) => triple,
            None => {
                let long = self.long_scan(probe).await?;
                long.triple.ok_or(DhmError::InterferenceNotFound {
                    mode: "Long",
                    best: long.best_contrast(),
                })?
            }
        };

        let position = self.bisect_max(probe, triple).await?;
        probe.park(position).await?;
        Ok(OplScanResult {
            position,
            initial,
            triple,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gaussian contrast peak over a motor with limited travel.
    struct PeakProbe {
        center: f64,
        width: f64,
        height: f64,
        travel: (f64, f64),
        position: f64,
        visited: Vec<(f64, bool)>,
    }

    impl PeakProbe {
        fn new(center: f64, width: f64, travel: (f64, f64)) -> Self {
            Self {
                center,
                width,
                height: 0.8,
                travel,
                position: travel.0,
                visited: Vec::new(),
            }
        }

        fn contrast(&self, m: f64) -> f64 {
            let d = m - self.center;
            self.height * (-d * d / (2.0 * self.width * self.width)).exp()
        }
    }

    #[async_trait]
    impl ContrastProbe for PeakProbe {
        async fn travel_range(&mut self) -> DhmResult<(f64, f64)> {
            Ok(self.travel)
        }

        async fn current_position(&mut self) -> DhmResult<f64> {
            Ok(self.position)
        }

        async fn probe(&mut self, position: f64, optimize: bool) -> DhmResult<f64> {
            assert!(position >= self.travel.0 && position <= self.travel.1);
            self.position = position;
            self.visited.push((position, optimize));
            Ok(self.contrast(position))
        }

        async fn park(&mut self, position: f64) -> DhmResult<()> {
            self.position = position;
            Ok(())
        }
    }

    fn scanner(mode: ScanMode, threshold: f64) -> OplScanner {
        OplScanner::new(OplConfig {
            mode,
            threshold,
            ..OplConfig::default()
        })
    }

    #[test]
    fn test_series_insert_keeps_order_and_overwrites() {
        let mut series = ContrastSeries::new();
        series.insert(500.0, 0.1);
        series.insert(250.0, 0.3);
        series.insert(750.0, 0.2);
        series.insert(500.0, 0.4);
        assert_eq!(series.len(), 3);
        assert_eq!(series.samples(), &[(250.0, 0.3), (500.0, 0.4), (750.0, 0.2)]);
        assert_eq!(series.get(500.0), Some(0.4));
        assert_eq!(series.get(600.0), None);
        assert_eq!(series.triple(), Some([250.0, 500.0, 750.0]));
        assert!(series.triple_above(0.15));
        assert!(!series.triple_above(0.25));
    }

    #[test]
    fn test_series_side_of_maximum() {
        let mut series = ContrastSeries::new();
        assert_eq!(series.side(), None);
        series.insert(0.0, 0.5);
        series.insert(1.0, 0.2);
        assert_eq!(series.side(), Some(Ordering::Less));
        series.insert(2.0, 0.9);
        assert_eq!(series.side(), Some(Ordering::Greater));
        assert!(!series.has_triple());
        assert_eq!(series.triple(), None);
    }

    #[test]
    fn test_short_range_is_shifted_into_travel() {
        let scanner = scanner(ScanMode::Short, 0.2);
        assert_eq!(scanner.short_range(1500.0, (0.0, 5000.0)).unwrap(), (250.0, 2750.0));
        assert_eq!(scanner.short_range(100.0, (0.0, 5000.0)).unwrap(), (0.0, 2500.0));
        assert_eq!(scanner.short_range(4900.0, (0.0, 5000.0)).unwrap(), (2500.0, 5000.0));
        assert!(matches!(
            scanner.short_range(1000.0, (0.0, 2000.0)),
            Err(DhmError::RangeTooSmall { .. })
        ));
    }

    #[tokio::test]
    async fn test_long_scan_brackets_peak() {
        let scanner = scanner(ScanMode::Long, 0.005);
        let mut probe = PeakProbe::new(1375.0, 40.0, (0.0, 2500.0));
        let coarse = scanner.long_scan(&mut probe).await.unwrap();

        assert_eq!(coarse.triple, Some([1250.0, 1325.0, 1425.0]));
        // only the first sample optimizes the exposure
        assert_eq!(probe.visited[0], (0.0, true));
        assert!(probe.visited[1..].iter().all(|&(_, opt)| !opt));
        // the scan stops as soon as the triple is complete
        assert!(coarse.series.get(1500.0).is_none());
    }

    #[tokio::test]
    async fn test_scan_converges_on_peak() {
        let scanner = scanner(ScanMode::Long, 0.005);
        let mut probe = PeakProbe::new(1375.0, 40.0, (0.0, 2500.0));
        let result = scanner.scan(&mut probe, None).await.unwrap();

        assert!((result.position - 1375.0).abs() <= 5.0, "{}", result.position);
        assert_eq!(result.initial, None);
        assert_eq!(result.triple, [1250.0, 1325.0, 1425.0]);
        assert_eq!(probe.position, result.position);
    }

    #[tokio::test]
    async fn test_bisection_stops_on_contrast_limit() {
        let scanner = OplScanner::new(OplConfig {
            min_contrast: 0.05,
            min_span_um: 0.01,
            ..OplConfig::default()
        });
        let mut probe = PeakProbe::new(1000.0, 100.0, (0.0, 2000.0));
        let m = scanner.bisect_max(&mut probe, [800.0, 950.0, 1200.0]).await.unwrap();
        assert!((m - 1000.0).abs() < 60.0);
        // far fewer probes than a bisection down to 0.01 µm
        assert!(probe.visited.len() < 15);
    }

    #[tokio::test]
    async fn test_zero_step_is_rejected_before_scanning() {
        let scanner = OplScanner::new(OplConfig {
            step_um: 0.0,
            ..OplConfig::default()
        });
        let mut probe = PeakProbe::new(1000.0, 100.0, (0.0, 2000.0));
        let err = scanner.long_scan(&mut probe).await.unwrap_err();
        assert!(matches!(err, DhmError::Configuration(_)));
        assert!(probe.visited.is_empty());

        let scanner = OplScanner::new(OplConfig {
            step_um: f64::NAN,
            ..OplConfig::default()
        });
        let err = scanner.scan(&mut probe, Some(1000.0)).await.unwrap_err();
        assert!(matches!(err, DhmError::Configuration(_)));
        assert!(probe.visited.is_empty());
    }

    #[tokio::test]
    async fn test_bisection_rejects_non_peak_triple() {
        let scanner = OplScanner::default();
        let mut probe = PeakProbe::new(1000.0, 100.0, (0.0, 2000.0));
        let err = scanner.bisect_max(&mut probe, [1100.0, 1200.0, 1300.0]).await.unwrap_err();
        match err {
            DhmError::NoContrastPeak { positions, contrast } => {
                assert_eq!(positions, [1100.0, 1200.0, 1300.0]);
                assert!(contrast[0] > contrast[1]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_scan_falls_back_to_long_scan() {
        let scanner = scanner(ScanMode::Both, 0.2);
        let mut probe = PeakProbe::new(4000.0, 150.0, (0.0, 5000.0));
        let result = scanner.scan(&mut probe, Some(1000.0)).await.unwrap();
        assert_eq!(result.initial, Some(1000.0));
        assert!((result.position - 4000.0).abs() <= 5.0);
    }

    #[tokio::test]
    async fn test_short_scan_without_interference_fails() {
        let scanner = scanner(ScanMode::Short, 0.2);
        let mut probe = PeakProbe::new(4000.0, 150.0, (0.0, 5000.0));
        let err = scanner.scan(&mut probe, Some(1000.0)).await.unwrap_err();
        assert!(matches!(
            err,
            DhmError::InterferenceNotFound { mode: "Short", .. }
        ));
    }

    #[tokio::test]
    async fn test_peak_at_travel_limit_is_not_found() {
        let scanner = scanner(ScanMode::Long, 0.2);
        let mut probe = PeakProbe::new(0.0, 150.0, (0.0, 5000.0));
        let err = scanner.scan(&mut probe, None).await.unwrap_err();
        assert!(matches!(
            err,
            DhmError::InterferenceNotFound { mode: "Long", .. }
        ));
    }
}
