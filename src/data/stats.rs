//! Pixel statistics of hologram frames.

use crate::metadata::ImageParameters;
use ndarray::Array2;

/// Quantile used for the contrast estimate unless configured otherwise.
pub const DEFAULT_CONTRAST_QUANTILE: f64 = 0.05;

/// Pixel value statistics of a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStatistics {
    pub min: u16,
    pub max: u16,
    pub average: f64,
    pub quantile: f64,
    pub low_quantile: u16,
    pub median: u16,
    pub high_quantile: u16,
    /// Pixels at zero.
    pub underflow: usize,
    /// Pixels at or above the saturation value.
    pub overflow: usize,
    /// Spread between the low and high quantile relative to the saturation value.
    pub contrast: f64,
}

/// Nearest-rank quantile of sorted data, rounding half to even like numpy's
/// `method="nearest"`.
pub fn nearest_quantile(sorted: &[u16], q: f64) -> u16 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round_ties_even() as usize;
    sorted[index.min(sorted.len() - 1)]
}

impl ImageStatistics {
    /// Evaluates `frame` for a camera saturating at `saturation`.
    pub fn compute(frame: &Array2<u16>, saturation: u16, quantile: f64) -> Self {
        let mut sorted: Vec<u16> = frame.iter().copied().collect();
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: f64 = sorted.iter().map(|&v| f64::from(v)).sum();
        let low_quantile = nearest_quantile(&sorted, quantile);
        let high_quantile = nearest_quantile(&sorted, 1.0 - quantile);
        let contrast = if saturation > 0 {
            f64::from(high_quantile.saturating_sub(low_quantile)) / f64::from(saturation)
        } else {
            0.0
        };

        Self {
            min: sorted.first().copied().unwrap_or(0),
            max: sorted.last().copied().unwrap_or(0),
            average: if count > 0 { sum / count as f64 } else { 0.0 },
            quantile,
            low_quantile,
            median: nearest_quantile(&sorted, 0.5),
            high_quantile,
            underflow: sorted.iter().take_while(|&&v| v == 0).count(),
            overflow: sorted.iter().rev().take_while(|&&v| v >= saturation).count(),
            contrast,
        }
    }

    /// Image section of the parameter document.
    pub fn to_parameters(&self, opt_count: Option<usize>, max_overflow: usize) -> ImageParameters {
        ImageParameters {
            opt_count,
            max_overflow,
            min_value: self.min,
            max_value: self.max,
            average_value: self.average,
            contrast_quantile: self.quantile,
            low_quantile_value: self.low_quantile,
            median_value: self.median,
            high_quantile_value: self.high_quantile,
            underflow_pixel: self.underflow,
            overflow_pixel: self.overflow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_nearest_quantile_rounds_half_to_even() {
        let data = [10, 20, 30, 40, 50];
        assert_eq!(nearest_quantile(&data, 0.5), 30);
        // 0.125 * 4 = 0.5 rounds down to index 0
        assert_eq!(nearest_quantile(&data, 0.125), 10);
        // 0.375 * 4 = 1.5 rounds up to index 2
        assert_eq!(nearest_quantile(&data, 0.375), 30);
        assert_eq!(nearest_quantile(&[], 0.5), 0);
    }

    #[test]
    fn test_statistics_of_ramp() {
        let frame = Array2::from_shape_fn((10, 10), |(y, x)| ((y * 10 + x) * 255 / 99) as u16);
        let stats = ImageStatistics::compute(&frame, 255, DEFAULT_CONTRAST_QUANTILE);
        assert_eq!(stats.min, 0);
        assert_eq!(stats.max, 255);
        assert_eq!(stats.underflow, 1);
        assert_eq!(stats.overflow, 1);
        // indices 5 and 94 of the sorted ramp
        assert_eq!(stats.low_quantile, (5 * 255 / 99) as u16);
        assert_eq!(stats.high_quantile, (94 * 255 / 99) as u16);
        assert!((stats.contrast - f64::from(stats.high_quantile - stats.low_quantile) / 255.0).abs() < 1e-12);

        let params = stats.to_parameters(Some(7), 9);
        assert_eq!(params.opt_count, Some(7));
        assert_eq!(params.overflow_pixel, 1);
    }
}
