//! Off-axis hologram reconstruction.
//!
//! A hologram is the interference pattern of an object wave with a tilted
//! reference wave. Its Fourier spectrum contains a zero order around the origin
//! and two mirrored first diffraction orders around the carrier frequency.
//! Reconstruction works on the half spectrum of the real frame:
//!
//! 1. [`locate_order`] finds the first order as the strongest local maximum of the
//!    blurred spectrum away from the zero frequency and Nyquist axes.
//! 2. [`extract_field`] cuts a circular region around that order out of its
//!    spectral quadrant, moves it to the origin and transforms it back into a
//!    complex wave field with half the frame resolution.
//! 3. [`fit_phase`] unwraps the phase of the field and fits a polynomial surface.
//!
//! [`reference_fit`] runs all three steps on a reference hologram.

use crate::data::fft::{ifft2, rfft2};
use crate::data::filters::{gaussian_blur, maximum_filter};
use crate::data::unwrap::unwrap_phase;
use crate::error::{DhmError, DhmResult};
use crate::metadata::AcquisitionMetadata;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Location of the first diffraction order relative to the zero order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralOrder {
    pub x: i64,
    /// Negative values address the mirrored (upper) quadrant.
    pub y: i64,
    /// Largest circular mask radius that fits into the quadrant of the order.
    pub radius: f64,
    /// Peak height of the blurred spectrum relative to the zero order, in `[0, 1]`.
    pub weight: f64,
}

impl SpectralOrder {
    /// Spectral distance between the zero and the first order.
    pub fn distance(&self) -> f64 {
        (self.x as f64).hypot(self.y as f64)
    }
}

/// Checks that `frame` can be reconstructed.
pub fn validate_frame(frame: &Array2<f64>) -> DhmResult<()> {
    let (h, w) = frame.dim();
    if h == 0 || w == 0 {
        return Err(DhmError::InvalidFrame("empty frame".to_string()));
    }
    if h % 2 != 0 || w % 2 != 0 {
        return Err(DhmError::InvalidFrame(format!(
            "frame dimensions {h}x{w} must be even"
        )));
    }
    if frame.iter().any(|v| !v.is_finite()) {
        return Err(DhmError::InvalidFrame("non-finite pixel value".to_string()));
    }
    if frame.iter().any(|&v| v < 0.0) {
        return Err(DhmError::InvalidFrame("negative pixel value".to_string()));
    }
    Ok(())
}

/// Converts a camera frame to floating point.
pub fn to_f64(frame: &Array2<u16>) -> Array2<f64> {
    frame.mapv(f64::from)
}

/// Maximum mask radius around `(x, y)` inside a quadrant of a half spectrum of
/// shape `(height, half_width)`.
pub fn max_radius(shape: (usize, usize), x: i64, y: i64) -> f64 {
    let qh = (shape.0 / 2) as i64;
    let qw = shape.1 as i64 - 1;
    let y = if y < 0 { y + qh } else { y };
    x.min(qw - x).min(y).min(qh - y) as f64
}

/// Finds the first diffraction order of a hologram.
///
/// `blur` is the standard deviation of the Gaussian applied to the magnitude
/// spectrum and the window size of the local maximum search. It limits how
/// close two maxima can be and sets the margin around the zero frequency and
/// Nyquist axes in which maxima are ignored.
pub fn locate_order(frame: &Array2<f64>, blur: usize) -> DhmResult<SpectralOrder> {
    validate_frame(frame)?;
    let spectrum = rfft2(frame).mapv(|c| c.norm());
    let (h, w) = spectrum.dim();

    let mut blurred = gaussian_blur(&spectrum, blur as f64);
    let dc = blurred[[0, 0]];
    if dc <= 0.0 {
        return Err(DhmError::NoDetectableOrder);
    }
    blurred.mapv_inplace(|v| v / dc);
    let peaks = maximum_filter(&blurred, blur);

    let sx = ((w - 1) / 2) as i64;
    let sy = (h / 4) as i64;
    let margin = (blur / 2) as i64;
    if sx == 0 || sy == 0 {
        return Err(DhmError::NoDetectableOrder);
    }
    let inside = |v: i64, s: i64| (v.rem_euclid(2 * s) - s).abs() < s - margin;

    let best = blurred
        .indexed_iter()
        .filter(|&((y, x), v)| peaks[[y, x]] == *v)
        .filter(|&((y, x), _)| inside(x as i64, sx) && inside(y as i64, sy))
        .fold(None, |best: Option<((usize, usize), f64)>, (idx, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((idx, v)),
        });

    let ((y, x), weight) = best.ok_or(DhmError::NoDetectableOrder)?;
    let x = x as i64;
    let mut y = y as i64;
    if y >= (h / 2) as i64 {
        y -= h as i64;
    }
    let order = SpectralOrder {
        x,
        y,
        radius: max_radius((h, w), x, y),
        weight,
    };
    debug!(x, y, radius = order.radius, weight, "Located first diffraction order");
    Ok(order)
}

/// Rolls `image` so that `(x, y)` moves to the origin, wrapping at the edges.
pub fn roll<T: Clone>(image: &Array2<T>, x: i64, y: i64) -> Array2<T> {
    let (h, w) = image.dim();
    if h == 0 || w == 0 {
        return image.clone();
    }
    let dx = x.rem_euclid(w as i64) as usize;
    let dy = y.rem_euclid(h as i64) as usize;
    Array2::from_shape_fn((h, w), |(i, j)| image[[(i + dy) % h, (j + dx) % w]].clone())
}

/// Demodulates the wave field of the diffraction order at `(x, y)`.
///
/// With `radius` left out the largest mask fitting into the quadrant is used.
/// A radius reaching the zero order is rejected. A radius leaving the quadrant
/// is accepted with a warning. The field has half the frame resolution.
pub fn extract_field(
    frame: &Array2<f64>,
    x: i64,
    y: i64,
    radius: Option<f64>,
) -> DhmResult<Array2<Complex64>> {
    validate_frame(frame)?;
    let spectrum = rfft2(frame);
    let (h, w) = spectrum.dim();
    let (qh, qw) = (h / 2, w - 1);

    let distance = (x as f64).hypot(y as f64);
    let rmax = max_radius((h, w), x, y);
    let radius = match radius {
        None => rmax,
        Some(r) if r >= distance => {
            return Err(DhmError::RadiusIncludesZeroOrder { radius: r, distance });
        }
        Some(r) => {
            if r > rmax {
                warn!(radius = r, max_radius = rmax, "Spectral radius exceeds the quadrant");
            }
            r
        }
    };

    let (rows, qy) = if y < 0 {
        (qh..h, y + qh as i64)
    } else {
        (0..qh, y)
    };
    let quadrant = spectrum.slice(ndarray::s![rows, ..qw]).to_owned();
    let mut shifted = roll(&quadrant, x, qy);

    let centered = |i: usize, n: usize, offset: i64| -> f64 {
        let i = i as i64;
        let n = n as i64;
        if i < n - offset {
            i as f64
        } else {
            (i - n) as f64
        }
    };
    let zero = Complex64::new(0.0, 0.0);
    for ((i, j), v) in shifted.indexed_iter_mut() {
        let dy = centered(i, qh, qy);
        let dx = centered(j, qw, x);
        if dx * dx + dy * dy > radius * radius {
            *v = zero;
        }
    }
    Ok(ifft2(&shifted))
}

/// Complete set of polynomial terms `X^(n-i) * Y^i` up to a maximum order.
///
/// Coordinates are pixel indices relative to the image center. Term names list
/// one letter per factor: `""`, `"x"`, `"y"`, `"xx"`, `"xy"`, `"yy"`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialBasis {
    shape: (usize, usize),
    order: usize,
    exponents: Vec<(u32, u32)>,
    names: Vec<String>,
}

impl PolynomialBasis {
    pub fn new(shape: (usize, usize), order: usize) -> Self {
        let mut exponents = Vec::new();
        let mut names = Vec::new();
        for n in 0..=order as u32 {
            for i in 0..=n {
                exponents.push((n - i, i));
                names.push(format!(
                    "{}{}",
                    "x".repeat((n - i) as usize),
                    "y".repeat(i as usize)
                ));
            }
        }
        Self {
            shape,
            order,
            exponents,
            names,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    /// Centered coordinates of pixel `(row, col)`.
    fn coordinates(&self, row: usize, col: usize) -> (f64, f64) {
        let cx = 0.5 * self.shape.1.saturating_sub(1) as f64;
        let cy = 0.5 * self.shape.0.saturating_sub(1) as f64;
        (col as f64 - cx, row as f64 - cy)
    }

    fn term(&self, k: usize, x: f64, y: f64) -> f64 {
        let (px, py) = self.exponents[k];
        x.powi(px as i32) * y.powi(py as i32)
    }

    /// Values of term `k` over the whole image.
    pub fn terms(&self, k: usize) -> Array2<f64> {
        Array2::from_shape_fn(self.shape, |(row, col)| {
            let (x, y) = self.coordinates(row, col);
            self.term(k, x, y)
        })
    }

    /// Surface described by `coefficients`, one per term.
    pub fn evaluate(&self, coefficients: &[f64]) -> Array2<f64> {
        Array2::from_shape_fn(self.shape, |(row, col)| {
            let (x, y) = self.coordinates(row, col);
            coefficients
                .iter()
                .enumerate()
                .take(self.len())
                .map(|(k, c)| c * self.term(k, x, y))
                .sum()
        })
    }
}

/// Unwraps `phase` and fits `basis` to it in the least-squares sense.
pub fn fit_phase(phase: &Array2<f64>, basis: &PolynomialBasis) -> DhmResult<Vec<f64>> {
    if phase.dim() != basis.shape() {
        return Err(DhmError::InvalidFrame(format!(
            "phase shape {:?} does not match basis shape {:?}",
            phase.dim(),
            basis.shape()
        )));
    }
    let unwrapped = unwrap_phase(phase);
    let (h, w) = phase.dim();

    let a = DMatrix::<f64>::from_fn(h * w, basis.len(), |r, k| {
        let (x, y) = basis.coordinates(r / w, r % w);
        basis.term(k, x, y)
    });
    let b = DVector::<f64>::from_iterator(h * w, unwrapped.iter().copied());
    let solution = a
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|e| DhmError::InvalidFrame(format!("phase fit failed: {e}")))?;
    Ok(solution.iter().copied().collect())
}

/// Result of evaluating a reference hologram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFit {
    pub blur: usize,
    pub order: usize,
    pub spectral_order: SpectralOrder,
    pub coefficients: Vec<f64>,
    pub basis: PolynomialBasis,
    pub metadata: Option<AcquisitionMetadata>,
}

impl ReferenceFit {
    /// Coefficient of the term with the given name.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.basis
            .names()
            .iter()
            .position(|n| n == name)
            .and_then(|k| self.coefficients.get(k).copied())
    }

    /// Fitted phase surface.
    pub fn surface(&self) -> Array2<f64> {
        self.basis.evaluate(&self.coefficients)
    }
}

/// Locates the first order, extracts its field and fits the phase surface.
pub fn reference_fit(frame: &Array2<f64>, blur: usize, order: usize) -> DhmResult<ReferenceFit> {
    let spectral_order = locate_order(frame, blur)?;
    let field = extract_field(frame, spectral_order.x, spectral_order.y, None)?;
    let phase = field.mapv(|c| c.arg());
    let basis = PolynomialBasis::new(phase.dim(), order);
    let coefficients = fit_phase(&phase, &basis)?;
    debug!(?coefficients, names = ?basis.names(), "Fitted reference phase");
    Ok(ReferenceFit {
        blur,
        order,
        spectral_order,
        coefficients,
        basis,
        metadata: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::unwrap::wrap;
    use std::f64::consts::PI;
    use tracing_test::traced_test;

    fn hologram(n: usize, carrier: (f64, f64), ramp: (f64, f64)) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(y, x)| {
            let (x, y) = (x as f64, y as f64);
            let carrier_phase = 2.0 * PI * (carrier.0 * x + carrier.1 * y) / n as f64;
            128.0 + 100.0 * (carrier_phase + ramp.0 * x + ramp.1 * y).cos()
        })
    }

    #[test]
    fn test_locate_order_finds_carrier() {
        let frame = hologram(128, (32.0, 32.0), (0.0, 0.0));
        let order = locate_order(&frame, 4).unwrap();
        assert_eq!((order.x, order.y), (32, 32));
        assert_eq!(order.radius, 32.0);
        assert!((order.weight - 0.390625).abs() < 0.01);
    }

    #[test]
    fn test_locate_order_folds_upper_quadrant() {
        let frame = hologram(128, (32.0, -32.0), (0.0, 0.0));
        let order = locate_order(&frame, 4).unwrap();
        assert_eq!((order.x, order.y), (32, -32));
        assert_eq!(order.radius, 32.0);
    }

    #[test]
    fn test_reference_fit_recovers_phase_ramp() {
        let (a, b) = (0.002, -0.0015);
        let frame = hologram(128, (32.0, 32.0), (a, b));
        let fit = reference_fit(&frame, 4, 1).unwrap();
        assert_eq!(fit.basis.names(), &["", "x", "y"]);
        assert_eq!(fit.basis.shape(), (64, 64));
        // the field is sampled on every second pixel
        let x = fit.coefficient("x").unwrap();
        let y = fit.coefficient("y").unwrap();
        assert!((x - 2.0 * a).abs() < 1e-3, "x slope {x}");
        assert!((y - 2.0 * b).abs() < 1e-3, "y slope {y}");
    }

    #[test]
    fn test_fit_phase_quadratic_surface() {
        let basis = PolynomialBasis::new((32, 40), 2);
        assert_eq!(basis.names(), &["", "x", "y", "xx", "xy", "yy"]);
        let truth = [0.5, 0.1, -0.05, 0.002, 0.001, -0.003];
        let phase = basis.evaluate(&truth).mapv(wrap);

        let fit = fit_phase(&phase, &basis).unwrap();
        // the constant term is only defined modulo 2π
        assert!(wrap(fit[0] - truth[0]).abs() < 1e-9);
        for (c, t) in fit.iter().zip(truth.iter()).skip(1) {
            assert!((c - t).abs() < 1e-9, "{c} != {t}");
        }
    }

    #[test]
    fn test_odd_frame_is_invalid() {
        let frame = Array2::from_elem((63, 64), 1.0);
        assert!(matches!(
            locate_order(&frame, 4),
            Err(DhmError::InvalidFrame(_))
        ));
        let mut negative = Array2::from_elem((64, 64), 1.0);
        negative[[3, 3]] = -1.0;
        assert!(matches!(
            extract_field(&negative, 16, 16, None),
            Err(DhmError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_no_order_outside_margins() {
        // an 8x8 frame leaves no room between the margins of a blur of 4
        let frame = hologram(8, (2.0, 2.0), (0.0, 0.0));
        assert!(matches!(
            locate_order(&frame, 4),
            Err(DhmError::NoDetectableOrder)
        ));
        let dark = Array2::zeros((64, 64));
        assert!(matches!(
            locate_order(&dark, 4),
            Err(DhmError::NoDetectableOrder)
        ));
    }

    #[test]
    #[traced_test]
    fn test_radius_reaching_zero_order_is_rejected() {
        let frame = hologram(64, (16.0, 16.0), (0.0, 0.0));
        let err = extract_field(&frame, 16, 16, Some(23.0)).unwrap_err();
        assert!(matches!(err, DhmError::RadiusIncludesZeroOrder { .. }));
        // larger than the quadrant allows but short of the zero order
        let field = extract_field(&frame, 16, 16, Some(20.0)).unwrap();
        assert_eq!(field.dim(), (32, 32));
        assert!(logs_contain("Spectral radius exceeds the quadrant"));
    }

    #[test]
    fn test_roll_moves_point_to_origin() {
        let image = Array2::from_shape_fn((3, 4), |(y, x)| y * 4 + x);
        let rolled = roll(&image, 1, 2);
        assert_eq!(rolled[[0, 0]], image[[2, 1]]);
        assert_eq!(rolled[[1, 3]], image[[0, 0]]);
    }

    #[test]
    fn test_max_radius_per_quadrant() {
        assert_eq!(max_radius((128, 65), 10, 20), 10.0);
        assert_eq!(max_radius((128, 65), 40, -10), 10.0);
        assert_eq!(max_radius((128, 65), 30, -40), 24.0);
    }
}
