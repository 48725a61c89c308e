//! Two-dimensional FFTs on `ndarray` images.
//!
//! The transforms follow the usual numerical conventions: the forward transform
//! is unnormalized with a negative exponent, the inverse carries the `1/N`
//! factor. [`rfft2`] returns the half spectrum of a real image, keeping only
//! the non-negative frequencies of the last axis, which is all the information
//! a real input has thanks to conjugate symmetry.

use ndarray::{Array2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Forward FFT of a real image. Shape `(h, w)` becomes `(h, w / 2 + 1)`.
pub fn rfft2(image: &Array2<f64>) -> Array2<Complex64> {
    let (h, w) = image.dim();
    let half = w / 2 + 1;
    let mut planner = FftPlanner::<f64>::new();

    let row_fft = planner.plan_fft_forward(w);
    let mut spectrum = Array2::<Complex64>::zeros((h, half));
    let mut buffer = vec![Complex64::new(0.0, 0.0); w];
    for (src, mut dst) in image.rows().into_iter().zip(spectrum.rows_mut()) {
        for (b, &v) in buffer.iter_mut().zip(src.iter()) {
            *b = Complex64::new(v, 0.0);
        }
        row_fft.process(&mut buffer);
        for (d, b) in dst.iter_mut().zip(buffer.iter()) {
            *d = *b;
        }
    }

    transform_columns(&mut spectrum, planner.plan_fft_forward(h));
    spectrum
}

/// Inverse FFT of a complex array, normalized by the number of elements.
pub fn ifft2(spectrum: &Array2<Complex64>) -> Array2<Complex64> {
    let (h, w) = spectrum.dim();
    let mut field = spectrum.clone();
    let mut planner = FftPlanner::<f64>::new();

    let row_fft = planner.plan_fft_inverse(w);
    let mut buffer = vec![Complex64::new(0.0, 0.0); w];
    for mut row in field.rows_mut() {
        for (b, v) in buffer.iter_mut().zip(row.iter()) {
            *b = *v;
        }
        row_fft.process(&mut buffer);
        for (v, b) in row.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }

    transform_columns(&mut field, planner.plan_fft_inverse(h));

    let scale = 1.0 / (h * w).max(1) as f64;
    field.mapv_inplace(|v| v * scale);
    field
}

fn transform_columns(data: &mut Array2<Complex64>, fft: Arc<dyn Fft<f64>>) {
    let mut buffer = vec![Complex64::new(0.0, 0.0); data.len_of(Axis(0))];
    for mut column in data.columns_mut() {
        for (b, v) in buffer.iter_mut().zip(column.iter()) {
            *b = *v;
        }
        fft.process(&mut buffer);
        for (v, b) in column.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_rfft2_of_constant_is_dc_only() {
        let image = Array2::from_elem((4, 6), 2.0);
        let spectrum = rfft2(&image);
        assert_eq!(spectrum.dim(), (4, 4));
        assert!((spectrum[[0, 0]].re - 48.0).abs() < 1e-9);
        let rest: f64 = spectrum.iter().skip(1).map(|c| c.norm()).sum();
        assert!(rest < 1e-9);
    }

    #[test]
    fn test_rfft2_locates_plane_wave() {
        let (h, w) = (16, 16);
        let image = Array2::from_shape_fn((h, w), |(y, x)| {
            (2.0 * PI * (3.0 * x as f64 / w as f64 + 5.0 * y as f64 / h as f64)).cos()
        });
        let spectrum = rfft2(&image);
        // cos splits into two conjugate peaks; only (x=3, y=5) lies in the half spectrum
        assert!((spectrum[[5, 3]].norm() - 128.0).abs() < 1e-9);
        assert!(spectrum[[11, 3]].norm() < 1e-9);
    }

    #[test]
    fn test_ifft2_inverts_full_forward_transform() {
        let data = Array2::from_shape_fn((4, 8), |(y, x)| {
            Complex64::new((x * 3 + y) as f64, (x as f64 - y as f64) * 0.5)
        });
        let mut planner = FftPlanner::<f64>::new();
        let mut forward = data.clone();
        let row = planner.plan_fft_forward(8);
        for mut r in forward.rows_mut() {
            let mut buf: Vec<Complex64> = r.iter().copied().collect();
            row.process(&mut buf);
            for (v, b) in r.iter_mut().zip(buf) {
                *v = b;
            }
        }
        transform_columns(&mut forward, planner.plan_fft_forward(4));

        let back = ifft2(&forward);
        for (a, b) in back.iter().zip(data.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }
}
