//! Separable image filters used for spectral peak detection.
//!
//! Both filters operate along rows and then along columns. Borders follow the
//! conventions of common image libraries:
//! - Gaussian blur mirrors without repeating the edge sample (`dcb|abcd|cba`)
//! - the maximum filter mirrors including the edge sample (`cba|abcd|dcb`)

use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis};

/// How samples outside the image are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    /// `dcb|abcd|cba`
    Reflect101,
    /// `cba|abcd|dcb`
    Reflect,
}

/// Maps a possibly out-of-range index into `0..n`.
pub fn border_index(i: isize, n: usize, mode: BorderMode) -> usize {
    if n <= 1 {
        return 0;
    }
    let n = n as isize;
    let m = match mode {
        BorderMode::Reflect101 => {
            let period = 2 * n - 2;
            let m = i.rem_euclid(period);
            if m >= n {
                period - m
            } else {
                m
            }
        }
        BorderMode::Reflect => {
            let period = 2 * n;
            let m = i.rem_euclid(period);
            if m >= n {
                period - 1 - m
            } else {
                m
            }
        }
    };
    m as usize
}

/// Normalized 1-D Gaussian kernel reaching out to four standard deviations.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let size = ((sigma * 8.0 + 1.0).round() as usize) | 1;
    let center = (size / 2) as f64;
    let mut kernel: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    if sum > 0.0 {
        kernel.iter_mut().for_each(|k| *k /= sum);
    }
    kernel
}

/// Gaussian blur with standard deviation `sigma` pixels.
pub fn gaussian_blur(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 {
        return image.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let convolve = |src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>| {
        let n = src.len();
        for (i, out) in dst.iter_mut().enumerate() {
            *out = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let j = border_index(i as isize + k as isize - radius, n, BorderMode::Reflect101);
                    w * src[j]
                })
                .sum();
        }
    };
    let rows = along_axis(image, Axis(1), convolve);
    along_axis(&rows, Axis(0), convolve)
}

/// Moving maximum over a `size x size` window.
///
/// For even sizes the window extends one sample further towards lower indices.
pub fn maximum_filter(image: &Array2<f64>, size: usize) -> Array2<f64> {
    if size <= 1 {
        return image.clone();
    }
    let lo = -((size / 2) as isize);
    let hi = (size - size / 2 - 1) as isize;
    let running_max = |src: ArrayView1<f64>, mut dst: ArrayViewMut1<f64>| {
        let n = src.len();
        for (i, out) in dst.iter_mut().enumerate() {
            *out = (lo..=hi)
                .map(|k| src[border_index(i as isize + k, n, BorderMode::Reflect)])
                .fold(f64::NEG_INFINITY, f64::max);
        }
    };
    let rows = along_axis(image, Axis(1), running_max);
    along_axis(&rows, Axis(0), running_max)
}

fn along_axis<F>(image: &Array2<f64>, axis: Axis, f: F) -> Array2<f64>
where
    F: Fn(ArrayView1<f64>, ArrayViewMut1<f64>),
{
    let mut out = Array2::<f64>::zeros(image.dim());
    for (src, dst) in image.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        f(src, dst);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_border_index_modes() {
        let n = 4;
        let r101: Vec<usize> = (-3..7).map(|i| border_index(i, n, BorderMode::Reflect101)).collect();
        assert_eq!(r101, vec![3, 2, 1, 0, 1, 2, 3, 2, 1, 0]);
        let r: Vec<usize> = (-3..7).map(|i| border_index(i, n, BorderMode::Reflect)).collect();
        assert_eq!(r, vec![2, 1, 0, 0, 1, 2, 3, 3, 2, 1]);
    }

    #[test]
    fn test_gaussian_kernel_shape() {
        let kernel = gaussian_kernel(4.0);
        assert_eq!(kernel.len(), 33);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(kernel[16] > kernel[15] && (kernel[15] - kernel[17]).abs() < 1e-15);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let image = Array2::from_elem((9, 5), 3.0);
        let blurred = gaussian_blur(&image, 2.0);
        for v in blurred.iter() {
            assert!((v - 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_maximum_filter_window() {
        let image = array![[0.0, 0.0, 0.0, 0.0], [0.0, 5.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]];
        let filtered = maximum_filter(&image, 2);
        // even window covers offsets [-1, 0]
        assert_eq!(filtered[[1, 1]], 5.0);
        assert_eq!(filtered[[2, 2]], 5.0);
        assert_eq!(filtered[[0, 0]], 0.0);
        assert_eq!(filtered[[0, 1]], 0.0);
        assert_eq!(filtered[[2, 3]], 1.0);
    }
}
