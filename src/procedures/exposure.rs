//! Exposure optimization.
//!
//! Finds the longest shutter value at which a frame has at most
//! `max_overflow` saturated pixels. The search doubles or halves the shutter
//! until both a valid and an overexposed value are known, bisects between the
//! two and finally steps upwards one unit at a time until the budget is
//! exceeded.

use crate::config::ExposureConfig;
use crate::error::{DhmError, DhmResult};
use crate::instrument::capabilities::{saturation_value, HoloCamera};
use ndarray::Array2;
use tracing::{debug, info, instrument, trace};

/// Shutter values below this are raised before the search starts.
pub const MIN_START_SHUTTER: i32 = 10;

/// Best frame found by [`ExposureOptimizer::optimize`].
#[derive(Debug, Clone)]
pub struct OptimizedExposure {
    pub frame: Array2<u16>,
    /// Shutter value the camera was left at.
    pub shutter: i32,
    /// Number of frames grabbed during the search.
    pub frames: usize,
}

#[derive(Debug, Clone)]
pub struct ExposureOptimizer {
    pub max_overflow: usize,
    pub max_frames: usize,
    /// Report every probe at `info` level instead of `trace`.
    pub trace: bool,
}

impl Default for ExposureOptimizer {
    fn default() -> Self {
        Self::from(&ExposureConfig::default())
    }
}

impl From<&ExposureConfig> for ExposureOptimizer {
    fn from(config: &ExposureConfig) -> Self {
        Self {
            max_overflow: config.max_overflow,
            max_frames: config.max_frames,
            trace: config.trace,
        }
    }
}

struct Search {
    lower: Option<i32>,
    upper: Option<i32>,
    best: Option<Array2<u16>>,
    frames: usize,
}

impl Search {
    fn exhausted(&self) -> DhmError {
        DhmError::SearchExhausted {
            frames: self.frames,
            lower: self.lower,
            upper: self.upper,
        }
    }
}

impl ExposureOptimizer {
    pub fn new(max_overflow: usize) -> Self {
        Self {
            max_overflow,
            ..Self::default()
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Number of saturated pixels in `frame`.
    pub fn count_overflow(frame: &Array2<u16>, saturation: u16) -> usize {
        frame.iter().filter(|&&v| v >= saturation).count()
    }

    /// Runs the search and leaves the camera at the optimal shutter value.
    #[instrument(skip(self, camera), fields(max_overflow = self.max_overflow))]
    pub async fn optimize<C: HoloCamera + ?Sized>(&self, camera: &mut C) -> DhmResult<OptimizedExposure> {
        let saturation = saturation_value(camera.bit_depth().await?);
        let (min_shutter, max_shutter) = camera.shutter_range().await?;
        if min_shutter > max_shutter {
            return Err(DhmError::InvalidShutterRange {
                min: min_shutter,
                max: max_shutter,
            });
        }
        let mut shutter = camera
            .shutter()
            .await?
            .max(MIN_START_SHUTTER)
            .clamp(min_shutter, max_shutter);

        let mut search = Search {
            lower: None,
            upper: None,
            best: None,
            frames: 0,
        };

        // Bracketing and bisection
        loop {
            let (frame, over) = self.probe(camera, &mut search, shutter, saturation).await?;
            if over {
                search.upper = Some(shutter);
                shutter = match search.lower {
                    Some(lower) => (lower + shutter) >> 1,
                    None if shutter <= min_shutter => return Err(search.exhausted()),
                    None => min_shutter.max(shutter >> 1),
                };
            } else {
                search.lower = Some(shutter);
                search.best = Some(frame);
                shutter = match search.upper {
                    Some(upper) => (shutter + upper) >> 1,
                    None if shutter >= max_shutter => break,
                    None => max_shutter.min(shutter << 1),
                };
            }
            if let (Some(lower), Some(upper)) = (search.lower, search.upper) {
                if upper - lower <= 1 {
                    break;
                }
            }
        }

        // Fine adjustment
        let mut optimum = search.lower.ok_or_else(|| search.exhausted())?;
        while optimum < max_shutter {
            let (frame, over) = self.probe(camera, &mut search, optimum + 1, saturation).await?;
            if over {
                break;
            }
            optimum += 1;
            search.best = Some(frame);
        }

        camera.set_shutter(optimum).await?;
        let frame = search.best.take().ok_or_else(|| search.exhausted())?;
        debug!(shutter = optimum, frames = search.frames, "Exposure optimized");
        Ok(OptimizedExposure {
            frame,
            shutter: optimum,
            frames: search.frames,
        })
    }

    /// Grabs one frame at `shutter`; returns it and whether it exceeds the budget.
    async fn probe<C: HoloCamera + ?Sized>(
        &self,
        camera: &mut C,
        search: &mut Search,
        shutter: i32,
        saturation: u16,
    ) -> DhmResult<(Array2<u16>, bool)> {
        if search.frames >= self.max_frames {
            return Err(search.exhausted());
        }
        search.frames += 1;
        camera.set_shutter(shutter).await?;
        let frame = camera.grab_frame().await?;
        let overflow = Self::count_overflow(&frame, saturation);

        let (frames, lower, upper) = (search.frames, search.lower, search.upper);
        if self.trace {
            info!(frames, ?lower, shutter, overflow, ?upper, "Exposure probe");
        } else {
            trace!(frames, ?lower, shutter, overflow, ?upper, "Exposure probe");
        }
        Ok((frame, overflow > self.max_overflow))
    }
}
