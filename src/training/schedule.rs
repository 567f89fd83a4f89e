//! Batch-size, learning-rate and noise-injection schedules
//!
//! Everything here is a pure function of the image counter or of the
//! discriminator history, so it can be recomputed every iteration.

use std::collections::BTreeMap;

use crate::error::{PgganError, Result};
use crate::utils::Options;

/// Largest level pre-filled in the batch-size table (1024x1024)
const TABLE_MAX_LEVEL: u32 = 10;

/// Batch size for a square resolution.
///
/// A fixed monotone step function: 32 up to 16x16, halving until 64x64,
/// then 8 at 128x128 halving down to 2 from 512x512 on.
pub fn batch_size_for(resolution: u32) -> usize {
    let r = resolution.trailing_zeros() as i32;
    let bs = if r < 7 {
        32.0 / 2f64.powi((r - 4).max(0))
    } else {
        8.0 / 2f64.powi((r - 7).min(2))
    };
    bs as usize
}

/// Cached batch size per resolution
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSizeTable {
    sizes: BTreeMap<u32, usize>,
}

impl BatchSizeTable {
    /// Build the table for 4x4 .. 1024x1024 and any level up to `max_level`
    pub fn new(max_level: u32) -> Self {
        let sizes = (2..=max_level.max(TABLE_MAX_LEVEL))
            .map(|level| {
                let resolution = 1u32 << level;
                (resolution, batch_size_for(resolution))
            })
            .collect();
        Self { sizes }
    }

    /// Batch size for `resolution`
    pub fn get(&self, resolution: u32) -> usize {
        self.sizes
            .get(&resolution)
            .copied()
            .unwrap_or_else(|| batch_size_for(resolution))
    }

    /// Iterate over (resolution, batch size) pairs in increasing resolution
    pub fn iter(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.sizes.iter().map(|(r, b)| (*r, *b))
    }
}

/// Exponential ramp-up: exp(-5) at 0, rising smoothly to 1 at `rampup_length`.
pub fn rampup(x: f64, rampup_length: f64) -> f64 {
    if x < rampup_length {
        let p = 1.0 - x.max(0.0) / rampup_length;
        (-p * p * 5.0).exp()
    } else {
        1.0
    }
}

/// Linear ramp-down over the last `rampdown_length` units before `total`.
pub fn rampdown_linear(x: f64, total: f64, rampdown_length: f64) -> f64 {
    if x >= total - rampdown_length {
        (total - x) / rampdown_length
    } else {
        1.0
    }
}

/// Learning rates for one iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRates {
    pub generator: f64,
    pub discriminator: f64,
    pub multiplier: f64,
}

/// Learning-rate and batch-size schedule of a run
#[derive(Debug, Clone)]
pub struct ScheduleController {
    g_lr_max: f64,
    d_lr_max: f64,
    total_kimg: f64,
    rampup_kimg: f64,
    rampdown_kimg: f64,
    batch_sizes: BatchSizeTable,
}

impl ScheduleController {
    pub fn new(options: &Options) -> Self {
        Self {
            g_lr_max: options.g_lr_max,
            d_lr_max: options.d_lr_max,
            total_kimg: options.total_kimg,
            rampup_kimg: options.rampup_kimg,
            rampdown_kimg: options.rampdown_kimg,
            batch_sizes: BatchSizeTable::new(options.target_level() + 1),
        }
    }

    pub fn batch_sizes(&self) -> &BatchSizeTable {
        &self.batch_sizes
    }

    /// Batch size used while training at `resolution`
    pub fn batch_size(&self, resolution: u32) -> usize {
        self.batch_sizes.get(resolution)
    }

    /// Combined ramp multiplier after `cur_nimg` images.
    ///
    /// Past the end of the schedule the multiplier is held at zero. A
    /// non-finite multiplier (zero-length ramp-down reached) is an error.
    pub fn lr_multiplier(&self, cur_nimg: u64) -> Result<f64> {
        let kimg = cur_nimg as f64 / 1000.0;
        let coef = rampup(kimg, self.rampup_kimg)
            * rampdown_linear(kimg, self.total_kimg, self.rampdown_kimg);
        if !coef.is_finite() {
            return Err(PgganError::Numeric(format!(
                "learning-rate multiplier is {} at {:.3} kimg (rampdown_kimg = {})",
                coef, kimg, self.rampdown_kimg
            )));
        }
        Ok(coef.max(0.0))
    }

    /// Generator and discriminator learning rates after `cur_nimg` images
    pub fn learning_rates(&self, cur_nimg: u64) -> Result<LearningRates> {
        let multiplier = self.lr_multiplier(cur_nimg)?;
        Ok(LearningRates {
            generator: self.g_lr_max * multiplier,
            discriminator: self.d_lr_max * multiplier,
            multiplier,
        })
    }
}

/// Strength of the additive noise for a given discriminator EMA
pub fn noise_strength(d_ema: f64) -> f64 {
    0.2 * (d_ema - 0.5).max(0.0).powi(2)
}

/// Adaptive noise injection on real images.
///
/// Tracks an EMA of the discriminator's mean output on real data. The
/// strength for the current iteration is derived from the real-score mean
/// observed in the previous one.
#[derive(Debug, Clone, Default)]
pub struct NoiseInjector {
    disabled: bool,
    d_ema: Option<f64>,
}

impl NoiseInjector {
    pub fn new(no_noise: bool) -> Self {
        Self {
            disabled: no_noise,
            d_ema: None,
        }
    }

    /// Current EMA, `None` until the first call to [`NoiseInjector::next_strength`]
    pub fn d_ema(&self) -> Option<f64> {
        self.d_ema
    }

    /// Continue from an EMA saved with a checkpoint
    pub fn restore(&mut self, d_ema: Option<f64>) {
        self.d_ema = d_ema;
    }

    /// Update the EMA with the last real-score mean and return the strength.
    pub fn next_strength(&mut self, last_real_mean: Option<f64>) -> f64 {
        if self.disabled {
            return 0.0;
        }

        let ema = match (self.d_ema, last_real_mean) {
            (None, _) => 0.0,
            (Some(ema), Some(mean)) => ema * 0.9 + mean.clamp(0.0, 1.0) * 0.1,
            (Some(ema), None) => ema,
        };
        self.d_ema = Some(ema);
        noise_strength(ema)
    }
}
