//! Data module: latent noise and real-image batches
//!
//! This module provides:
//! - `NoiseSource` / `DataSource` contracts consumed by the trainer
//! - Gaussian/uniform latent sampling over ndarray
//! - An in-memory image dataset serving batches at any trained resolution
//! - Tensor adapters for both (feature `tch`)

mod dataset;
mod noise;
#[cfg(feature = "tch")]
mod tch_sources;

pub use dataset::{avg_pool, fade_blend, load_image_folder, upsample_nearest, ImageDataset};
pub use noise::LatentSampler;
#[cfg(feature = "tch")]
pub use tch_sources::{load_tensor_dataset, TchData, TchNoise};

use crate::error::Result;

/// Produces latent batches on demand
pub trait NoiseSource {
    type Latent;

    fn sample(&mut self, batch_size: usize) -> Result<Self::Latent>;
}

/// Produces real-image batches at a requested resolution and level
pub trait DataSource {
    type Images;

    fn sample(&mut self, batch_size: usize, resolution: u32, level: f64) -> Result<Self::Images>;
}
