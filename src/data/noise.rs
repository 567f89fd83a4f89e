//! Latent noise sampling

use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{StandardNormal, Uniform};

use super::NoiseSource;
use crate::error::Result;
use crate::utils::NoiseKind;

/// Draws `(batch, latent_size)` latent batches
#[derive(Debug, Clone)]
pub struct LatentSampler {
    latent_size: usize,
    kind: NoiseKind,
    rng: StdRng,
}

impl LatentSampler {
    pub fn new(latent_size: usize, kind: NoiseKind) -> Self {
        Self {
            latent_size,
            kind,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sampler
    pub fn with_seed(latent_size: usize, kind: NoiseKind, seed: u64) -> Self {
        Self {
            latent_size,
            kind,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    /// Draw one batch
    pub fn draw(&mut self, batch_size: usize) -> Array2<f32> {
        let shape = (batch_size, self.latent_size);
        match self.kind {
            NoiseKind::Gaussian => Array2::random_using(shape, StandardNormal, &mut self.rng),
            NoiseKind::Uniform => Array2::random_using(shape, Uniform::new(-1.0f32, 1.0), &mut self.rng),
        }
    }
}

impl NoiseSource for LatentSampler {
    type Latent = Array2<f32>;

    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        Ok(self.draw(batch_size))
    }
}
