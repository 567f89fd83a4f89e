//! Network contracts consumed by the trainer
//!
//! The trainer never looks inside the networks. It needs:
//! - forward passes that accept a continuous level (fade-in blend),
//! - gradient reset, backward + optimizer step, learning-rate updates,
//! - parameter persistence and named parameter snapshots for summaries.
//!
//! With the `tch` feature the crate ships progressive reference networks
//! (`networks`) and their optimizer wrappers (`tch_backend`).

use std::path::Path;

use ndarray::Array4;

use crate::error::Result;
use crate::training::losses::{LossScalar, ScoreOps};

#[cfg(feature = "tch")]
pub mod networks;
#[cfg(feature = "tch")]
pub mod tch_backend;

#[cfg(feature = "tch")]
pub use networks::{NetworkConfig, ProgressiveDiscriminator, ProgressiveGenerator};
#[cfg(feature = "tch")]
pub use tch_backend::{TchDiscriminator, TchGenerator};

/// Values (and gradients, when present) of one named parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSnapshot {
    pub name: String,
    pub values: Vec<f32>,
    pub grad: Option<Vec<f32>>,
}

/// A network with its own optimizer
pub trait Trainable {
    /// Differentiable scalar loss consumed by [`Trainable::backward_step`]
    type Loss: LossScalar;

    /// Reset accumulated gradients
    fn zero_grad(&mut self);

    /// Backpropagate `loss` and apply one optimizer step
    fn backward_step(&mut self, loss: &Self::Loss) -> Result<()>;

    /// Set the optimizer learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Persist all parameters to `path`
    fn save(&self, path: &Path) -> Result<()>;

    /// Load all parameters from `path`
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Parameter values and gradients for histogram summaries
    fn parameters(&self) -> Result<Vec<ParameterSnapshot>>;
}

/// A batch of images flowing from generator to discriminator
pub trait ImageBatch: Sized {
    /// Copy cut off from the autograd graph
    fn detach(&self) -> Self;

    /// Host copy in NCHW layout
    fn to_array(&self) -> Result<Array4<f32>>;
}

/// Host arrays carry no graph
impl ImageBatch for Array4<f32> {
    fn detach(&self) -> Self {
        self.clone()
    }

    fn to_array(&self) -> Result<Array4<f32>> {
        Ok(self.clone())
    }
}

/// Progressive generator: latent batch and level to images
pub trait Generator: Trainable {
    type Latent;
    type Images: ImageBatch;

    fn forward(&self, latent: &Self::Latent, level: f64) -> Result<Self::Images>;
}

/// Progressive discriminator: images, level and input-noise strength to scores
pub trait Discriminator<Images>: Trainable {
    type Scores: ScoreOps<Loss = Self::Loss>;

    fn forward(&self, images: &Images, level: f64, noise_strength: f64) -> Result<Self::Scores>;
}
