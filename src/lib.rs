//! # Progressive-growing GAN training
//!
//! This crate trains a generator/discriminator pair on a staged resolution
//! curriculum: every resolution level is first stabilized and then faded
//! into the next one, with per-resolution batch sizes, ramped learning
//! rates, adaptive input noise and resumable checkpoints.
//!
//! ## Modules
//!
//! - `data`: latent noise and real-image batches
//! - `model`: network contracts (and libtorch networks with feature `tch`)
//! - `training`: schedules, losses, stage sequencer and the training loop
//! - `utils`: options, checkpoints and sample grids

pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

pub use data::{DataSource, ImageDataset, LatentSampler, NoiseSource};
pub use error::{PgganError, Result};
pub use model::{Discriminator, Generator, ImageBatch, ParameterSnapshot, Trainable};
pub use training::{LossPolicy, Phase, ScheduleController, StageSequencer, Trainer, TrainingSummary};
pub use utils::{CheckpointManager, CheckpointTag, GanKind, NoiseKind, Options, RunLayout};
