//! Training module for the progressive GAN
//!
//! This module provides:
//! - Batch-size table, learning-rate ramps and adaptive input noise
//! - Adversarial loss families
//! - The resolution/phase sequencer
//! - The training loop, metrics and summaries

pub mod losses;
pub mod metrics;
pub mod report;
pub mod schedule;
pub mod sequencer;
mod trainer;

pub use losses::{LossPolicy, LossTerms};
pub use metrics::{IterationRecord, TrainingMetrics};
pub use report::{JsonlReporter, MultiReporter, Reporter, TracingReporter};
pub use schedule::{BatchSizeTable, NoiseInjector, ScheduleController};
pub use sequencer::{IterationContext, Phase, ResumePoint, StageSequencer, TrainingState};
pub use trainer::{StepOutput, Trainer, TrainingSummary};
