//! Utility module
//!
//! This module provides:
//! - Run options and their file formats
//! - Run directories and checkpoint save/restore
//! - Sample grid images

mod config;
pub mod checkpoint;
pub mod grid;

pub use checkpoint::{CheckpointManager, CheckpointMeta, CheckpointTag, RunLayout};
pub use config::{GanKind, NoiseKind, Options};
