//! Per-iteration training metrics
//!
//! Every iteration is appended to a CSV file next to the run's checkpoints as
//! it is produced; only a bounded window of recent records stays in memory
//! for the divergence heuristics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;
use crate::training::sequencer::Phase;

/// One row of the metrics log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub level: u32,
    pub phase: Phase,
    pub iteration: u64,
    pub cur_level: f64,
    pub resolution: u32,
    pub cur_nimg: u64,
    pub g_loss: f64,
    pub d_loss: f64,
    pub d_real_mean: f64,
    pub noise_strength: f64,
    pub g_lr: f64,
    pub d_lr: f64,
}

/// Metrics collected during training
pub struct TrainingMetrics {
    recent: VecDeque<IterationRecord>,
    capacity: usize,
    total: u64,
    writer: Option<csv::Writer<File>>,
}

impl TrainingMetrics {
    /// In-memory metrics keeping the last `capacity` records
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            writer: None,
        }
    }

    /// Metrics that also append every record to the CSV file at `path`
    pub fn with_csv(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let has_headers = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(has_headers)
            .from_writer(file);
        Ok(Self {
            writer: Some(writer),
            ..Self::new(capacity)
        })
    }

    pub fn record(&mut self, record: IterationRecord) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.serialize(&record)?;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
        self.total += 1;
        Ok(())
    }

    /// Flush buffered rows to the CSV file
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }

    /// Records seen since creation, including those no longer in memory
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Most recent records, oldest first
    pub fn recent(&self) -> impl DoubleEndedIterator<Item = &IterationRecord> + '_ {
        self.recent.iter()
    }

    pub fn latest(&self) -> Option<&IterationRecord> {
        self.recent.back()
    }

    /// Moving average of generator loss
    pub fn g_loss_ma(&self, window: usize) -> f64 {
        moving_average(self.recent.iter().map(|r| r.g_loss), self.recent.len(), window)
    }

    /// Moving average of discriminator loss
    pub fn d_loss_ma(&self, window: usize) -> f64 {
        moving_average(self.recent.iter().map(|r| r.d_loss), self.recent.len(), window)
    }

    /// Check if training appears to have collapsed
    ///
    /// The discriminator separates real from fake almost perfectly while the
    /// generator loss keeps growing.
    pub fn check_mode_collapse(&self, window: usize) -> bool {
        if self.recent.len() < window {
            return false;
        }
        self.d_loss_ma(window) < 0.01 && self.g_loss_ma(window) > 0.9
    }

    /// Load a metrics CSV file
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<IterationRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader.deserialize().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

/// Moving average of the last `window` of `len` values
fn moving_average(values: impl DoubleEndedIterator<Item = f64>, len: usize, window: usize) -> f64 {
    let n = window.min(len);
    if n == 0 {
        return 0.0;
    }
    values.rev().take(n).sum::<f64>() / n as f64
}

/// Rolling statistics tracker
#[derive(Debug)]
pub struct RollingStats {
    window: VecDeque<f64>,
    max_size: usize,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    pub fn new(max_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(max_size),
            max_size: max_size.max(1),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.window.len() >= self.max_size {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }

        self.window.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn variance(&self) -> f64 {
        if self.window.len() < 2 {
            0.0
        } else {
            let n = self.window.len() as f64;
            let mean = self.sum / n;
            ((self.sum_sq / n) - (mean * mean)).max(0.0)
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Whether `value` lies more than `sigmas` deviations above the window mean
    pub fn is_spike(&self, value: f64, sigmas: f64) -> bool {
        self.len() >= self.max_size && self.std() > 0.0 && value > self.mean() + sigmas * self.std()
    }
}
