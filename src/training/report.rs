//! Scalar and histogram summaries
//!
//! Summaries are tagged `{resolution}/{phase}/{name}` and keyed by the
//! iteration index. Sinks are pluggable through [`Reporter`].

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Destination for training summaries
pub trait Reporter {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Summary statistics of a value distribution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    /// Bucket upper edges
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
}

impl HistogramSummary {
    pub const BINS: usize = 10;

    /// Summarize `values`; `None` when empty
    pub fn from_values(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v as f64), hi.max(v as f64)));
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        let width = (max - min) / Self::BINS as f64;
        let edges: Vec<f64> = (1..=Self::BINS).map(|i| min + width * i as f64).collect();
        let mut counts = vec![0u64; Self::BINS];
        for &v in values {
            let idx = if width > 0.0 {
                (((v as f64 - min) / width) as usize).min(Self::BINS - 1)
            } else {
                Self::BINS - 1
            };
            counts[idx] += 1;
        }

        Some(Self {
            count: values.len(),
            min,
            max,
            mean,
            std: var.sqrt(),
            edges,
            counts,
        })
    }
}

/// Logs scalars at debug level and drops histograms
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        tracing::debug!(tag, value, step, "scalar");
        Ok(())
    }

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<()> {
        tracing::trace!(tag, count = values.len(), step, "histogram");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event<'a> {
    Scalar {
        tag: &'a str,
        step: u64,
        value: f64,
    },
    Histogram {
        tag: &'a str,
        step: u64,
        #[serde(flatten)]
        summary: HistogramSummary,
    },
}

/// Appends one JSON object per summary to an events file
pub struct JsonlReporter {
    writer: BufWriter<File>,
}

impl JsonlReporter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, event: &Event<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl Reporter for JsonlReporter {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.write(&Event::Scalar { tag, step, value })
    }

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<()> {
        match HistogramSummary::from_values(values) {
            Some(summary) => self.write(&Event::Histogram { tag, step, summary }),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Fans every summary out to several sinks
#[derive(Default)]
pub struct MultiReporter {
    sinks: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Reporter + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Reporter for MultiReporter {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.scalar(tag, value, step))
    }

    fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.histogram(tag, values, step))
    }

    fn flush(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.flush())
    }
}

/// Summary tag prefix `{resolution}/{phase}/`
pub fn tag_prefix(resolution: u32, phase: impl std::fmt::Display) -> String {
    format!("{}/{}/", resolution, phase)
}

/// Histogram tag for a named parameter: dots become slashes
pub fn parameter_tag(network: &str, prefix: &str, name: &str) -> String {
    format!("{}/{}{}", network, prefix, name.replace('.', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_histogram_summary() {
        let values: Vec<f32> = (0..100).map(|v| v as f32).collect();
        let summary = HistogramSummary::from_values(&values).unwrap();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.max, 99.0);
        assert!((summary.mean - 49.5).abs() < 1e-9);
        assert_eq!(summary.counts.iter().sum::<u64>(), 100);
        assert_eq!(summary.counts[0], 10);

        assert!(HistogramSummary::from_values(&[]).is_none());
        let flat = HistogramSummary::from_values(&[2.0, 2.0]).unwrap();
        assert_eq!(flat.counts[HistogramSummary::BINS - 1], 2);
    }

    #[test]
    fn test_tags() {
        let prefix = tag_prefix(8, "fade_in");
        assert_eq!(prefix, "8/fade_in/");
        assert_eq!(parameter_tag("G", &prefix, "blocks.0.weight"), "G/8/fade_in/blocks/0/weight");
    }

    #[test]
    fn test_jsonl_reporter() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let mut reporter = MultiReporter::new()
            .with(TracingReporter)
            .with(JsonlReporter::create(&path).unwrap());

        reporter.scalar("4/stabilize/G_loss", 0.5, 3).unwrap();
        reporter.histogram("G/4/stabilize/w", &[1.0, 2.0, 3.0], 3).unwrap();
        reporter.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "scalar");
        assert_eq!(lines[0]["value"], 0.5);
        assert_eq!(lines[1]["kind"], "histogram");
        assert_eq!(lines[1]["count"], 3);
    }
}
