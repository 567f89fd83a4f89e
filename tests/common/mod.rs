//! Host-side networks and sources that record every call

#![allow(dead_code)]

use ndarray::{Array1, Array2, Array4, Axis};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_pggan::data::{DataSource, ImageDataset, LatentSampler, NoiseSource};
use rust_pggan::model::{Discriminator, Generator, ParameterSnapshot, Trainable};
use rust_pggan::training::sequencer::cur_resolution;
use rust_pggan::training::{IterationRecord, Trainer, TrainingMetrics};
use rust_pggan::{NoiseKind, Options, Result};

pub type CallLog = Rc<RefCell<Vec<String>>>;

pub fn call_log() -> CallLog {
    Rc::new(RefCell::new(Vec::new()))
}

fn save_weights(weights: &[f32], path: &Path) -> Result<()> {
    std::fs::write(path, serde_json::to_string(weights)?)?;
    Ok(())
}

fn load_weights(path: &Path) -> Result<Vec<f32>> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

pub struct MockGenerator {
    pub weights: Vec<f32>,
    /// Emit a uniform batch
    pub flat: bool,
    lr: f64,
    grad: Option<Vec<f32>>,
    log: CallLog,
}

impl MockGenerator {
    pub fn new(log: &CallLog) -> Self {
        Self {
            weights: vec![0.5, -0.25, 0.125],
            flat: false,
            lr: 0.0,
            grad: None,
            log: Rc::clone(log),
        }
    }
}

impl Trainable for MockGenerator {
    type Loss = f64;

    fn zero_grad(&mut self) {
        self.log.borrow_mut().push("G.zero_grad".into());
        self.grad = None;
    }

    fn backward_step(&mut self, loss: &f64) -> Result<()> {
        self.log.borrow_mut().push("G.backward_step".into());
        self.grad = Some(vec![*loss as f32; self.weights.len()]);
        for w in &mut self.weights {
            *w -= (self.lr * loss) as f32;
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.log.borrow_mut().push("G.set_lr".into());
        self.lr = lr;
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_weights(&self.weights, path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.weights = load_weights(path)?;
        Ok(())
    }

    fn parameters(&self) -> Result<Vec<ParameterSnapshot>> {
        Ok(vec![ParameterSnapshot {
            name: "project.weight".into(),
            values: self.weights.clone(),
            grad: self.grad.clone(),
        }])
    }
}

impl Generator for MockGenerator {
    type Latent = Array2<f32>;
    type Images = Array4<f32>;

    fn forward(&self, latent: &Array2<f32>, level: f64) -> Result<Array4<f32>> {
        let side = cur_resolution(level) as usize;
        self.log.borrow_mut().push(format!("G.forward {}", side));

        let (n, k) = latent.dim();
        if self.flat {
            return Ok(Array4::from_elem((n, 3, side, side), 0.25));
        }
        let gain = self.weights[1].abs().max(0.1);
        Ok(Array4::from_shape_fn((n, 3, side, side), |(b, c, i, j)| {
            let pixel = (i * side + j) as f32 / (side * side) as f32;
            (latent[[b, c % k]] * self.weights[0] + pixel * gain).tanh()
        }))
    }
}

pub struct MockDiscriminator {
    pub weights: Vec<f32>,
    /// Return NaN scores
    pub poison: bool,
    lr: f64,
    grad: Option<Vec<f32>>,
    log: CallLog,
}

impl MockDiscriminator {
    pub fn new(log: &CallLog) -> Self {
        Self {
            weights: vec![1.5, 0.1],
            poison: false,
            lr: 0.0,
            grad: None,
            log: Rc::clone(log),
        }
    }
}

impl Trainable for MockDiscriminator {
    type Loss = f64;

    fn zero_grad(&mut self) {
        self.log.borrow_mut().push("D.zero_grad".into());
        self.grad = None;
    }

    fn backward_step(&mut self, loss: &f64) -> Result<()> {
        self.log.borrow_mut().push("D.backward_step".into());
        self.grad = Some(vec![*loss as f32; self.weights.len()]);
        for w in &mut self.weights {
            *w += (self.lr * loss) as f32;
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.log.borrow_mut().push("D.set_lr".into());
        self.lr = lr;
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_weights(&self.weights, path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.weights = load_weights(path)?;
        Ok(())
    }

    fn parameters(&self) -> Result<Vec<ParameterSnapshot>> {
        Ok(vec![ParameterSnapshot {
            name: "score.weight".into(),
            values: self.weights.clone(),
            grad: self.grad.clone(),
        }])
    }
}

impl Discriminator<Array4<f32>> for MockDiscriminator {
    type Scores = Array1<f64>;

    fn forward(&self, images: &Array4<f32>, _level: f64, noise_strength: f64) -> Result<Array1<f64>> {
        let side = images.len_of(Axis(2));
        self.log
            .borrow_mut()
            .push(format!("D.forward {} noise={}", side, noise_strength));

        if self.poison {
            return Ok(Array1::from_elem(images.len_of(Axis(0)), f64::NAN));
        }
        Ok(images
            .axis_iter(Axis(0))
            .map(|image| {
                let m = image.mean().unwrap_or(0.0) as f64;
                1.0 / (1.0 + (-(self.weights[0] as f64 * m + self.weights[1] as f64)).exp())
            })
            .collect())
    }
}

pub struct LoggedNoise {
    inner: LatentSampler,
    log: CallLog,
    count: usize,
    /// Raise the flag once this many batches have been drawn
    stop_after: Option<(Arc<AtomicBool>, usize)>,
}

impl LoggedNoise {
    pub fn new(latent_size: usize, log: &CallLog) -> Self {
        Self {
            inner: LatentSampler::with_seed(latent_size, NoiseKind::Gaussian, 3),
            log: Rc::clone(log),
            count: 0,
            stop_after: None,
        }
    }

    pub fn stop_after(mut self, flag: Arc<AtomicBool>, batches: usize) -> Self {
        self.stop_after = Some((flag, batches));
        self
    }
}

impl NoiseSource for LoggedNoise {
    type Latent = Array2<f32>;

    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        self.log.borrow_mut().push("noise.sample".into());
        self.count += 1;
        if let Some((flag, batches)) = &self.stop_after {
            if self.count >= *batches {
                flag.store(true, Ordering::SeqCst);
            }
        }
        self.inner.sample(batch_size)
    }
}

pub struct LoggedData {
    inner: ImageDataset,
    log: CallLog,
}

impl LoggedData {
    /// 16x16 RGB patterns
    pub fn new(log: &CallLog) -> Self {
        let data = Array4::from_shape_fn((20, 3, 16, 16), |(b, c, i, j)| {
            ((b as f32 * 0.7 + c as f32 + i as f32 * 0.3 - j as f32 * 0.2).sin()).clamp(-1.0, 1.0)
        });
        Self {
            inner: ImageDataset::with_seed(data, true, 7).unwrap(),
            log: Rc::clone(log),
        }
    }
}

impl DataSource for LoggedData {
    type Images = Array4<f32>;

    fn sample(&mut self, batch_size: usize, resolution: u32, level: f64) -> Result<Array4<f32>> {
        self.log.borrow_mut().push(format!("data.sample {}", resolution));
        self.inner.sample(batch_size, resolution, level)
    }
}

pub type MockTrainer = Trainer<MockGenerator, MockDiscriminator, LoggedNoise, LoggedData>;

/// 4x4 to 8x8 with one kimg per phase: 32 + 32 iterations per level
pub fn small_options(exp_dir: &Path) -> Options {
    Options {
        first_resol: 4,
        target_resol: 8,
        train_kimg: 1.0,
        transition_kimg: 1.0,
        latent_size: 8,
        sample_freq: 1000,
        save_freq: 1000,
        exp_dir: exp_dir.to_path_buf(),
        ..Options::default()
    }
}

pub fn trainer(options: Options, log: &CallLog) -> Result<MockTrainer> {
    let noise = LoggedNoise::new(options.latent_size, log);
    trainer_with_noise(options, log, noise)
}

pub fn trainer_with_noise(options: Options, log: &CallLog, noise: LoggedNoise) -> Result<MockTrainer> {
    let trainer = Trainer::new(
        options,
        MockGenerator::new(log),
        MockDiscriminator::new(log),
        noise,
        LoggedData::new(log),
    )?;
    Ok(trainer.with_progress(false))
}

/// Every record of the current session, read back from the metrics file
pub fn history(trainer: &MockTrainer) -> Vec<IterationRecord> {
    TrainingMetrics::load_csv(trainer.layout().metrics_path()).unwrap()
}
