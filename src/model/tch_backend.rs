//! libtorch-backed networks with their Adam optimizers

use ndarray::Array4;
use std::path::Path;
use tch::{nn, nn::OptimizerConfig, nn::VarStore, Device, Kind, Tensor};

use super::networks::{NetworkConfig, ProgressiveDiscriminator, ProgressiveGenerator};
use super::{Discriminator, Generator, ImageBatch, ParameterSnapshot, Trainable};
use crate::error::{PgganError, Result};
use crate::training::losses::{LossScalar, ScoreOps};
use crate::utils::Options;

/// Parse "cpu", "cuda" or "cuda:N"
pub fn parse_device(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Ok(Device::cuda_if_available()),
        other => other
            .strip_prefix("cuda:")
            .and_then(|idx| idx.parse().ok())
            .map(Device::Cuda)
            .ok_or_else(|| PgganError::Config(format!("unknown device '{}'", other))),
    }
}

fn adam(vs: &VarStore, options: &Options, lr: f64) -> Result<nn::Optimizer> {
    let optimizer = nn::Adam {
        beta1: options.beta1,
        beta2: options.beta2,
        wd: 0.0,
        ..Default::default()
    }
    .build(vs, lr)?;
    Ok(optimizer)
}

fn snapshot(vs: &VarStore) -> Result<Vec<ParameterSnapshot>> {
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    variables
        .into_iter()
        .map(|(name, value)| {
            let grad = value.grad();
            let grad = if grad.defined() { Some(to_vec(&grad)?) } else { None };
            Ok(ParameterSnapshot {
                name,
                values: to_vec(&value)?,
                grad,
            })
        })
        .collect()
}

fn to_vec(t: &Tensor) -> Result<Vec<f32>> {
    let flat = t.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous().view([-1]);
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// Generator parameters and optimizer
pub struct TchGenerator {
    vs: VarStore,
    net: ProgressiveGenerator,
    optimizer: nn::Optimizer,
}

impl TchGenerator {
    pub fn new(config: NetworkConfig, options: &Options, device: Device) -> Result<Self> {
        let vs = VarStore::new(device);
        let net = ProgressiveGenerator::new(&vs.root(), config);
        let optimizer = adam(&vs, options, options.g_lr_max)?;
        Ok(Self { vs, net, optimizer })
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn net(&self) -> &ProgressiveGenerator {
        &self.net
    }
}

/// Discriminator parameters and optimizer
pub struct TchDiscriminator {
    vs: VarStore,
    net: ProgressiveDiscriminator,
    optimizer: nn::Optimizer,
}

impl TchDiscriminator {
    pub fn new(config: NetworkConfig, options: &Options, device: Device) -> Result<Self> {
        let vs = VarStore::new(device);
        let net = ProgressiveDiscriminator::new(&vs.root(), config);
        let optimizer = adam(&vs, options, options.d_lr_max)?;
        Ok(Self { vs, net, optimizer })
    }

    pub fn net(&self) -> &ProgressiveDiscriminator {
        &self.net
    }
}

macro_rules! impl_trainable {
    ($ty:ty) => {
        impl Trainable for $ty {
            type Loss = Tensor;

            fn zero_grad(&mut self) {
                self.optimizer.zero_grad();
            }

            fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
                loss.f_backward()?;
                self.optimizer.step();
                Ok(())
            }

            fn set_learning_rate(&mut self, lr: f64) {
                self.optimizer.set_lr(lr);
            }

            fn save(&self, path: &Path) -> Result<()> {
                self.vs.save(path)?;
                Ok(())
            }

            fn load(&mut self, path: &Path) -> Result<()> {
                self.vs.load(path)?;
                Ok(())
            }

            fn parameters(&self) -> Result<Vec<ParameterSnapshot>> {
                snapshot(&self.vs)
            }
        }
    };
}

impl_trainable!(TchGenerator);
impl_trainable!(TchDiscriminator);

impl Generator for TchGenerator {
    type Latent = Tensor;
    type Images = Tensor;

    fn forward(&self, latent: &Tensor, level: f64) -> Result<Tensor> {
        Ok(self.net.forward(latent, level))
    }
}

impl Discriminator<Tensor> for TchDiscriminator {
    type Scores = Tensor;

    fn forward(&self, images: &Tensor, level: f64, noise_strength: f64) -> Result<Tensor> {
        Ok(self.net.forward(images, level, noise_strength))
    }
}

impl LossScalar for Tensor {
    fn value(&self) -> f64 {
        self.double_value(&[])
    }
}

impl ScoreOps for Tensor {
    type Loss = Tensor;

    fn mean_score(&self) -> Tensor {
        self.mean(Kind::Float)
    }

    fn mean_squared_error(&self, target: f64) -> Tensor {
        (self - target).square().mean(Kind::Float)
    }

    fn mean_log(&self, eps: f64) -> Tensor {
        (self + eps).log().mean(Kind::Float)
    }

    fn mean_log_complement(&self, eps: f64) -> Tensor {
        (self.neg() + (1.0 + eps)).log().mean(Kind::Float)
    }
}

impl ImageBatch for Tensor {
    fn detach(&self) -> Tensor {
        Tensor::detach(self)
    }

    fn to_array(&self) -> Result<Array4<f32>> {
        let size = self.size();
        let &[n, c, h, w] = size.as_slice() else {
            return Err(PgganError::Shape(format!("expected an NCHW batch, got {:?}", size)));
        };
        let values = to_vec(self)?;
        Ok(Array4::from_shape_vec((n as usize, c as usize, h as usize, w as usize), values)?)
    }
}
