//! Tensor-valued noise and data sources

use ndarray::Array4;
use std::path::Path;
use tch::{Device, Kind, Tensor};

use super::{DataSource, ImageDataset, NoiseSource};
use crate::error::{PgganError, Result};
use crate::utils::NoiseKind;

/// Latents drawn directly on the training device
pub struct TchNoise {
    latent_size: i64,
    kind: NoiseKind,
    device: Device,
}

impl TchNoise {
    pub fn new(latent_size: usize, kind: NoiseKind, device: Device) -> Self {
        Self {
            latent_size: latent_size as i64,
            kind,
            device,
        }
    }
}

impl NoiseSource for TchNoise {
    type Latent = Tensor;

    fn sample(&mut self, batch_size: usize) -> Result<Tensor> {
        let shape = [batch_size as i64, self.latent_size];
        let options = (Kind::Float, self.device);
        Ok(match self.kind {
            NoiseKind::Gaussian => Tensor::randn(shape, options),
            NoiseKind::Uniform => Tensor::rand(shape, options) * 2.0 - 1.0,
        })
    }
}

/// Dataset batches moved to the training device
pub struct TchData {
    dataset: ImageDataset,
    device: Device,
}

impl TchData {
    pub fn new(dataset: ImageDataset, device: Device) -> Self {
        Self { dataset, device }
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }
}

impl DataSource for TchData {
    type Images = Tensor;

    fn sample(&mut self, batch_size: usize, resolution: u32, level: f64) -> Result<Tensor> {
        let batch = self.dataset.batch(batch_size, resolution, level)?;
        let (n, c, h, w) = batch.dim();
        let values = batch.as_standard_layout();
        let slice = values
            .as_slice()
            .ok_or_else(|| PgganError::Shape("batch is not contiguous".to_string()))?;
        Ok(Tensor::from_slice(slice)
            .view([n as i64, c as i64, h as i64, w as i64])
            .to_device(self.device))
    }
}

/// Load an NCHW image tensor saved with `torch.save`/`Tensor::save`
///
/// Integer tensors are taken as 0..255 pixels and mapped to [-1, 1].
pub fn load_tensor_dataset(path: impl AsRef<Path>) -> Result<ImageDataset> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PgganError::MissingArtifact(path.to_path_buf()));
    }

    let tensor = Tensor::load(path)?;
    let tensor = match tensor.kind() {
        Kind::Uint8 | Kind::Int8 | Kind::Int16 | Kind::Int | Kind::Int64 => {
            tensor.to_kind(Kind::Float) / 127.5 - 1.0
        }
        _ => tensor.to_kind(Kind::Float),
    };

    let size = tensor.size();
    let &[n, c, h, w] = size.as_slice() else {
        return Err(PgganError::Shape(format!("expected an NCHW tensor, got {:?}", size)));
    };
    let values = Vec::<f32>::try_from(&tensor.contiguous().view([-1]))?;
    let data = Array4::from_shape_vec((n as usize, c as usize, h as usize, w as usize), values)?;

    tracing::info!("Loaded {} images of {}x{} from {}", n, h, w, path.display());
    ImageDataset::new(data, true)
}
