//! In-memory image dataset serving batches at any trained resolution
//!
//! Images are stored once at native resolution (NCHW, values in [-1, 1]).
//! Lower resolutions are produced by average pooling. During fade-in the
//! real batch is blended the same way the networks blend their outputs.

use image::imageops::{self, FilterType};
use ndarray::{Array4, Axis};
use std::path::Path;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::DataSource;
use crate::error::{PgganError, Result};

/// Shuffled, epoch-based sampler over an NCHW image array
pub struct ImageDataset {
    /// Full dataset of shape (num_images, channels, height, width)
    data: Array4<f32>,
    /// Whether to reshuffle each epoch
    shuffle: bool,
    /// Current permutation
    indices: Vec<usize>,
    /// Position within the current permutation
    current_idx: usize,
    rng: StdRng,
}

impl ImageDataset {
    /// Create a dataset from square power-of-two images
    pub fn new(data: Array4<f32>, shuffle: bool) -> Result<Self> {
        Self::with_rng(data, shuffle, StdRng::from_entropy())
    }

    /// Reproducible variant of [`ImageDataset::new`]
    pub fn with_seed(data: Array4<f32>, shuffle: bool, seed: u64) -> Result<Self> {
        Self::with_rng(data, shuffle, StdRng::seed_from_u64(seed))
    }

    fn with_rng(data: Array4<f32>, shuffle: bool, rng: StdRng) -> Result<Self> {
        let (n, _, h, w) = data.dim();
        if n == 0 {
            return Err(PgganError::Shape("dataset is empty".to_string()));
        }
        if h != w || !h.is_power_of_two() {
            return Err(PgganError::Shape(format!(
                "images must be square with power-of-two side, got {}x{}",
                h, w
            )));
        }

        let mut dataset = Self {
            data,
            shuffle,
            indices: (0..n).collect(),
            current_idx: 0,
            rng,
        };
        if shuffle {
            dataset.shuffle_indices();
        }
        Ok(dataset)
    }

    pub fn num_samples(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    /// Side length of the stored images
    pub fn native_resolution(&self) -> u32 {
        self.data.len_of(Axis(2)) as u32
    }

    fn shuffle_indices(&mut self) {
        self.indices.shuffle(&mut self.rng);
    }

    /// Start a new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.shuffle_indices();
        }
    }

    /// Next `batch_size` indices, wrapping into a new epoch as needed
    fn next_indices(&mut self, batch_size: usize) -> Vec<usize> {
        let mut picked = Vec::with_capacity(batch_size);
        while picked.len() < batch_size {
            if self.current_idx >= self.indices.len() {
                self.reset();
            }
            let take = (batch_size - picked.len()).min(self.indices.len() - self.current_idx);
            picked.extend_from_slice(&self.indices[self.current_idx..self.current_idx + take]);
            self.current_idx += take;
        }
        picked
    }

    /// Real batch at `resolution`, blended for fractional `level`
    pub fn batch(&mut self, batch_size: usize, resolution: u32, level: f64) -> Result<Array4<f32>> {
        let native = self.native_resolution();
        if !resolution.is_power_of_two() || resolution > native {
            return Err(PgganError::Shape(format!(
                "cannot serve {}x{} batches from {}x{} images",
                resolution, resolution, native, native
            )));
        }

        let indices = self.next_indices(batch_size);
        let full = self.data.select(Axis(0), &indices);
        let x = avg_pool(&full, (native / resolution) as usize)?;
        fade_blend(&x, level)
    }
}

/// Load every PNG/JPEG in `dir`, resized to `resolution` and scaled to [-1, 1]
pub fn load_image_folder(dir: impl AsRef<Path>, resolution: u32) -> Result<ImageDataset> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(PgganError::MissingArtifact(dir.to_path_buf()));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let side = resolution as usize;
    let mut data = Array4::<f32>::zeros((paths.len(), 3, side, side));
    for (i, path) in paths.iter().enumerate() {
        let img = image::open(path)?.to_rgb8();
        let img = imageops::resize(&img, resolution, resolution, FilterType::Triangle);
        for (x, y, pixel) in img.enumerate_pixels() {
            for c in 0..3 {
                data[[i, c, y as usize, x as usize]] = pixel[c] as f32 / 127.5 - 1.0;
            }
        }
    }

    tracing::info!("Loaded {} images from {}", paths.len(), dir.display());
    ImageDataset::new(data, true)
}

impl DataSource for ImageDataset {
    type Images = Array4<f32>;

    fn sample(&mut self, batch_size: usize, resolution: u32, level: f64) -> Result<Array4<f32>> {
        self.batch(batch_size, resolution, level)
    }
}

/// Average-pool the spatial axes by `factor`
pub fn avg_pool(x: &Array4<f32>, factor: usize) -> Result<Array4<f32>> {
    if factor <= 1 {
        return Ok(x.clone());
    }
    let (n, c, h, w) = x.dim();
    if h % factor != 0 || w % factor != 0 {
        return Err(PgganError::Shape(format!(
            "{}x{} is not divisible by pooling factor {}",
            h, w, factor
        )));
    }

    let pooled: Vec<f32> = x
        .exact_chunks((1, 1, factor, factor))
        .into_iter()
        .map(|chunk| chunk.mean().unwrap_or(0.0))
        .collect();
    Ok(Array4::from_shape_vec((n, c, h / factor, w / factor), pooled)?)
}

/// Nearest-neighbour upsampling of the spatial axes by `factor`
pub fn upsample_nearest(x: &Array4<f32>, factor: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    Array4::from_shape_fn((n, c, h * factor, w * factor), |(b, ch, i, j)| {
        x[[b, ch, i / factor, j / factor]]
    })
}

/// Blend a batch with its half-resolution version for a fractional level
///
/// `alpha` is the fractional part of `level`. Integer levels return the
/// batch untouched.
pub fn fade_blend(x: &Array4<f32>, level: f64) -> Result<Array4<f32>> {
    let alpha = level - level.floor();
    if alpha <= 0.0 || x.len_of(Axis(2)) < 2 {
        return Ok(x.clone());
    }
    let alpha = alpha as f32;
    let low = upsample_nearest(&avg_pool(x, 2)?, 2);
    Ok(low * (1.0 - alpha) + x * alpha)
}
