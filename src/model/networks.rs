//! Progressive generator and discriminator
//!
//! Block `k` works at resolution `2^(k+2)`: block 0 at 4x4, block 1 at 8x8
//! and so on. A continuous level `L` activates blocks `0..=ceil(L)-1`; when
//! `L` has a fractional part the output of the newest block is blended with
//! the upsampled output of the previous one.

use tch::{nn, nn::Module, Tensor};

use crate::utils::Options;

const LEAKY_SLOPE: f64 = 0.2;

/// Shape of a progressive network pair
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub latent_size: i64,
    /// Image channels
    pub channels: i64,
    /// Largest resolution the networks can produce or consume
    pub max_resolution: u32,
    pub fmap_base: i64,
    pub fmap_max: i64,
    /// Finish the generator with tanh
    pub tanh: bool,
    /// Finish the discriminator with a sigmoid
    pub sigmoid: bool,
}

impl NetworkConfig {
    /// Networks for a run: the last fade-in reaches twice the target resolution
    pub fn from_options(options: &Options, channels: i64) -> Self {
        Self {
            latent_size: options.latent_size as i64,
            channels,
            max_resolution: options.target_resol * 2,
            fmap_base: options.fmap_base,
            fmap_max: options.fmap_max,
            tanh: !options.no_tanh,
            sigmoid: options.gan.sigmoid_at_end(),
        }
    }

    /// Number of resolution blocks
    pub fn num_blocks(&self) -> usize {
        (self.max_resolution.trailing_zeros().saturating_sub(1)) as usize
    }

    /// Feature maps of block `k`
    pub fn features(&self, k: usize) -> i64 {
        (self.fmap_base >> (k + 1)).clamp(1, self.fmap_max)
    }

    /// Newest active block and its blend weight at `level`
    fn active(&self, level: f64) -> (usize, f64) {
        let level = level.clamp(1.0, self.num_blocks() as f64);
        let hi = (level.ceil() as usize).saturating_sub(1);
        (hi, level - level.floor())
    }
}

fn leaky(x: &Tensor) -> Tensor {
    x.maximum(&(x * LEAKY_SLOPE))
}

fn conv3(vs: nn::Path, c_in: i64, c_out: i64) -> nn::Conv2D {
    let config = nn::ConvConfig {
        padding: 1,
        ..Default::default()
    };
    nn::conv2d(vs, c_in, c_out, 3, config)
}

fn conv1(vs: nn::Path, c_in: i64, c_out: i64) -> nn::Conv2D {
    nn::conv2d(vs, c_in, c_out, 1, Default::default())
}

fn upsample(x: &Tensor) -> Tensor {
    let size = x.size();
    x.upsample_nearest2d([size[2] * 2, size[3] * 2], None, None)
}

#[derive(Debug)]
struct GeneratorBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
}

/// Progressive generator
#[derive(Debug)]
pub struct ProgressiveGenerator {
    config: NetworkConfig,
    /// Latent to 4x4 feature map
    project: nn::Linear,
    /// 4x4 convolution of block 0
    head: nn::Conv2D,
    blocks: Vec<GeneratorBlock>,
    to_rgb: Vec<nn::Conv2D>,
}

impl ProgressiveGenerator {
    pub fn new(vs: &nn::Path, config: NetworkConfig) -> Self {
        let n = config.num_blocks();
        let nf0 = config.features(0);

        let project = nn::linear(vs / "project", config.latent_size, nf0 * 16, Default::default());
        let head = conv3(vs / "head", nf0, nf0);
        let blocks = (1..n)
            .map(|k| {
                let p = vs / "blocks" / k;
                GeneratorBlock {
                    conv1: conv3(&p / "conv1", config.features(k - 1), config.features(k)),
                    conv2: conv3(&p / "conv2", config.features(k), config.features(k)),
                }
            })
            .collect();
        let to_rgb = (0..n)
            .map(|k| conv1(vs / "to_rgb" / k, config.features(k), config.channels))
            .collect();

        Self {
            config,
            project,
            head,
            blocks,
            to_rgb,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Images of resolution `2^ceil(level + 1)` from latents `(N, latent_size)`
    pub fn forward(&self, z: &Tensor, level: f64) -> Tensor {
        let (hi, alpha) = self.config.active(level);
        let batch = z.size()[0];

        let mut x = leaky(&self.project.forward(z)).view([batch, self.config.features(0), 4, 4]);
        x = leaky(&self.head.forward(&x));

        let mut prev = None;
        for block in &self.blocks[..hi] {
            prev = Some(x.shallow_clone());
            let up = upsample(&x);
            x = leaky(&block.conv2.forward(&leaky(&block.conv1.forward(&up))));
        }

        let rgb = self.to_rgb[hi].forward(&x);
        let out = match prev {
            Some(prev) if alpha > 0.0 => {
                let low = upsample(&self.to_rgb[hi - 1].forward(&prev));
                low * (1.0 - alpha) + rgb * alpha
            }
            _ => rgb,
        };

        if self.config.tanh {
            out.tanh()
        } else {
            out
        }
    }
}

#[derive(Debug)]
struct DiscriminatorBlock {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
}

/// Progressive discriminator
#[derive(Debug)]
pub struct ProgressiveDiscriminator {
    config: NetworkConfig,
    from_rgb: Vec<nn::Conv2D>,
    blocks: Vec<DiscriminatorBlock>,
    head: nn::Conv2D,
    score: nn::Linear,
}

impl ProgressiveDiscriminator {
    pub fn new(vs: &nn::Path, config: NetworkConfig) -> Self {
        let n = config.num_blocks();
        let nf0 = config.features(0);

        let from_rgb = (0..n)
            .map(|k| conv1(vs / "from_rgb" / k, config.channels, config.features(k)))
            .collect();
        let blocks = (1..n)
            .map(|k| {
                let p = vs / "blocks" / k;
                DiscriminatorBlock {
                    conv1: conv3(&p / "conv1", config.features(k), config.features(k)),
                    conv2: conv3(&p / "conv2", config.features(k), config.features(k - 1)),
                }
            })
            .collect();
        let head = conv3(vs / "head", nf0, nf0);
        let score = nn::linear(vs / "score", nf0 * 16, 1, Default::default());

        Self {
            config,
            from_rgb,
            blocks,
            head,
            score,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn block(&self, k: usize, x: &Tensor) -> Tensor {
        let block = &self.blocks[k - 1];
        leaky(&block.conv2.forward(&leaky(&block.conv1.forward(x)))).avg_pool2d_default(2)
    }

    /// Scores of shape `(N,)`; Gaussian noise of `noise_strength` is added to the input
    pub fn forward(&self, images: &Tensor, level: f64, noise_strength: f64) -> Tensor {
        let (hi, alpha) = self.config.active(level);

        let noisy;
        let images = if noise_strength > 0.0 {
            noisy = images + images.randn_like() * noise_strength;
            &noisy
        } else {
            images
        };

        let mut x = leaky(&self.from_rgb[hi].forward(images));
        if hi > 0 {
            x = self.block(hi, &x);
            if alpha > 0.0 {
                let low = leaky(&self.from_rgb[hi - 1].forward(&images.avg_pool2d_default(2)));
                x = low * (1.0 - alpha) + x * alpha;
            }
            for k in (1..hi).rev() {
                x = self.block(k, &x);
            }
        }

        let x = leaky(&self.head.forward(&x)).flatten(1, -1);
        let score = self.score.forward(&x).view([-1]);
        if self.config.sigmoid {
            score.sigmoid()
        } else {
            score
        }
    }
}
