//! Configuration management
//!
//! `Options` is the immutable run configuration. It is assembled once from
//! defaults, an optional JSON/TOML file and command-line overrides, validated
//! eagerly, and then only read for the lifetime of a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PgganError, Result};

/// Adversarial loss family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GanKind {
    /// Least-squares GAN
    #[default]
    Lsgan,
    /// Non-saturating log-loss GAN
    Gan,
    /// Wasserstein GAN (gradient penalty hook)
    WganGp,
}

impl GanKind {
    /// Whether the discriminator should end with a sigmoid
    pub fn sigmoid_at_end(&self) -> bool {
        matches!(self, GanKind::Lsgan | GanKind::Gan)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GanKind::Lsgan => "lsgan",
            GanKind::Gan => "gan",
            GanKind::WganGp => "wgan_gp",
        }
    }
}

impl FromStr for GanKind {
    type Err = PgganError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lsgan" => Ok(GanKind::Lsgan),
            "gan" => Ok(GanKind::Gan),
            "wgan_gp" | "wgan-gp" => Ok(GanKind::WganGp),
            other => Err(PgganError::UnsupportedGan(other.to_string())),
        }
    }
}

impl fmt::Display for GanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latent distribution family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    /// Standard normal
    #[default]
    Gaussian,
    /// Uniform on [-1, 1)
    Uniform,
}

impl FromStr for NoiseKind {
    type Err = PgganError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gaussian" | "normal" => Ok(NoiseKind::Gaussian),
            "uniform" => Ok(NoiseKind::Uniform),
            other => Err(PgganError::Config(format!("unknown noise distribution '{}'", other))),
        }
    }
}

/// Training options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Device: "cpu", "cuda" or "cuda:N"
    pub device: String,
    /// Thousands of real images shown in each stabilize phase
    pub train_kimg: f64,
    /// Thousands of real images shown in each fade-in phase
    pub transition_kimg: f64,
    /// Length of the learning-rate schedule in kimg
    pub total_kimg: f64,
    /// Ramp-up length in kimg
    pub rampup_kimg: f64,
    /// Ramp-down length in kimg
    pub rampdown_kimg: f64,
    /// Peak generator learning rate
    pub g_lr_max: f64,
    /// Peak discriminator learning rate
    pub d_lr_max: f64,
    /// Weight of the fake-image term in the discriminator loss
    pub fake_weight: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adversarial loss family
    pub gan: GanKind,
    /// First trained resolution
    pub first_resol: u32,
    /// Final resolution
    pub target_resol: u32,
    /// Latent vector size
    pub latent_size: usize,
    /// Latent distribution
    pub noise: NoiseKind,
    /// Feature maps of the reference networks at 1x1
    pub fmap_base: i64,
    /// Feature-map cap of the reference networks
    pub fmap_max: i64,
    /// Sampling/summary frequency in iterations
    pub sample_freq: u64,
    /// Checkpoint frequency in iterations
    pub save_freq: u64,
    /// Experiment root directory
    pub exp_dir: PathBuf,
    /// Disable noise injection on real images
    pub no_noise: bool,
    /// Disable tanh at the end of the generator
    pub no_tanh: bool,
    /// Run directory to resume from
    pub restore_dir: Option<PathBuf>,
    /// Checkpoint tag to resume from, e.g. 128x128-fade_in-105000
    pub which_file: Option<String>,
    /// Pre-decoded training images
    pub dataset: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            train_kimg: 600.0,
            transition_kimg: 600.0,
            total_kimg: 10000.0,
            rampup_kimg: 10000.0,
            rampdown_kimg: 10000.0,
            g_lr_max: 1e-3,
            d_lr_max: 1e-3,
            fake_weight: 0.1,
            beta1: 0.0,
            beta2: 0.99,
            gan: GanKind::Lsgan,
            first_resol: 4,
            target_resol: 256,
            latent_size: 512,
            noise: NoiseKind::Gaussian,
            fmap_base: 8192,
            fmap_max: 512,
            sample_freq: 500,
            save_freq: 5000,
            exp_dir: PathBuf::from("./exp"),
            no_noise: false,
            no_tanh: false,
            restore_dir: None,
            which_file: None,
            dataset: None,
        }
    }
}

impl Options {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a file, TOML if the extension says so, JSON otherwise
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let options = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(options)
    }

    /// Save options to a file, TOML if the extension says so, JSON otherwise
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate every option that can be checked before training starts
    pub fn validate(&self) -> Result<()> {
        check_power_of_two("first_resol", self.first_resol)?;
        check_power_of_two("target_resol", self.target_resol)?;
        if self.first_resol < 4 {
            return Err(PgganError::Config(format!(
                "first_resol must be at least 4, got {}",
                self.first_resol
            )));
        }
        if self.target_resol < self.first_resol {
            return Err(PgganError::TargetBelowFirst {
                first: self.first_resol,
                target: self.target_resol,
            });
        }

        if !(self.train_kimg.is_finite() && self.train_kimg > 0.0) {
            return Err(PgganError::Config("train_kimg must be > 0".into()));
        }
        for (name, value) in [
            ("transition_kimg", self.transition_kimg),
            ("rampup_kimg", self.rampup_kimg),
            ("rampdown_kimg", self.rampdown_kimg),
            ("fake_weight", self.fake_weight),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(PgganError::Config(format!("{} must be >= 0, got {}", name, value)));
            }
        }
        for (name, value) in [
            ("total_kimg", self.total_kimg),
            ("g_lr_max", self.g_lr_max),
            ("d_lr_max", self.d_lr_max),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PgganError::Config(format!("{} must be > 0, got {}", name, value)));
            }
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(PgganError::Config("Adam betas must lie in [0, 1)".into()));
        }
        if self.sample_freq == 0 || self.save_freq == 0 {
            return Err(PgganError::Config("sample_freq and save_freq must be > 0".into()));
        }
        if self.latent_size == 0 {
            return Err(PgganError::Config("latent_size must be > 0".into()));
        }

        match (&self.restore_dir, &self.which_file) {
            (Some(_), None) | (None, Some(_)) => Err(PgganError::Config(
                "restore_dir and which_file must be given together".into(),
            )),
            _ => Ok(()),
        }
    }

    /// log2 of the first resolution
    pub fn first_level(&self) -> u32 {
        self.first_resol.trailing_zeros()
    }

    /// log2 of the target resolution
    pub fn target_level(&self) -> u32 {
        self.target_resol.trailing_zeros()
    }

    /// Resume pointers, if both were given
    pub fn resume_target(&self) -> Option<(&Path, &str)> {
        match (&self.restore_dir, &self.which_file) {
            (Some(dir), Some(tag)) => Some((dir.as_path(), tag.as_str())),
            _ => None,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

fn check_power_of_two(name: &'static str, value: u32) -> Result<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(PgganError::NotPowerOfTwo { name, value })
    }
}
