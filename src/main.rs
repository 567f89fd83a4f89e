//! Progressive GAN trainer
//!
//! Main entry point providing CLI interface for:
//! - Training (feature `tch`)
//! - Printing the resolution curriculum of a configuration
//! - Inspecting the checkpoints of a run
//! - Writing a default configuration file

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rust_pggan::{
    training::{ScheduleController, StageSequencer},
    utils::{CheckpointManager, CheckpointTag, GanKind, NoiseKind, Options},
};

/// Progressive-growing GAN training
#[derive(Parser)]
#[command(name = "pggan")]
#[command(version = "0.1.0")]
#[command(about = "Train progressive-growing GANs on a staged resolution curriculum")]
struct Cli {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train or resume a run
    Train(OptionOverrides),

    /// Print stages, batch sizes and iteration ranges
    Plan {
        #[command(flatten)]
        overrides: OptionOverrides,

        /// Plan the remainder of a run resumed from this checkpoint tag
        #[arg(long)]
        from: Option<String>,
    },

    /// List the checkpoints of a run directory
    Inspect {
        /// Run directory containing ckpts/
        run_dir: PathBuf,
    },

    /// Initialize default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },
}

/// Command-line values that take precedence over the configuration file
#[derive(Args, Debug, Default)]
struct OptionOverrides {
    /// Real images (or tensor file) to train on
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    device: Option<String>,
    /// lsgan, gan or wgan_gp
    #[arg(long)]
    gan: Option<GanKind>,
    #[arg(long)]
    first_resol: Option<u32>,
    #[arg(long)]
    target_resol: Option<u32>,
    #[arg(long)]
    train_kimg: Option<f64>,
    #[arg(long)]
    transition_kimg: Option<f64>,
    #[arg(long)]
    total_kimg: Option<f64>,
    #[arg(long)]
    rampup_kimg: Option<f64>,
    #[arg(long)]
    rampdown_kimg: Option<f64>,
    #[arg(long)]
    g_lr_max: Option<f64>,
    #[arg(long)]
    d_lr_max: Option<f64>,
    #[arg(long)]
    fake_weight: Option<f64>,
    #[arg(long)]
    beta1: Option<f64>,
    #[arg(long)]
    beta2: Option<f64>,
    #[arg(long)]
    latent_size: Option<usize>,
    /// gaussian or uniform
    #[arg(long)]
    noise: Option<NoiseKind>,
    #[arg(long)]
    fmap_base: Option<i64>,
    #[arg(long)]
    fmap_max: Option<i64>,
    #[arg(long)]
    sample_freq: Option<u64>,
    #[arg(long)]
    save_freq: Option<u64>,
    #[arg(long)]
    exp_dir: Option<PathBuf>,
    /// Run directory to resume from
    #[arg(long)]
    restore_dir: Option<PathBuf>,
    /// Checkpoint tag to resume from, e.g. 128x128-fade_in-105000
    #[arg(long)]
    which_file: Option<String>,
    /// Disable adaptive input noise
    #[arg(long)]
    no_noise: bool,
    /// Drop the generator's final tanh
    #[arg(long)]
    no_tanh: bool,
}

impl OptionOverrides {
    fn apply(self, options: &mut Options) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    options.$field = value;
                })*
            };
        }
        set!(
            device,
            gan,
            first_resol,
            target_resol,
            train_kimg,
            transition_kimg,
            total_kimg,
            rampup_kimg,
            rampdown_kimg,
            g_lr_max,
            d_lr_max,
            fake_weight,
            beta1,
            beta2,
            latent_size,
            noise,
            fmap_base,
            fmap_max,
            sample_freq,
            save_freq,
            exp_dir
        );

        if self.dataset.is_some() {
            options.dataset = self.dataset;
        }
        if self.restore_dir.is_some() {
            options.restore_dir = self.restore_dir;
        }
        if self.which_file.is_some() {
            options.which_file = self.which_file;
        }
        options.no_noise |= self.no_noise;
        options.no_tanh |= self.no_tanh;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Train(overrides) => {
            let options = load_options(&cli.config, overrides)?;
            train(options)?;
        }
        Commands::Plan { overrides, from } => {
            let options = load_options(&cli.config, overrides)?;
            plan(&options, from.as_deref())?;
        }
        Commands::Inspect { run_dir } => {
            inspect(&run_dir)?;
        }
        Commands::Init { output } => {
            init_config(&output)?;
        }
    }

    Ok(())
}

/// Defaults, then the configuration file if present, then the command line
fn load_options(config_path: &Path, overrides: OptionOverrides) -> Result<Options> {
    let mut options = if config_path.exists() {
        info!("Loading configuration from {}", config_path.display());
        Options::load(config_path)?
    } else {
        info!("Config file not found, using defaults");
        Options::default()
    };
    overrides.apply(&mut options);
    options.validate()?;
    Ok(options)
}

/// Print the curriculum of a configuration
fn plan(options: &Options, from: Option<&str>) -> Result<()> {
    let schedule = ScheduleController::new(options);
    let resume = match from {
        Some(tag) => Some(tag.parse::<CheckpointTag>()?.resume_point()?),
        None => None,
    };
    let sequencer = StageSequencer::new(options, schedule.batch_sizes(), resume)?;

    println!(
        "gan: {}, first {}x{}, target {}x{}",
        options.gan, options.first_resol, options.first_resol, options.target_resol, options.target_resol
    );
    for (resolution, batch_size) in schedule.batch_sizes().iter() {
        if resolution >= options.first_resol && resolution <= options.target_resol * 2 {
            println!("  batch size at {:>4}x{:<4} {}", resolution, resolution, batch_size);
        }
    }
    for stage in sequencer.stages() {
        println!("{}", stage);
    }

    let state = sequencer.initial_state();
    println!(
        "{} iterations, starting at {:.1} kimg",
        sequencer.total_iterations(),
        state.kimg()
    );
    Ok(())
}

/// List checkpoints of a run
fn inspect(run_dir: &Path) -> Result<()> {
    let manager = CheckpointManager::new(run_dir.join("ckpts"));
    let tags = manager.list();
    if tags.is_empty() {
        println!("No checkpoints in {}", manager.dir().display());
        return Ok(());
    }

    for tag in &tags {
        match manager.load_meta(tag) {
            Ok(meta) => println!(
                "{}  level {:.3}  {:.1} kimg  d_ema {}  {}",
                tag,
                meta.cur_level,
                meta.cur_nimg as f64 / 1000.0,
                meta.d_ema.map_or("-".to_string(), |v| format!("{:.4}", v)),
                meta.timestamp
            ),
            Err(_) => println!("{}  (no sidecar)", tag),
        }
    }
    if let Some(latest) = manager.latest() {
        println!("latest: {}", latest);
    }
    Ok(())
}

/// Initialize default configuration file
fn init_config(output_path: &Path) -> Result<()> {
    Options::default().save(output_path)?;
    info!("Created default configuration at {}", output_path.display());
    Ok(())
}

#[cfg(feature = "tch")]
fn train(options: Options) -> Result<()> {
    use rust_pggan::data::{load_image_folder, load_tensor_dataset, TchData, TchNoise};
    use rust_pggan::model::tch_backend::parse_device;
    use rust_pggan::model::{NetworkConfig, TchDiscriminator, TchGenerator};
    use rust_pggan::training::Trainer;

    let device = parse_device(&options.device)?;
    info!("Using device: {:?}", device);

    let Some(dataset_path) = options.dataset.clone() else {
        anyhow::bail!("no dataset given: set `dataset` in the configuration or pass --dataset");
    };
    let dataset = if dataset_path.is_dir() {
        load_image_folder(&dataset_path, options.target_resol * 2)?
    } else {
        load_tensor_dataset(&dataset_path)?
    };

    let config = NetworkConfig::from_options(&options, dataset.channels() as i64);
    let generator = TchGenerator::new(config.clone(), &options, device)?;
    let discriminator = TchDiscriminator::new(config, &options, device)?;
    let noise = TchNoise::new(options.latent_size, options.noise, device);
    let data = TchData::new(dataset, device);

    let mut trainer = Trainer::new(options, generator, discriminator, noise, data)?;
    let summary = trainer.train()?;

    info!(
        "Training complete after {} iterations at {:.1} kimg{}",
        summary.iterations,
        summary.state.kimg(),
        summary
            .last_checkpoint
            .map(|tag| format!(", last checkpoint {}", tag))
            .unwrap_or_default()
    );
    Ok(())
}

#[cfg(not(feature = "tch"))]
fn train(_options: Options) -> Result<()> {
    anyhow::bail!("training needs the libtorch backend: rebuild with `--features tch`")
}
