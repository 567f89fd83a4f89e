//! Run directories and checkpoint save/restore
//!
//! A run lives in `{exp_dir}/{timestamp}/` with `samples/` and `ckpts/`
//! subdirectories. Each checkpoint is a pair of parameter files
//! `{tag}-G.ot` / `{tag}-D.ot` plus a JSON sidecar `{tag}.json` holding the
//! training state, where the tag reads `{res}x{res}-{phase}-{iteration:06}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PgganError, Result};
use crate::model::Trainable;
use crate::training::schedule::BatchSizeTable;
use crate::training::sequencer::{level_of_resolution, stage_resolution, Phase, ResumePoint, TrainingState};
use crate::utils::{GanKind, Options};

const GENERATOR_SUFFIX: &str = "-G.ot";
const DISCRIMINATOR_SUFFIX: &str = "-D.ot";

/// Checkpoint name, e.g. `128x128-fade_in-105000`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointTag {
    /// Stabilize resolution of the saved level
    pub resolution: u32,
    pub phase: Phase,
    pub iteration: u64,
}

impl CheckpointTag {
    pub fn new(resolution: u32, phase: Phase, iteration: u64) -> Self {
        Self {
            resolution,
            phase,
            iteration,
        }
    }

    /// Tag for the given progress
    pub fn for_state(state: &TrainingState) -> Self {
        Self::new(stage_resolution(state.level), state.phase, state.iteration)
    }

    pub fn level(&self) -> Result<u32> {
        level_of_resolution(self.resolution)
    }

    pub fn resume_point(&self) -> Result<ResumePoint> {
        Ok(ResumePoint {
            level: self.level()?,
            phase: self.phase,
            iteration: self.iteration,
        })
    }

    fn sort_key(&self) -> (u32, bool, u64) {
        (self.resolution, self.phase == Phase::FadeIn, self.iteration)
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}-{}-{:06}",
            self.resolution, self.resolution, self.phase, self.iteration
        )
    }
}

impl FromStr for CheckpointTag {
    type Err = PgganError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || PgganError::MalformedTag(s.to_string());

        let mut parts = s.splitn(3, '-');
        let (Some(resol), Some(phase), Some(iteration)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed());
        };

        let (w, h) = resol.split_once('x').ok_or_else(malformed)?;
        let w: u32 = w.parse().map_err(|_| malformed())?;
        let h: u32 = h.parse().map_err(|_| malformed())?;
        if w != h {
            return Err(malformed());
        }

        let phase: Phase = phase.parse().map_err(|_| malformed())?;
        let iteration: u64 = iteration.parse().map_err(|_| malformed())?;

        let tag = Self::new(w, phase, iteration);
        tag.level().map_err(|_| malformed())?;
        Ok(tag)
    }
}

/// Training state stored next to the parameter files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub tag: String,
    pub level: u32,
    pub phase: Phase,
    pub iteration: u64,
    /// Real images shown when the checkpoint was written
    pub cur_nimg: u64,
    /// Continuous level of the saved iteration
    pub cur_level: f64,
    pub gan: GanKind,
    /// Discriminator-output EMA driving input noise
    pub d_ema: Option<f64>,
    /// Mean real score of the saved iteration
    pub last_real_mean: Option<f64>,
    pub timestamp: String,
}

impl CheckpointMeta {
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            level: self.level,
            phase: self.phase,
            iteration: self.iteration,
        }
    }

    /// Metadata recoverable from the tag alone
    fn from_tag(tag: &CheckpointTag, gan: GanKind) -> Result<Self> {
        Ok(Self {
            tag: tag.to_string(),
            level: tag.level()?,
            phase: tag.phase,
            iteration: tag.iteration,
            cur_nimg: 0,
            cur_level: tag.level()? as f64,
            gan,
            d_ema: None,
            last_real_mean: None,
            timestamp: String::new(),
        })
    }
}

/// Runs that may start under one experiment directory within the same second
const MAX_SESSIONS_PER_SECOND: usize = 1000;

/// Directory layout of one run
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub root: PathBuf,
    pub samples: PathBuf,
    pub ckpts: PathBuf,
    /// Time this process started, used to name per-invocation files
    pub started: String,
}

impl RunLayout {
    fn timestamp() -> String {
        chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
    }

    /// Candidate session stamps: the timestamp, then `_1`, `_2`, ... suffixes
    fn stamps() -> impl Iterator<Item = String> {
        let base = Self::timestamp();
        let suffixed = (1..MAX_SESSIONS_PER_SECOND).map({
            let base = base.clone();
            move |n| format!("{}_{}", base, n)
        });
        std::iter::once(base).chain(suffixed)
    }

    /// Create a new timestamped run under `exp_dir`.
    ///
    /// The run root is created exclusively; a folder taken by a run started in
    /// the same second gets a numeric suffix.
    pub fn fresh(exp_dir: impl AsRef<Path>) -> Result<Self> {
        let exp_dir = exp_dir.as_ref();
        std::fs::create_dir_all(exp_dir)?;

        for started in Self::stamps() {
            let root = exp_dir.join(&started);
            match std::fs::create_dir(&root) {
                Ok(()) => {
                    let layout = Self::at(root, started);
                    std::fs::create_dir(&layout.samples)?;
                    std::fs::create_dir(&layout.ckpts)?;
                    tracing::info!("Created run directory {}", layout.root.display());
                    return Ok(layout);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PgganError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free run directory under {}", exp_dir.display()),
        )))
    }

    /// Reuse an existing run directory.
    ///
    /// Per-session files get a stamp not yet used by an earlier session of
    /// the same run.
    pub fn resume(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let started = Self::stamps()
            .find(|stamp| !root.join(format!("options_{}.json", stamp)).exists())
            .unwrap_or_else(Self::timestamp);
        let layout = Self::at(root, started);
        for required in [&layout.root, &layout.samples, &layout.ckpts] {
            if !required.is_dir() {
                return Err(PgganError::MissingArtifact(required.clone()));
            }
        }
        Ok(layout)
    }

    fn at(root: PathBuf, started: String) -> Self {
        Self {
            samples: root.join("samples"),
            ckpts: root.join("ckpts"),
            root,
            started,
        }
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(&self.ckpts)
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join(format!("metrics_{}.csv", self.started))
    }

    /// Write the effective options and batch-size table of this invocation
    pub fn save_options(&self, options: &Options, batch_sizes: &BatchSizeTable) -> Result<PathBuf> {
        let table: BTreeMap<String, usize> = batch_sizes
            .iter()
            .map(|(resol, bs)| (resol.to_string(), bs))
            .collect();
        let record = serde_json::json!({
            "options": options,
            "batch_sizes": table,
        });

        let path = self.root.join(format!("options_{}.json", self.started));
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(path)
    }
}

/// Saves and restores generator/discriminator pairs in a `ckpts/` directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generator_path(&self, tag: &CheckpointTag) -> PathBuf {
        self.dir.join(format!("{}{}", tag, GENERATOR_SUFFIX))
    }

    pub fn discriminator_path(&self, tag: &CheckpointTag) -> PathBuf {
        self.dir.join(format!("{}{}", tag, DISCRIMINATOR_SUFFIX))
    }

    pub fn meta_path(&self, tag: &CheckpointTag) -> PathBuf {
        self.dir.join(format!("{}.json", tag))
    }

    /// Persist both networks and the sidecar
    pub fn save<G: Trainable, D: Trainable>(
        &self,
        generator: &G,
        discriminator: &D,
        tag: &CheckpointTag,
        meta: &CheckpointMeta,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        generator.save(&self.generator_path(tag))?;
        discriminator.save(&self.discriminator_path(tag))?;
        std::fs::write(self.meta_path(tag), serde_json::to_string_pretty(meta)?)?;

        tracing::info!("Saved checkpoint {} to {}", tag, self.dir.display());
        Ok(())
    }

    /// Load both networks for `tag` and return the saved state
    ///
    /// Both parameter files are required. The sidecar is optional; without
    /// it the state is recovered from the tag.
    pub fn restore<G: Trainable, D: Trainable>(
        &self,
        generator: &mut G,
        discriminator: &mut D,
        tag: &CheckpointTag,
        gan: GanKind,
    ) -> Result<CheckpointMeta> {
        let g_path = self.generator_path(tag);
        let d_path = self.discriminator_path(tag);
        for path in [&g_path, &d_path] {
            if !path.is_file() {
                return Err(PgganError::MissingArtifact(path.clone()));
            }
        }

        generator.load(&g_path)?;
        discriminator.load(&d_path)?;

        let meta_path = self.meta_path(tag);
        let meta = if meta_path.is_file() {
            let meta: CheckpointMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
            if meta.resume_point() != tag.resume_point()? {
                return Err(PgganError::Config(format!(
                    "sidecar {} disagrees with its tag",
                    meta_path.display()
                )));
            }
            if meta.gan != gan {
                return Err(PgganError::Config(format!(
                    "checkpoint {} was trained with gan {}, this run uses {}",
                    tag, meta.gan, gan
                )));
            }
            meta
        } else {
            tracing::warn!("No sidecar for {}, recovering state from the tag", tag);
            CheckpointMeta::from_tag(tag, gan)?
        };

        tracing::info!("Restored from dir: {}, pattern: {}", self.dir.display(), tag);
        Ok(meta)
    }

    /// All complete checkpoints, oldest progress first
    pub fn list(&self) -> Vec<CheckpointTag> {
        let mut tags: Vec<CheckpointTag> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_suffix(GENERATOR_SUFFIX)?.parse().ok()
            })
            .filter(|tag| self.discriminator_path(tag).is_file())
            .collect();

        tags.sort_by_key(CheckpointTag::sort_key);
        tags
    }

    /// Furthest checkpoint in training progress
    pub fn latest(&self) -> Option<CheckpointTag> {
        self.list().pop()
    }

    pub fn load_meta(&self, tag: &CheckpointTag) -> Result<CheckpointMeta> {
        let path = self.meta_path(tag);
        if !path.is_file() {
            return Err(PgganError::MissingArtifact(path));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&path)?)?)
    }
}
