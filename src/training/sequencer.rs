//! Stage sequencer: the resolution/phase state machine
//!
//! A run walks resolution levels `R` upwards. Each level trains a `stabilize`
//! phase at resolution `2^(R+1)` followed by a `fade_in` phase that blends
//! towards the next resolution. Iteration indices are contiguous within a
//! level: fade-in continues numbering where stabilize stopped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PgganError, Result};
use crate::training::schedule::BatchSizeTable;
use crate::utils::Options;

/// Training phase within one resolution level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Fixed resolution, no blending
    Stabilize,
    /// Blending towards the next resolution
    FadeIn,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stabilize => "stabilize",
            Phase::FadeIn => "fade_in",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PgganError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stabilize" => Ok(Phase::Stabilize),
            "fade_in" => Ok(Phase::FadeIn),
            other => Err(PgganError::MalformedTag(format!("unknown phase '{}'", other))),
        }
    }
}

/// Iteration range of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRange {
    pub phase: Phase,
    /// Nominal first iteration, before any resume clipping
    pub first: u64,
    /// First iteration actually run
    pub start: u64,
    /// One past the last iteration
    pub end: u64,
}

impl PhaseRange {
    fn new(phase: Phase, first: u64, end: u64) -> Self {
        Self {
            phase,
            first,
            start: first,
            end,
        }
    }

    /// Number of iterations left to run
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Continuous level for iteration `it` of level `level`.
    ///
    /// Fade-in progress is measured against the nominal range, so a resumed
    /// phase continues the same blend it was saved at, and the last
    /// iteration reaches `level + 1`.
    pub fn level_at(&self, level: u32, it: u64) -> f64 {
        match self.phase {
            Phase::Stabilize => level as f64,
            Phase::FadeIn => {
                let span = self.end.saturating_sub(self.first).max(1) as f64;
                let done = (it + 1).saturating_sub(self.first) as f64;
                level as f64 + (done / span).min(1.0)
            }
        }
    }
}

/// Resolution actually produced at a continuous level: `2^ceil(level + 1)`
pub fn cur_resolution(cur_level: f64) -> u32 {
    1u32 << ((cur_level + 1.0).ceil() as u32)
}

/// Resolution of the stabilize phase of level `level`
pub fn stage_resolution(level: u32) -> u32 {
    1u32 << (level + 1)
}

/// Level whose stabilize phase trains at `resolution`
pub fn level_of_resolution(resolution: u32) -> Result<u32> {
    if !resolution.is_power_of_two() || resolution < 4 {
        return Err(PgganError::NotPowerOfTwo {
            name: "checkpoint resolution",
            value: resolution,
        });
    }
    Ok(resolution.trailing_zeros() - 1)
}

/// Plan of one resolution level
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub level: u32,
    pub resolution: u32,
    pub batch_size: usize,
    pub phases: Vec<PhaseRange>,
}

impl StagePlan {
    /// Unclipped plan of `level`
    fn nominal(level: u32, options: &Options, batch_sizes: &BatchSizeTable) -> Self {
        let resolution = stage_resolution(level);
        let batch_size = batch_sizes.get(resolution);
        let stabilize = phase_iterations(options.train_kimg, batch_size);
        let transition = phase_iterations(options.transition_kimg, batch_size);

        Self {
            level,
            resolution,
            batch_size,
            phases: vec![
                PhaseRange::new(Phase::Stabilize, 0, stabilize),
                PhaseRange::new(Phase::FadeIn, stabilize, stabilize + transition),
            ],
        }
    }

    /// Iterations left to run in this level
    pub fn iterations(&self) -> u64 {
        self.phases.iter().map(PhaseRange::len).sum()
    }

    /// Real images shown by the unclipped level
    fn nominal_images(&self) -> u64 {
        let end = self.phases.iter().map(|p| p.end).max().unwrap_or(0);
        end * self.batch_size as u64
    }
}

impl fmt::Display for StagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R={} {}x{} batch={}",
            self.level, self.resolution, self.resolution, self.batch_size
        )?;
        for range in &self.phases {
            write!(f, " | {} [{}, {})", range.phase, range.start, range.end)?;
        }
        Ok(())
    }
}

/// Iterations needed to show `kimg` thousand images, rounded up
fn phase_iterations(kimg: f64, batch_size: usize) -> u64 {
    let nimg = (kimg * 1000.0).round() as u64;
    nimg.div_ceil(batch_size as u64)
}

/// Position a run is resumed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub level: u32,
    pub phase: Phase,
    pub iteration: u64,
}

/// Mutable progress of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingState {
    /// Current resolution level R
    pub level: u32,
    pub phase: Phase,
    /// Real images shown since the start of the run
    pub cur_nimg: u64,
    /// Iteration index within the level
    pub iteration: u64,
    /// Whether the run was restored from a checkpoint
    pub restored: bool,
}

impl TrainingState {
    /// State of a fresh run starting at `level`
    pub fn fresh(level: u32) -> Self {
        Self {
            level,
            phase: Phase::Stabilize,
            cur_nimg: 0,
            iteration: 0,
            restored: false,
        }
    }

    /// Move to the iteration described by `ctx`
    pub fn enter(&mut self, ctx: &IterationContext) {
        debug_assert!(ctx.level >= self.level, "resolution level went backwards");
        self.level = ctx.level;
        self.phase = ctx.phase;
        self.iteration = ctx.iteration;
    }

    /// Account for one finished iteration
    pub fn advance(&mut self, batch_size: usize) {
        self.cur_nimg += batch_size as u64;
    }

    /// Current kimg
    pub fn kimg(&self) -> f64 {
        self.cur_nimg as f64 / 1000.0
    }
}

/// Everything a training step needs to know about its iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationContext {
    pub level: u32,
    pub phase: Phase,
    pub iteration: u64,
    pub range: PhaseRange,
    pub batch_size: usize,
    /// Resolution of the level's stabilize phase
    pub stage_resolution: u32,
    /// Continuous level fed to the networks
    pub cur_level: f64,
    /// Resolution of the images produced at `cur_level`
    pub cur_resol: u32,
}

impl IterationContext {
    pub fn is_phase_start(&self) -> bool {
        self.iteration == self.range.start
    }

    pub fn is_phase_end(&self) -> bool {
        self.iteration + 1 == self.range.end
    }
}

/// Walks (level, phase, iteration) from the first to the terminal state
#[derive(Debug, Clone)]
pub struct StageSequencer {
    stages: Vec<StagePlan>,
    resume: Option<ResumePoint>,
    initial_nimg: u64,
    stage_idx: usize,
    phase_idx: usize,
    next_it: Option<u64>,
}

impl StageSequencer {
    /// Plan a run from the options and an optional resume point
    pub fn new(options: &Options, batch_sizes: &BatchSizeTable, resume: Option<ResumePoint>) -> Result<Self> {
        let first_level = options.first_level();
        let to_level = options.target_level();

        let from_level = match resume {
            Some(point) => {
                if point.level < 1 || point.level >= to_level {
                    return Err(PgganError::Config(format!(
                        "checkpoint level {} ({}x{}) is outside the run's levels 1..{}",
                        point.level,
                        stage_resolution(point.level),
                        stage_resolution(point.level),
                        to_level - 1
                    )));
                }
                point.level + 1
            }
            None => first_level,
        };

        let mut stages: Vec<StagePlan> = (from_level - 1..to_level)
            .map(|level| StagePlan::nominal(level, options, batch_sizes))
            .collect();

        let mut initial_nimg = 0;
        if let Some(point) = resume {
            initial_nimg = (first_level.saturating_sub(1)..point.level)
                .map(|level| StagePlan::nominal(level, options, batch_sizes).nominal_images())
                .sum();

            let stage = &mut stages[0];
            let range = stage
                .phases
                .iter_mut()
                .find(|r| r.phase == point.phase)
                .ok_or_else(|| PgganError::Config(format!("no {} phase planned", point.phase)))?;
            if point.iteration < range.first {
                return Err(PgganError::Config(format!(
                    "checkpoint iteration {} lies before the {} phase [{}, {}) of level {}",
                    point.iteration, point.phase, range.first, range.end, point.level
                )));
            }
            range.start = point.iteration + 1;
            if point.phase == Phase::FadeIn {
                stage.phases.retain(|r| r.phase != Phase::Stabilize);
            }
            initial_nimg += (point.iteration + 1) * stage.batch_size as u64;
        }

        Ok(Self {
            stages,
            resume,
            initial_nimg,
            stage_idx: 0,
            phase_idx: 0,
            next_it: None,
        })
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.stages
    }

    pub fn resume_point(&self) -> Option<ResumePoint> {
        self.resume
    }

    /// Iterations the whole run will execute
    pub fn total_iterations(&self) -> u64 {
        self.stages.iter().map(StagePlan::iterations).sum()
    }

    /// Training state before the first iteration
    pub fn initial_state(&self) -> TrainingState {
        let level = self.stages.first().map(|s| s.level).unwrap_or(0);
        match self.resume {
            Some(point) => TrainingState {
                level: point.level,
                phase: point.phase,
                cur_nimg: self.initial_nimg,
                iteration: point.iteration,
                restored: true,
            },
            None => TrainingState::fresh(level),
        }
    }

    /// Whether the terminal state has been reached
    pub fn is_finished(&self) -> bool {
        self.stage_idx >= self.stages.len()
    }
}

impl Iterator for StageSequencer {
    type Item = IterationContext;

    fn next(&mut self) -> Option<IterationContext> {
        loop {
            let stage = self.stages.get(self.stage_idx)?;
            let Some(range) = stage.phases.get(self.phase_idx).copied() else {
                self.stage_idx += 1;
                self.phase_idx = 0;
                self.next_it = None;
                continue;
            };

            let it = self.next_it.unwrap_or(range.start);
            if it >= range.end {
                self.phase_idx += 1;
                self.next_it = None;
                continue;
            }
            self.next_it = Some(it + 1);

            let cur_level = range.level_at(stage.level, it);
            return Some(IterationContext {
                level: stage.level,
                phase: range.phase,
                iteration: it,
                range,
                batch_size: stage.batch_size,
                stage_resolution: stage.resolution,
                cur_level,
                cur_resol: cur_resolution(cur_level),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(first: u32, target: u32, train_kimg: f64, transition_kimg: f64) -> Options {
        Options {
            first_resol: first,
            target_resol: target,
            train_kimg,
            transition_kimg,
            ..Options::default()
        }
    }

    fn sequencer(options: &Options, resume: Option<ResumePoint>) -> StageSequencer {
        let table = BatchSizeTable::new(options.target_level() + 1);
        StageSequencer::new(options, &table, resume).unwrap()
    }

    #[test]
    fn test_phase_parsing() {
        assert_eq!("stabilize".parse::<Phase>().unwrap(), Phase::Stabilize);
        assert_eq!("fade_in".parse::<Phase>().unwrap(), Phase::FadeIn);
        assert!("fade-in".parse::<Phase>().is_err());
        assert_eq!(Phase::FadeIn.to_string(), "fade_in");
    }

    #[test]
    fn test_resolution_helpers() {
        assert_eq!(stage_resolution(1), 4);
        assert_eq!(stage_resolution(5), 64);
        assert_eq!(level_of_resolution(64).unwrap(), 5);
        assert!(level_of_resolution(48).is_err());
        assert!(level_of_resolution(2).is_err());

        assert_eq!(cur_resolution(1.0), 4);
        assert_eq!(cur_resolution(1.01), 8);
        assert_eq!(cur_resolution(2.0), 8);
    }

    #[test]
    fn test_fresh_plan_levels_and_ranges() {
        let seq = sequencer(&options(4, 8, 1.0, 1.0), None);
        let stages = seq.stages();
        assert_eq!(stages.len(), 2);

        assert_eq!(stages[0].level, 1);
        assert_eq!(stages[0].resolution, 4);
        assert_eq!(stages[0].batch_size, 32);
        assert_eq!(stages[0].phases[0], PhaseRange::new(Phase::Stabilize, 0, 32));
        assert_eq!(stages[0].phases[1], PhaseRange::new(Phase::FadeIn, 32, 64));

        assert_eq!(stages[1].level, 2);
        assert_eq!(stages[1].resolution, 8);
        assert_eq!(seq.total_iterations(), 128);
        assert_eq!(seq.initial_state(), TrainingState::fresh(1));
    }

    #[test]
    fn test_walk_order_and_levels() {
        let seq = sequencer(&options(4, 8, 1.0, 1.0), None);
        let contexts: Vec<_> = seq.collect();
        assert_eq!(contexts.len(), 128);

        let stabilize_r1 = contexts.iter().filter(|c| c.level == 1 && c.phase == Phase::Stabilize).count();
        let fade_r1 = contexts.iter().filter(|c| c.level == 1 && c.phase == Phase::FadeIn).count();
        assert_eq!(stabilize_r1, 1000usize.div_ceil(32));
        assert_eq!(fade_r1, 1000usize.div_ceil(32));

        // levels and phases only move forward
        for pair in contexts.windows(2) {
            assert!(pair[1].level >= pair[0].level);
            assert!(pair[1].cur_level >= pair[0].cur_level);
        }

        let first = &contexts[0];
        assert_eq!((first.level, first.phase, first.iteration), (1, Phase::Stabilize, 0));
        assert_eq!(first.cur_level, 1.0);
        assert_eq!(first.cur_resol, 4);
        assert!(first.is_phase_start());

        let last_fade = contexts.iter().filter(|c| c.level == 1).last().unwrap();
        assert_eq!(last_fade.iteration, 63);
        assert_eq!(last_fade.cur_level, 2.0);
        assert_eq!(last_fade.cur_resol, 8);
        assert!(last_fade.is_phase_end());

        let terminal = contexts.last().unwrap();
        assert_eq!((terminal.level, terminal.phase), (2, Phase::FadeIn));
        assert_eq!(terminal.cur_resol, 16);
    }

    #[test]
    fn test_fade_in_progress_is_linear() {
        let range = PhaseRange::new(Phase::FadeIn, 10, 20);
        assert!((range.level_at(3, 10) - 3.1).abs() < 1e-12);
        assert!((range.level_at(3, 14) - 3.5).abs() < 1e-12);
        assert_eq!(range.level_at(3, 19), 4.0);

        let stabilize = PhaseRange::new(Phase::Stabilize, 0, 10);
        assert_eq!(stabilize.level_at(3, 7), 3.0);
    }

    #[test]
    fn test_resume_mid_fade_in_skips_stabilize() {
        let opts = options(4, 256, 50.0, 600.0);
        let point = ResumePoint {
            level: level_of_resolution(64).unwrap(),
            phase: Phase::FadeIn,
            iteration: 12000,
        };
        let seq = sequencer(&opts, Some(point));

        let first_stage = &seq.stages()[0];
        assert_eq!(first_stage.resolution, 64);
        assert_eq!(first_stage.phases.len(), 1);
        assert_eq!(first_stage.phases[0].phase, Phase::FadeIn);
        assert_eq!(first_stage.phases[0].start, 12001);
        assert_eq!(first_stage.phases[0].first, 6250);

        let first = seq.clone().next().unwrap();
        assert_eq!((first.level, first.phase, first.iteration), (5, Phase::FadeIn, 12001));

        let state = seq.initial_state();
        assert!(state.restored);
        assert_eq!(state.level, 5);
        assert_eq!(state.iteration, 12000);
    }

    #[test]
    fn test_resume_mid_stabilize_keeps_fade_in() {
        let opts = options(4, 16, 1.0, 1.0);
        let point = ResumePoint {
            level: 2,
            phase: Phase::Stabilize,
            iteration: 9,
        };
        let seq = sequencer(&opts, Some(point));
        let stage = &seq.stages()[0];
        assert_eq!(stage.level, 2);
        assert_eq!(stage.phases[0].start, 10);
        assert_eq!(stage.phases[1], PhaseRange::new(Phase::FadeIn, 32, 64));
        assert_eq!(seq.stages().len(), 2);
    }

    #[test]
    fn test_resume_reconstructs_image_count() {
        let opts = options(4, 16, 1.0, 1.0);
        let point = ResumePoint {
            level: 2,
            phase: Phase::FadeIn,
            iteration: 40,
        };
        let seq = sequencer(&opts, Some(point));
        // level 1 shows 64 batches of 32, level 2 has run iterations 0..=40
        assert_eq!(seq.initial_state().cur_nimg, 64 * 32 + 41 * 32);
    }

    #[test]
    fn test_resume_outside_run_is_rejected() {
        let opts = options(4, 8, 1.0, 1.0);
        let table = BatchSizeTable::new(4);
        let above = ResumePoint {
            level: 3,
            phase: Phase::Stabilize,
            iteration: 0,
        };
        assert!(StageSequencer::new(&opts, &table, Some(above)).is_err());

        let before_fade = ResumePoint {
            level: 1,
            phase: Phase::FadeIn,
            iteration: 3,
        };
        assert!(StageSequencer::new(&opts, &table, Some(before_fade)).is_err());
    }

    #[test]
    fn test_resume_at_phase_end_moves_on() {
        let opts = options(4, 8, 1.0, 1.0);
        let point = ResumePoint {
            level: 1,
            phase: Phase::FadeIn,
            iteration: 63,
        };
        let mut seq = sequencer(&opts, Some(point));
        let next = seq.next().unwrap();
        assert_eq!((next.level, next.phase, next.iteration), (2, Phase::Stabilize, 0));
    }

    #[test]
    fn test_state_advances_by_batch() {
        let mut seq = sequencer(&options(4, 8, 1.0, 1.0), None);
        let mut state = seq.initial_state();
        let ctx = seq.next().unwrap();
        state.enter(&ctx);
        state.advance(ctx.batch_size);
        state.advance(ctx.batch_size);
        assert_eq!(state.cur_nimg, 64);
        assert!((state.kimg() - 0.064).abs() < 1e-12);
    }

    #[test]
    fn test_plan_display() {
        let seq = sequencer(&options(4, 8, 1.0, 1.0), None);
        let line = seq.stages()[0].to_string();
        assert_eq!(line, "R=1 4x4 batch=32 | stabilize [0, 32) | fade_in [32, 64)");
    }
}
