//! Progressive GAN training loop
//!
//! Drives the stage sequencer and, for every iteration, performs one
//! discriminator update followed by one generator update. Samples, summaries
//! and checkpoints are written on their configured frequencies and at the
//! last iteration of every phase.

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::losses::{LossPolicy, LossTerms, ScoreOps};
use super::metrics::{IterationRecord, RollingStats, TrainingMetrics};
use super::report::{parameter_tag, tag_prefix, JsonlReporter, MultiReporter, Reporter, TracingReporter};
use super::schedule::{LearningRates, NoiseInjector, ScheduleController};
use super::sequencer::{IterationContext, ResumePoint, StageSequencer, TrainingState};
use crate::data::{DataSource, NoiseSource};
use crate::error::{PgganError, Result};
use crate::model::{Discriminator, Generator, ImageBatch, Trainable};
use crate::utils::checkpoint::{CheckpointManager, CheckpointMeta, CheckpointTag, RunLayout};
use crate::utils::grid::save_sample_grid;
use crate::utils::Options;

/// Window of the loss statistics used for divergence warnings
const STATS_WINDOW: usize = 100;

/// Outputs of one training step
pub struct StepOutput<I> {
    pub terms: LossTerms,
    pub rates: LearningRates,
    pub noise_strength: f64,
    pub real_mean: f64,
    pub fake: I,
    pub real: I,
}

/// How a call to [`Trainer::train`] ended
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Iterations executed by this call
    pub iterations: u64,
    pub state: TrainingState,
    /// Whether training stopped early on request
    pub stopped: bool,
    pub last_checkpoint: Option<CheckpointTag>,
}

/// Progressive GAN trainer
pub struct Trainer<G, D, N, S>
where
    G: Generator,
    D: Discriminator<G::Images, Loss = G::Loss>,
    N: NoiseSource<Latent = G::Latent>,
    S: DataSource<Images = G::Images>,
{
    options: Options,
    generator: G,
    discriminator: D,
    noise: N,
    data: S,
    schedule: ScheduleController,
    losses: LossPolicy,
    injector: NoiseInjector,
    sequencer: StageSequencer,
    state: TrainingState,
    layout: RunLayout,
    checkpoints: CheckpointManager,
    metrics: TrainingMetrics,
    reporter: Box<dyn Reporter>,
    last_real_mean: Option<f64>,
    last_checkpoint: Option<CheckpointTag>,
    d_loss_stats: RollingStats,
    stop: Arc<AtomicBool>,
    show_progress: bool,
}

impl<G, D, N, S> Trainer<G, D, N, S>
where
    G: Generator,
    D: Discriminator<G::Images, Loss = G::Loss>,
    N: NoiseSource<Latent = G::Latent>,
    S: DataSource<Images = G::Images>,
{
    /// Set up a run: validate options, create or reopen the run directory,
    /// restore a checkpoint when requested and plan the curriculum.
    ///
    /// Every configuration and resume error surfaces here, before any
    /// training step.
    pub fn new(options: Options, mut generator: G, mut discriminator: D, noise: N, data: S) -> Result<Self> {
        options.validate()?;

        let schedule = ScheduleController::new(&options);
        let mut injector = NoiseInjector::new(options.no_noise);
        let mut last_real_mean = None;

        let (layout, resume) = match options.resume_target() {
            Some((dir, which_file)) => {
                let tag: CheckpointTag = which_file.parse()?;
                let layout = RunLayout::resume(dir)?;
                let meta = layout
                    .checkpoints()
                    .restore(&mut generator, &mut discriminator, &tag, options.gan)?;
                injector.restore(meta.d_ema);
                last_real_mean = meta.last_real_mean;
                (layout, Some(meta))
            }
            None => (RunLayout::fresh(&options.exp_dir)?, None),
        };

        let resume_point: Option<ResumePoint> = resume.as_ref().map(CheckpointMeta::resume_point);
        let sequencer = StageSequencer::new(&options, schedule.batch_sizes(), resume_point)?;
        let state = sequencer.initial_state();
        if let Some(meta) = &resume {
            if meta.cur_nimg != 0 && meta.cur_nimg != state.cur_nimg {
                warn!(
                    "Checkpoint recorded {} images, schedule reconstructs {}; using the reconstruction",
                    meta.cur_nimg, state.cur_nimg
                );
            }
        }

        let options_path = layout.save_options(&options, schedule.batch_sizes())?;
        info!("Saved options to {}", options_path.display());

        let metrics = TrainingMetrics::with_csv(layout.metrics_path(), STATS_WINDOW)?;
        let reporter = MultiReporter::new()
            .with(TracingReporter)
            .with(JsonlReporter::create(layout.events_path())?);

        Ok(Self {
            checkpoints: layout.checkpoints(),
            losses: LossPolicy::from_options(&options),
            options,
            generator,
            discriminator,
            noise,
            data,
            schedule,
            injector,
            sequencer,
            state,
            layout,
            metrics,
            reporter: Box::new(reporter),
            last_real_mean,
            last_checkpoint: None,
            d_loss_stats: RollingStats::new(STATS_WINDOW),
            stop: Arc::new(AtomicBool::new(false)),
            show_progress: true,
        })
    }

    /// Replace the summary sink
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Enable or disable per-phase progress bars
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Share an externally owned stop flag
    pub fn with_stop_handle(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Handle that stops training after the current iteration when set
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn sequencer(&self) -> &StageSequencer {
        &self.sequencer
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn noise_injector(&self) -> &NoiseInjector {
        &self.injector
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    /// Run the remaining curriculum
    pub fn train(&mut self) -> Result<TrainingSummary> {
        for stage in self.sequencer.stages() {
            info!("{}", stage);
        }
        info!(
            "Training {} iterations from {:.1} kimg{}",
            self.sequencer.total_iterations(),
            self.state.kimg(),
            if self.state.restored { " (restored)" } else { "" }
        );

        let mut iterations = 0u64;
        let mut bar = ProgressBar::hidden();

        while let Some(ctx) = self.sequencer.next() {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested at {} iteration {}", ctx.phase, ctx.iteration);
                if iterations > 0 {
                    self.checkpoint()?;
                }
                return self.finish(iterations, true);
            }

            if ctx.is_phase_start() {
                bar = self.progress_bar(&ctx);
                info!(
                    "Level {} ({}x{}), {} phase, iterations [{}, {}), batch size {}",
                    ctx.level,
                    ctx.stage_resolution,
                    ctx.stage_resolution,
                    ctx.phase,
                    ctx.range.start,
                    ctx.range.end,
                    ctx.batch_size
                );
            }

            self.state.enter(&ctx);
            let output = self.train_step(&ctx)?;
            iterations += 1;
            self.record(&ctx, &output)?;

            let last = ctx.is_phase_end();
            if ctx.iteration % self.options.sample_freq == 0 || last {
                self.sample(&ctx, &output)?;
                self.summaries(&ctx, &output.terms)?;
            }
            if (ctx.iteration % self.options.save_freq == 0 && ctx.iteration > 0) || last {
                self.checkpoint()?;
            }

            bar.set_message(format!(
                "G: {:.4}, D: {:.4}",
                output.terms.generator.loss, output.terms.discriminator.loss
            ));
            bar.inc(1);
            if last {
                bar.finish_with_message("done");
            }
        }

        info!("Training finished at {:.1} kimg", self.state.kimg());
        self.finish(iterations, false)
    }

    fn finish(&mut self, iterations: u64, stopped: bool) -> Result<TrainingSummary> {
        self.metrics.flush()?;
        self.reporter.flush()?;
        Ok(TrainingSummary {
            iterations,
            state: self.state.clone(),
            stopped,
            last_checkpoint: self.last_checkpoint,
        })
    }

    fn progress_bar(&self, ctx: &IterationContext) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(ctx.range.len());
        let style = ProgressStyle::with_template("[{elapsed_precise}] {prefix} {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.set_prefix(format!("{}x{} {}", ctx.stage_resolution, ctx.stage_resolution, ctx.phase));
        bar
    }

    /// One discriminator update followed by one generator update
    pub fn train_step(&mut self, ctx: &IterationContext) -> Result<StepOutput<G::Images>> {
        let batch_size = ctx.batch_size;
        let z = self.noise.sample(batch_size)?;
        let real = self.data.sample(batch_size, ctx.cur_resol, ctx.cur_level)?;

        let rates = self.schedule.learning_rates(self.state.cur_nimg)?;
        self.generator.set_learning_rate(rates.generator);
        self.discriminator.set_learning_rate(rates.discriminator);

        // discriminator
        self.discriminator.zero_grad();
        let fake = self.generator.forward(&z, ctx.cur_level)?;
        let noise_strength = self.injector.next_strength(self.last_real_mean);
        let d_real = self.discriminator.forward(&real, ctx.cur_level, noise_strength)?;
        let d_fake = self.discriminator.forward(&fake.detach(), ctx.cur_level, 0.0)?;

        let real_mean = d_real.mean_value();
        self.last_real_mean = Some(real_mean);

        let (d_loss, d_terms) = self.losses.discriminator_loss(&d_real, &d_fake);
        ensure_finite("D_loss", d_terms.loss, ctx)?;
        self.discriminator.backward_step(&d_loss)?;

        // generator, scored on the same fakes without detaching
        self.generator.zero_grad();
        let d_fake = self.discriminator.forward(&fake, ctx.cur_level, 0.0)?;
        let (g_loss, g_terms) = self.losses.generator_loss(&d_fake);
        ensure_finite("G_loss", g_terms.loss, ctx)?;
        self.generator.backward_step(&g_loss)?;

        self.state.advance(batch_size);

        let terms = LossTerms {
            generator: g_terms,
            discriminator: d_terms,
        };
        terms.ensure_finite()?;

        debug!(
            "Iter[{}|{}], {}, {}, G: {:.3}, D: {:.3}, G_adv: {:.3}, G_add: {:.3}, D_adv: {:.3}, D_add: {:.3}",
            ctx.iteration,
            ctx.range.end,
            ctx.phase,
            ctx.cur_resol,
            g_terms.loss,
            d_terms.loss,
            g_terms.adv,
            g_terms.add,
            d_terms.adv,
            d_terms.add
        );

        Ok(StepOutput {
            terms,
            rates,
            noise_strength,
            real_mean,
            fake,
            real,
        })
    }

    fn record(&mut self, ctx: &IterationContext, output: &StepOutput<G::Images>) -> Result<()> {
        let d_loss = output.terms.discriminator.loss;
        if self.d_loss_stats.is_spike(d_loss, 6.0) {
            warn!(
                "D loss spiked to {:.4} at {} iteration {} (window mean {:.4})",
                d_loss,
                ctx.phase,
                ctx.iteration,
                self.d_loss_stats.mean()
            );
        }
        self.d_loss_stats.push(d_loss);

        self.metrics.record(IterationRecord {
            level: ctx.level,
            phase: ctx.phase,
            iteration: ctx.iteration,
            cur_level: ctx.cur_level,
            resolution: ctx.cur_resol,
            cur_nimg: self.state.cur_nimg,
            g_loss: output.terms.generator.loss,
            d_loss,
            d_real_mean: output.real_mean,
            noise_strength: output.noise_strength,
            g_lr: output.rates.generator,
            d_lr: output.rates.discriminator,
        })
    }

    /// Path of the sample grid for an iteration
    pub fn sample_path(&self, ctx: &IterationContext) -> PathBuf {
        self.layout.samples.join(format!(
            "{}x{}-{}-{:06}.png",
            ctx.cur_resol, ctx.cur_resol, ctx.phase, ctx.iteration
        ))
    }

    /// Write the sample grid; a batch with zero dynamic range aborts the run
    fn sample(&mut self, ctx: &IterationContext, output: &StepOutput<G::Images>) -> Result<()> {
        let path = self.sample_path(ctx);
        let fake = output.fake.to_array()?;
        let real = output.real.to_array()?;
        save_sample_grid(&fake, &real, &path)?;

        info!(
            "[{:.1} kimg] {} iteration {}: G {:.4}, D {:.4}, lr x{:.4}, noise {:.4}",
            self.state.kimg(),
            ctx.phase,
            ctx.iteration,
            output.terms.generator.loss,
            output.terms.discriminator.loss,
            output.rates.multiplier,
            output.noise_strength
        );
        Ok(())
    }

    fn summaries(&mut self, ctx: &IterationContext, terms: &LossTerms) -> Result<()> {
        let prefix = tag_prefix(ctx.cur_resol, ctx.phase);
        let step = ctx.iteration;

        for (name, value) in terms.scalars() {
            self.reporter.scalar(&format!("{}{}", prefix, name), value, step)?;
        }

        let networks = [
            ("G", self.generator.parameters()?),
            ("D", self.discriminator.parameters()?),
        ];
        for (network, params) in networks {
            for param in params {
                let tag = parameter_tag(network, &prefix, &param.name);
                self.reporter.histogram(&tag, &param.values, step)?;
                if let Some(grad) = &param.grad {
                    self.reporter.histogram(&format!("{}/grad", tag), grad, step)?;
                }
            }
        }

        if self.metrics.check_mode_collapse(STATS_WINDOW) {
            warn!("Discriminator loss has collapsed while generator loss stays high; the run may have diverged");
        }
        Ok(())
    }

    /// Save both networks and the state of the last finished iteration
    pub fn checkpoint(&mut self) -> Result<CheckpointTag> {
        let tag = CheckpointTag::for_state(&self.state);
        if self.last_checkpoint == Some(tag) {
            return Ok(tag);
        }

        let meta = CheckpointMeta {
            tag: tag.to_string(),
            level: self.state.level,
            phase: self.state.phase,
            iteration: self.state.iteration,
            cur_nimg: self.state.cur_nimg,
            cur_level: self.metrics.latest().map_or(self.state.level as f64, |r| r.cur_level),
            gan: self.options.gan,
            d_ema: self.injector.d_ema(),
            last_real_mean: self.last_real_mean,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.checkpoints
            .save(&self.generator, &self.discriminator, &tag, &meta)?;
        self.metrics.flush()?;
        self.last_checkpoint = Some(tag);
        Ok(tag)
    }
}

fn ensure_finite(name: &str, value: f64, ctx: &IterationContext) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PgganError::Numeric(format!(
            "{} is {} at {} iteration {} of level {}",
            name, value, ctx.phase, ctx.iteration, ctx.level
        )))
    }
}
