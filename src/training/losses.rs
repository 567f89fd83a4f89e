//! Adversarial loss functions for PGGAN training
//!
//! Three loss families are supported: least-squares, non-saturating log-loss
//! and Wasserstein. Each is written once against [`ScoreOps`], so the same
//! formulas drive autograd tensors during training and plain arrays in tests.

use std::ops::{Add, Mul};

use ndarray::Array1;

use crate::error::{PgganError, Result};
use crate::utils::{GanKind, Options};

/// Epsilon inside the logarithms of the non-saturating loss
pub const LOG_EPSILON: f64 = 1e-8;

/// A scalar loss value, possibly carrying an autograd graph
pub trait LossScalar:
    Sized + Add<Output = Self> + Add<f64, Output = Self> + Mul<f64, Output = Self>
{
    /// Plain value of the loss
    fn value(&self) -> f64;
}

impl LossScalar for f64 {
    fn value(&self) -> f64 {
        *self
    }
}

/// Reductions over a batch of discriminator scores
pub trait ScoreOps {
    type Loss: LossScalar;

    /// mean(p)
    fn mean_score(&self) -> Self::Loss;

    /// mean((p - target)^2)
    fn mean_squared_error(&self, target: f64) -> Self::Loss;

    /// mean(log(p + eps))
    fn mean_log(&self, eps: f64) -> Self::Loss;

    /// mean(log(1 - p + eps))
    fn mean_log_complement(&self, eps: f64) -> Self::Loss;

    /// Detached mean score
    fn mean_value(&self) -> f64 {
        self.mean_score().value()
    }
}

impl ScoreOps for Array1<f64> {
    type Loss = f64;

    fn mean_score(&self) -> f64 {
        self.mean().unwrap_or(f64::NAN)
    }

    fn mean_squared_error(&self, target: f64) -> f64 {
        self.mapv(|p| (p - target).powi(2)).mean().unwrap_or(f64::NAN)
    }

    fn mean_log(&self, eps: f64) -> f64 {
        self.mapv(|p| (p + eps).ln()).mean().unwrap_or(f64::NAN)
    }

    fn mean_log_complement(&self, eps: f64) -> f64 {
        self.mapv(|p| (1.0 - p + eps).ln()).mean().unwrap_or(f64::NAN)
    }
}

/// Loss values of one generator update
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeneratorTerms {
    pub loss: f64,
    pub adv: f64,
    pub add: f64,
}

/// Loss values of one discriminator update
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscriminatorTerms {
    pub loss: f64,
    pub adv: f64,
    pub add: f64,
    pub adv_real: f64,
    pub adv_fake: f64,
}

/// All loss values of one iteration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    pub generator: GeneratorTerms,
    pub discriminator: DiscriminatorTerms,
}

impl LossTerms {
    /// Named scalars for summaries
    pub fn scalars(&self) -> [(&'static str, f64); 8] {
        [
            ("G_loss", self.generator.loss),
            ("G_adv_loss", self.generator.adv),
            ("G_add_loss", self.generator.add),
            ("D_loss", self.discriminator.loss),
            ("D_adv_loss", self.discriminator.adv),
            ("D_add_loss", self.discriminator.add),
            ("D_adv_loss_fake", self.discriminator.adv_fake),
            ("D_adv_loss_real", self.discriminator.adv_real),
        ]
    }

    /// Fail on the first NaN or infinite term
    pub fn ensure_finite(&self) -> Result<()> {
        match self.scalars().iter().find(|(_, v)| !v.is_finite()) {
            Some((name, v)) => Err(PgganError::Numeric(format!("{} is {}", name, v))),
            None => Ok(()),
        }
    }
}

/// Adversarial loss selected at configuration time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossPolicy {
    /// mean((p - t)^2), sigmoid applied by the discriminator
    LeastSquares { fake_weight: f64 },
    /// -w * (mean(t log(p + eps)) + mean((1 - t) log(1 - p + eps)))
    NonSaturating { fake_weight: f64, epsilon: f64 },
    /// (-2t + 1) * mean(p)
    Wasserstein { fake_weight: f64 },
}

impl LossPolicy {
    pub fn new(kind: GanKind, fake_weight: f64) -> Self {
        match kind {
            GanKind::Lsgan => LossPolicy::LeastSquares { fake_weight },
            GanKind::Gan => LossPolicy::NonSaturating {
                fake_weight,
                epsilon: LOG_EPSILON,
            },
            GanKind::WganGp => LossPolicy::Wasserstein { fake_weight },
        }
    }

    pub fn from_options(options: &Options) -> Self {
        Self::new(options.gan, options.fake_weight)
    }

    pub fn fake_weight(&self) -> f64 {
        match *self {
            LossPolicy::LeastSquares { fake_weight }
            | LossPolicy::NonSaturating { fake_weight, .. }
            | LossPolicy::Wasserstein { fake_weight } => fake_weight,
        }
    }

    /// Adversarial loss of `prediction` against a real (1) or fake (0) target
    pub fn adversarial<S: ScoreOps>(&self, prediction: &S, target_is_real: bool, weight: f64) -> S::Loss {
        let target = if target_is_real { 1.0 } else { 0.0 };
        match *self {
            LossPolicy::LeastSquares { .. } => prediction.mean_squared_error(target),
            LossPolicy::NonSaturating { epsilon, .. } => {
                // the term multiplied by a zero target is dropped
                let log_likelihood = if target_is_real {
                    prediction.mean_log(epsilon)
                } else {
                    prediction.mean_log_complement(epsilon)
                };
                log_likelihood * -weight
            }
            LossPolicy::Wasserstein { .. } => prediction.mean_score() * (-2.0 * target + 1.0),
        }
    }

    /// Extra generator term, zero for every family
    pub fn additional_generator_loss(&self) -> f64 {
        0.0
    }

    /// Extra discriminator term.
    ///
    /// This is where a drift penalty and the WGAN gradient penalty plug in;
    /// both are currently zero.
    pub fn additional_discriminator_loss(&self) -> f64 {
        0.0
    }

    /// Generator loss on discriminator scores of non-detached fakes
    pub fn generator_loss<S: ScoreOps>(&self, d_fake: &S) -> (S::Loss, GeneratorTerms) {
        let adv = self.adversarial(d_fake, true, 1.0);
        let add = self.additional_generator_loss();
        let adv_value = adv.value();
        let loss = adv + add;
        let terms = GeneratorTerms {
            loss: loss.value(),
            adv: adv_value,
            add,
        };
        (loss, terms)
    }

    /// Discriminator loss on real scores and detached-fake scores
    pub fn discriminator_loss<S: ScoreOps>(&self, d_real: &S, d_fake: &S) -> (S::Loss, DiscriminatorTerms) {
        let real = self.adversarial(d_real, true, 0.5);
        let fake = self.adversarial(d_fake, false, 0.5) * self.fake_weight();
        let (adv_real, adv_fake) = (real.value(), fake.value());

        let adv = real + fake;
        let adv_value = adv.value();
        let add = self.additional_discriminator_loss();
        let loss = adv + add;
        let terms = DiscriminatorTerms {
            loss: loss.value(),
            adv: adv_value,
            add,
            adv_real,
            adv_fake,
        };
        (loss, terms)
    }
}
