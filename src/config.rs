//! Inference configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::time::{Duration, Instant};

use burn::tensor::backend::AutodiffBackend;

use crate::advi::Advi;
use crate::approximation::{Approximation, Approximator};
use crate::context::Model;
use crate::error::{InferenceError, Result};
use crate::laplace::Laplace;
use crate::nuts::NutsOptions;
use crate::DefaultBackend;

/// Posterior approximation used for inner fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApproximationFamily {
    /// Diagonal-covariance normal fitted by ADVI.
    MeanField,
    /// Dense-covariance normal fitted by ADVI.
    FullRank,
    #[default]
    Laplace,
}

impl ApproximationFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApproximationFamily::MeanField => "mean-field",
            ApproximationFamily::FullRank => "full-rank",
            ApproximationFamily::Laplace => "laplace",
        }
    }
}

impl fmt::Display for ApproximationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApproximationFamily {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean-field" => Ok(ApproximationFamily::MeanField),
            "full-rank" => Ok(ApproximationFamily::FullRank),
            "laplace" => Ok(ApproximationFamily::Laplace),
            other => Err(InferenceError::InvalidConfig(format!(
                "unknown approximation family `{other}` (expected mean-field, full-rank or laplace)"
            ))),
        }
    }
}

/// Options recognised by every entry point. Missing fields take their defaults when
/// deserialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Warm-up (adaptation) iterations per chain, discarded.
    pub warmup: usize,
    /// Post-warmup draws per chain.
    pub samples: usize,
    pub chains: usize,
    /// NUTS step-size adaptation target, in (0, 1).
    pub target_accept_prob: f64,
    pub approximation_family: ApproximationFamily,
    /// Budget of the Laplace optimizer and the variational loop.
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    /// Chain `i` is seeded with `seed + i`.
    pub seed: u64,
    pub max_tree_depth: usize,
    /// Wall-clock budget of a whole run.
    pub max_duration: Option<Duration>,
    /// Runs with more divergent or invalid iterations than this are flagged.
    pub max_bad_fraction: f64,
    /// Monte Carlo draws per variational gradient.
    pub variational_draws: usize,
    /// Adam learning rate of the variational loop.
    pub learning_rate: f64,
    /// Show one progress bar per chain.
    pub progress: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            warmup: 1_000,
            samples: 1_000,
            chains: 4,
            target_accept_prob: 0.8,
            approximation_family: ApproximationFamily::Laplace,
            max_iterations: 1_000,
            convergence_tolerance: 1e-8,
            seed: 0,
            max_tree_depth: 10,
            max_duration: None,
            max_bad_fraction: 0.05,
            variational_draws: 4,
            learning_rate: 0.05,
            progress: false,
        }
    }
}

impl InferenceConfig {
    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_chains(mut self, chains: usize) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_target_accept_prob(mut self, p: f64) -> Self {
        self.target_accept_prob = p;
        self
    }

    pub fn with_approximation_family(mut self, family: ApproximationFamily) -> Self {
        self.approximation_family = family;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence_tolerance(mut self, tolerance: f64) -> Self {
        self.convergence_tolerance = tolerance;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_tree_depth(mut self, depth: usize) -> Self {
        self.max_tree_depth = depth;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_max_bad_fraction(mut self, fraction: f64) -> Self {
        self.max_bad_fraction = fraction;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(InferenceError::InvalidConfig(msg));
        if self.samples == 0 {
            return fail("samples must be positive".into());
        }
        if self.chains == 0 {
            return fail("chains must be positive".into());
        }
        if !(self.target_accept_prob > 0.0 && self.target_accept_prob < 1.0) {
            return fail(format!(
                "target_accept_prob must lie in (0, 1), got {}",
                self.target_accept_prob
            ));
        }
        if self.max_iterations == 0 {
            return fail("max_iterations must be positive".into());
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance > 0.0) {
            return fail(format!(
                "convergence_tolerance must be positive, got {}",
                self.convergence_tolerance
            ));
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > 30 {
            return fail(format!(
                "max_tree_depth must lie in 1..=30, got {}",
                self.max_tree_depth
            ));
        }
        if !(0.0..=1.0).contains(&self.max_bad_fraction) {
            return fail(format!(
                "max_bad_fraction must lie in [0, 1], got {}",
                self.max_bad_fraction
            ));
        }
        if self.variational_draws == 0 {
            return fail("variational_draws must be positive".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        Ok(())
    }

    /// Deadline of a run starting now.
    pub fn deadline(&self) -> Option<Instant> {
        self.max_duration.map(|d| Instant::now() + d)
    }

    pub fn nuts_options(&self) -> NutsOptions {
        NutsOptions {
            target_accept: self.target_accept_prob,
            max_depth: self.max_tree_depth,
            ..NutsOptions::default()
        }
    }

    /// The approximator selected by `approximation_family`.
    pub fn approximator<B: AutodiffBackend>(&self) -> ConfiguredApproximator<B> {
        ConfiguredApproximator {
            family: self.approximation_family,
            max_iterations: self.max_iterations,
            tolerance: self.convergence_tolerance,
            variational_draws: self.variational_draws,
            learning_rate: self.learning_rate,
            seed: self.seed,
            _backend: PhantomData,
        }
    }
}

/// Laplace or variational fits chosen at run time.
#[derive(Debug, Clone)]
pub struct ConfiguredApproximator<B = DefaultBackend> {
    pub family: ApproximationFamily,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub variational_draws: usize,
    pub learning_rate: f64,
    pub seed: u64,
    _backend: PhantomData<fn() -> B>,
}

impl<B: AutodiffBackend> ConfiguredApproximator<B> {
    fn advi(&self, advi: Advi<B>) -> Advi<B> {
        advi.with_iterations(self.max_iterations)
            .with_draws(self.variational_draws)
            .with_learning_rate(self.learning_rate)
            .set_seed(self.seed)
    }
}

impl<B: AutodiffBackend> Approximator for ConfiguredApproximator<B> {
    fn fit<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<Approximation> {
        match self.family {
            ApproximationFamily::Laplace => {
                Laplace::<B>::new(self.max_iterations, self.tolerance).fit(model, params, data)
            }
            ApproximationFamily::MeanField => {
                self.advi(Advi::mean_field()).fit(model, params, data)
            }
            ApproximationFamily::FullRank => self.advi(Advi::full_rank()).fit(model, params, data),
        }
    }
}
