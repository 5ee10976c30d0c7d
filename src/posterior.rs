//! Result objects: posterior draws, per-coordinate summaries and a trustworthiness report.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use serde::Serialize;
use std::fmt;
use tracing::warn;

use crate::context::ParamLayout;
use crate::core::ChainOutput;
use crate::error::{InferenceError, Result};
use crate::stats;

/// Post-warmup draws of every chain, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    names: Vec<String>,
    /// chains x draws x coordinates, constrained.
    draws: Array3<f64>,
    /// Same layout, unconstrained.
    unconstrained: Array3<f64>,
}

impl Posterior {
    /// Collect chain outputs. Chains cut short by a deadline are truncated to the shortest one
    /// so every chain contributes the same number of draws.
    pub fn from_chains(outputs: &[ChainOutput], layout: &ParamLayout) -> Result<Self> {
        let names = layout.coordinate_names();
        let dim = names.len();
        let n_chains = outputs.len();
        let n_draws = outputs.iter().map(|o| o.draws.len()).min().unwrap_or(0);

        let mut unconstrained = Array3::zeros((n_chains, n_draws, dim));
        let mut draws = Array3::zeros((n_chains, n_draws, dim));
        for (c, out) in outputs.iter().enumerate() {
            for (t, z) in out.draws.iter().take(n_draws).enumerate() {
                if z.len() != dim {
                    return Err(InferenceError::malformed(format!(
                        "draw has {} values, layout has {dim}",
                        z.len()
                    )));
                }
                let x = layout.constrain(z);
                if let Some(i) = x.iter().position(|v| !v.is_finite()) {
                    return Err(InferenceError::NonFinitePosterior(format!(
                        "chain {c} draw {t}: `{}` is {}",
                        names[i], x[i]
                    )));
                }
                unconstrained
                    .slice_mut(s![c, t, ..])
                    .assign(&ArrayView1::from(z.as_slice()));
                draws.slice_mut(s![c, t, ..]).assign(&Array1::from(x));
            }
        }
        Ok(Self {
            names,
            draws,
            unconstrained,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_chains(&self) -> usize {
        self.draws.shape()[0]
    }

    pub fn n_draws(&self) -> usize {
        self.draws.shape()[1]
    }

    /// chains x draws x coordinates array of constrained values.
    pub fn values(&self) -> ArrayView3<f64> {
        self.draws.view()
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// chains x draws of one coordinate.
    pub fn chain_draws(&self, name: &str) -> Option<ArrayView2<f64>> {
        self.index(name).map(|i| self.draws.slice(s![.., .., i]))
    }

    /// All draws of one coordinate, chain after chain.
    pub fn draws(&self, name: &str) -> Option<Vec<f64>> {
        self.chain_draws(name).map(|d| d.iter().copied().collect())
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.chain_draws(name).and_then(|d| d.mean())
    }

    /// Every unconstrained draw as a position vector, chain after chain.
    pub fn unconstrained_draws(&self) -> Vec<Vec<f64>> {
        self.unconstrained
            .outer_iter()
            .flat_map(|chain| {
                chain
                    .outer_iter()
                    .map(|d| d.to_vec())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn summarize(&self) -> Vec<ParamSummary> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| ParamSummary::new(name, self.draws.slice(s![.., .., i])))
            .collect()
    }
}

/// One row of the summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub q5: f64,
    pub q95: f64,
    pub ess: f64,
    pub rhat: f64,
}

impl ParamSummary {
    /// Summary of chains x draws values.
    pub fn new(name: &str, draws: ArrayView2<f64>) -> Self {
        let n = draws.len() as f64;
        let mean = draws.mean().unwrap_or(f64::NAN);
        let std = if n > 1.0 {
            (draws.mapv(|x| (x - mean).powi(2)).sum() / (n - 1.0)).sqrt()
        } else {
            f64::NAN
        };
        let sorted = stats::sorted(draws.iter().copied());
        Self {
            name: name.to_string(),
            mean,
            std,
            median: stats::quantile(&sorted, 0.5),
            q5: stats::quantile(&sorted, 0.05),
            q95: stats::quantile(&sorted, 0.95),
            ess: stats::ess(draws),
            rhat: stats::split_rhat(draws),
        }
    }
}

/// Counters of one chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainDiagnostics {
    pub draws: usize,
    pub accept_rate: f64,
    pub step_size: f64,
    pub divergences: usize,
    pub warmup_divergences: usize,
    pub invalid: usize,
    pub timed_out: bool,
}

impl From<&ChainOutput> for ChainDiagnostics {
    fn from(out: &ChainOutput) -> Self {
        Self {
            draws: out.draws.len(),
            accept_rate: out.accept_rate(),
            step_size: out.step_size,
            divergences: out.divergences,
            warmup_divergences: out.warmup_divergences,
            invalid: out.invalid,
            timed_out: out.timed_out,
        }
    }
}

/// Whether a run can be trusted. Flagged runs still carry their draws.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustReport {
    /// (divergent + invalid iterations) / sampling iterations.
    pub bad_fraction: f64,
    pub flagged: bool,
    pub reasons: Vec<String>,
}

impl TrustReport {
    pub fn assess(chains: &[ChainDiagnostics], max_bad_fraction: f64) -> Self {
        let iterations: usize = chains.iter().map(|c| c.draws).sum();
        let bad: usize = chains.iter().map(|c| c.divergences + c.invalid).sum();
        let bad_fraction = if iterations == 0 {
            0.0
        } else {
            bad as f64 / iterations as f64
        };

        let mut reasons = Vec::new();
        if bad_fraction > max_bad_fraction {
            reasons.push(format!(
                "{bad} of {iterations} iterations divergent or rejected as invalid \
                 ({:.1}% > {:.1}%)",
                100.0 * bad_fraction,
                100.0 * max_bad_fraction
            ));
        }
        let timed_out = chains.iter().filter(|c| c.timed_out).count();
        if timed_out > 0 {
            reasons.push(format!("{timed_out} chain(s) stopped at the deadline"));
        }
        let report = Self {
            bad_fraction,
            flagged: !reasons.is_empty(),
            reasons,
        };
        if report.flagged {
            warn!(reasons = ?report.reasons, "low trustworthiness");
        }
        report
    }
}

/// Everything a sampling run returns.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub posterior: Posterior,
    pub summary: Vec<ParamSummary>,
    /// Post-warmup divergences over all chains.
    pub divergence_count: usize,
    pub chains: Vec<ChainDiagnostics>,
    pub trust: TrustReport,
    pub timed_out: bool,
}

impl InferenceResult {
    pub fn from_chains(
        outputs: &[ChainOutput],
        layout: &ParamLayout,
        max_bad_fraction: f64,
    ) -> Result<Self> {
        let posterior = Posterior::from_chains(outputs, layout)?;
        let chains: Vec<ChainDiagnostics> = outputs.iter().map(ChainDiagnostics::from).collect();
        let trust = TrustReport::assess(&chains, max_bad_fraction);
        Ok(Self {
            summary: posterior.summarize(),
            divergence_count: chains.iter().map(|c| c.divergences).sum(),
            timed_out: chains.iter().any(|c| c.timed_out),
            posterior,
            chains,
            trust,
        })
    }

    pub fn summary_for(&self, name: &str) -> Option<&ParamSummary> {
        self.summary.iter().find(|s| s.name == name)
    }

    pub fn draws(&self, name: &str) -> Option<Vec<f64>> {
        self.posterior.draws(name)
    }

    pub fn is_trustworthy(&self) -> bool {
        !self.trust.flagged
    }

    /// Largest split R-hat over coordinates, ignoring undefined ones.
    pub fn max_rhat(&self) -> f64 {
        let rhats = Array1::from_iter(self.summary.iter().map(|s| s.rhat));
        rhats.max_skipnan().to_owned()
    }

    pub fn min_ess(&self) -> f64 {
        self.summary
            .iter()
            .map(|s| s.ess)
            .filter(|e| !e.is_nan())
            .fold(f64::INFINITY, f64::min)
    }
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>7}",
            "", "mean", "std", "median", "5%", "95%", "n_eff", "r_hat"
        )?;
        for s in &self.summary {
            writeln!(
                f,
                "{:>12} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.1} {:>7.3}",
                s.name, s.mean, s.std, s.median, s.q5, s.q95, s.ess, s.rhat
            )?;
        }
        write!(f, "divergences: {}", self.divergence_count)?;
        if self.trust.flagged {
            write!(f, "\nWARNING: {}", self.trust.reasons.join("; "))?;
        }
        Ok(())
    }
}
