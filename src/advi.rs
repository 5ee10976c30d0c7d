/*!
Stochastic variational approximation (ADVI).

Fits a normal distribution in unconstrained space by stochastic gradient ascent on the
evidence lower bound, with Adam as the optimizer. Gradients use the reparameterization
`z = μ + L ε`, `ε ~ N(0, I)`:

- **mean-field**: `L = diag(exp(ω))`, parameters `[μ, ω]`;
- **full-rank**: `L` lower triangular with diagonal `exp(ℓ_ii)`, parameters
  `[μ, ℓ_ii, L_ij (i > j)]`.

The loop runs for a fixed number of iterations. The loss trace (`-ELBO` estimates) is a
diagnostic only; nothing checks it for convergence.
*/

use burn::tensor::backend::AutodiffBackend;
use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{debug, warn};

use crate::approximation::{Approximation, ApproximationKind, Approximator};
use crate::context::{Model, ParamLayout};
use crate::error::Result;
use crate::optim::Adam;
use crate::target::{GradientTarget, ModelDensity};
use crate::DefaultBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariationalFamily {
    MeanField,
    FullRank,
}

/// Result of a variational fit with its diagnostics.
#[derive(Debug, Clone)]
pub struct VariationalFit {
    pub approximation: Approximation,
    /// `-ELBO` estimate per iteration.
    pub loss_trace: Vec<f64>,
    /// Draws whose log-density could not be evaluated.
    pub skipped: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct Advi<B = DefaultBackend> {
    pub family: VariationalFamily,
    pub iterations: usize,
    /// Monte Carlo draws per gradient estimate.
    pub draws: usize,
    pub learning_rate: f64,
    /// Initial standard deviation of every coordinate.
    pub init_scale: f64,
    pub seed: u64,
    pub deadline: Option<Instant>,
    _backend: PhantomData<fn() -> B>,
}

impl<B> Advi<B> {
    pub fn new(family: VariationalFamily) -> Self {
        Self {
            family,
            iterations: 2_000,
            draws: 4,
            learning_rate: 0.05,
            init_scale: 0.1,
            seed: 0,
            deadline: None,
            _backend: PhantomData,
        }
    }

    pub fn mean_field() -> Self {
        Self::new(VariationalFamily::MeanField)
    }

    pub fn full_rank() -> Self {
        Self::new(VariationalFamily::FullRank)
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_draws(mut self, draws: usize) -> Self {
        self.draws = draws.max(1);
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Fit to any differentiable target over the given layout.
    pub fn fit_target<T: GradientTarget>(
        &self,
        target: &T,
        layout: ParamLayout,
    ) -> Result<VariationalFit> {
        let n = target.dim();
        let mut q = Guide::new(self.family, n, self.init_scale.ln());
        let mut adam = Adam::new(self.learning_rate);
        let mut rng = SmallRng::seed_from_u64(self.seed);

        let mut loss_trace = Vec::with_capacity(self.iterations);
        let mut skipped = 0;
        let mut timed_out = false;
        let mut eps = vec![0.0; n];
        let mut z = vec![0.0; n];
        let mut g = vec![0.0; n];
        let mut grad = vec![0.0; q.params.len()];

        for it in 0..self.iterations {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(iteration = it, "variational fit timed out");
                timed_out = true;
                break;
            }
            grad.fill(0.0);
            let mut elbo = 0.0;
            let mut used = 0;
            for _ in 0..self.draws {
                eps.iter_mut()
                    .for_each(|e| *e = rng.sample::<f64, _>(StandardNormal));
                q.transform(&eps, &mut z);
                match target.unnorm_logp_and_grad(&z, &mut g) {
                    Ok(lp) => {
                        elbo += lp;
                        q.accumulate_grad(&eps, &g, &mut grad);
                        used += 1;
                    }
                    Err(e) if e.is_recoverable() => skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            if used == 0 {
                continue;
            }
            let scale = 1.0 / used as f64;
            let entropy = q.entropy();
            q.add_entropy_grad(&mut grad, used as f64);
            // Adam descends; the loss is -ELBO.
            grad.iter_mut().for_each(|v| *v *= -scale);
            adam.step(&mut q.params, &grad);

            let loss = -(elbo * scale + entropy);
            loss_trace.push(loss);
            if it % 500 == 0 {
                debug!(iteration = it, loss, "variational step");
            }
        }

        if skipped > 0 {
            debug!(skipped, "variational draws with undefined log-density");
        }
        let approximation = q.into_approximation(layout)?;
        Ok(VariationalFit {
            approximation,
            loss_trace,
            skipped,
            timed_out,
        })
    }
}

impl<B: AutodiffBackend> Advi<B> {
    pub fn fit_with_diagnostics<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<VariationalFit> {
        let density = ModelDensity::<M, B>::new(model, params, data)?;
        self.fit_target(&density, density.layout().clone())
    }
}

impl<B: AutodiffBackend> Approximator for Advi<B> {
    fn fit<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<Approximation> {
        Ok(self.fit_with_diagnostics(model, params, data)?.approximation)
    }
}

/// Variational parameters, flattened for Adam.
struct Guide {
    family: VariationalFamily,
    n: usize,
    params: Vec<f64>,
}

impl Guide {
    fn new(family: VariationalFamily, n: usize, log_scale: f64) -> Self {
        let len = match family {
            VariationalFamily::MeanField => 2 * n,
            VariationalFamily::FullRank => 2 * n + n * n.saturating_sub(1) / 2,
        };
        let mut params = vec![0.0; len];
        params[n..2 * n].fill(log_scale);
        Self { family, n, params }
    }

    /// Index of `L_ij`, `i > j`, in the parameter vector.
    fn off_diag(&self, i: usize, j: usize) -> usize {
        2 * self.n + i * (i - 1) / 2 + j
    }

    fn transform(&self, eps: &[f64], z: &mut [f64]) {
        let n = self.n;
        for i in 0..n {
            z[i] = self.params[i] + self.params[n + i].exp() * eps[i];
            if self.family == VariationalFamily::FullRank {
                for j in 0..i {
                    z[i] += self.params[self.off_diag(i, j)] * eps[j];
                }
            }
        }
    }

    /// Add the gradient of `log p(z(ε))` with respect to the parameters.
    fn accumulate_grad(&self, eps: &[f64], g: &[f64], grad: &mut [f64]) {
        let n = self.n;
        for i in 0..n {
            grad[i] += g[i];
            grad[n + i] += g[i] * eps[i] * self.params[n + i].exp();
            if self.family == VariationalFamily::FullRank {
                for j in 0..i {
                    grad[self.off_diag(i, j)] += g[i] * eps[j];
                }
            }
        }
    }

    /// Entropy `Σ log L_ii + n/2 (1 + ln 2π)`.
    fn entropy(&self) -> f64 {
        let n = self.n;
        self.params[n..2 * n].iter().sum::<f64>() + 0.5 * n as f64 * (1.0 + (2.0 * PI).ln())
    }

    /// The entropy gradient is 1 per log-diagonal entry; `weight` matches the summed draws.
    fn add_entropy_grad(&self, grad: &mut [f64], weight: f64) {
        grad[self.n..2 * self.n].iter_mut().for_each(|v| *v += weight);
    }

    fn into_approximation(self, layout: ParamLayout) -> Result<Approximation> {
        let n = self.n;
        let mut l = DMatrix::zeros(n, n);
        for i in 0..n {
            l[(i, i)] = self.params[n + i].exp();
            if self.family == VariationalFamily::FullRank {
                for j in 0..i {
                    l[(i, j)] = self.params[self.off_diag(i, j)];
                }
            }
        }
        let kind = match self.family {
            VariationalFamily::MeanField => ApproximationKind::MeanField,
            VariationalFamily::FullRank => ApproximationKind::FullRank,
        };
        let cov = &l * l.transpose();
        Approximation::new(self.params[..n].to_vec(), cov, layout, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::target::Target;
    use crate::transforms::Transform;
    use approx::assert_abs_diff_eq;

    /// N(mean, cov) with cov = [[1, rho], [rho, 1]].
    #[derive(Clone)]
    struct Correlated {
        mean: [f64; 2],
        rho: f64,
    }

    impl Target for Correlated {
        fn dim(&self) -> usize {
            2
        }

        fn unnorm_logp(&self, x: &[f64]) -> Result<f64> {
            let mut g = [0.0; 2];
            self.unnorm_logp_and_grad(x, &mut g)
        }
    }

    impl GradientTarget for Correlated {
        fn unnorm_logp_and_grad(&self, x: &[f64], grad: &mut [f64]) -> Result<f64> {
            let d = [x[0] - self.mean[0], x[1] - self.mean[1]];
            let det = 1.0 - self.rho * self.rho;
            let pd = [(d[0] - self.rho * d[1]) / det, (d[1] - self.rho * d[0]) / det];
            grad[0] = -pd[0];
            grad[1] = -pd[1];
            Ok(-0.5 * (d[0] * pd[0] + d[1] * pd[1]))
        }
    }

    /// Defined only for x > 0.
    #[derive(Clone)]
    struct HalfLine;

    impl Target for HalfLine {
        fn dim(&self) -> usize {
            1
        }

        fn unnorm_logp(&self, x: &[f64]) -> Result<f64> {
            if x[0] <= 0.0 {
                return Err(InferenceError::domain("x", "non-positive"));
            }
            Ok(2.0 * x[0].ln() - x[0])
        }
    }

    impl GradientTarget for HalfLine {
        fn unnorm_logp_and_grad(&self, x: &[f64], grad: &mut [f64]) -> Result<f64> {
            let lp = self.unnorm_logp(x)?;
            grad[0] = 2.0 / x[0] - 1.0;
            Ok(lp)
        }
    }

    fn layout(n: usize) -> ParamLayout {
        let mut layout = ParamLayout::default();
        layout.push("x", n, Transform::Identity);
        layout
    }

    fn advi(family: VariationalFamily) -> Advi {
        Advi::new(family)
            .with_iterations(4_000)
            .with_draws(8)
            .with_learning_rate(0.02)
            .set_seed(11)
    }

    #[test]
    fn full_rank_recovers_correlation() {
        let target = Correlated {
            mean: [1.0, -1.0],
            rho: 0.8,
        };
        let fit = advi(VariationalFamily::FullRank)
            .fit_target(&target, layout(2))
            .unwrap();
        let q = &fit.approximation;
        assert_eq!(q.kind(), ApproximationKind::FullRank);
        assert_abs_diff_eq!(q.mean()[0], 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(q.mean()[1], -1.0, epsilon = 0.1);
        assert_abs_diff_eq!(q.covariance()[(0, 0)], 1.0, epsilon = 0.2);
        assert_abs_diff_eq!(q.covariance()[(1, 0)], 0.8, epsilon = 0.2);
        assert_eq!(fit.loss_trace.len(), 4_000);
    }

    #[test]
    fn mean_field_matches_conditional_variance() {
        let target = Correlated {
            mean: [0.0, 0.0],
            rho: 0.8,
        };
        let fit = advi(VariationalFamily::MeanField)
            .fit_target(&target, layout(2))
            .unwrap();
        let q = &fit.approximation;
        assert_eq!(q.covariance()[(0, 1)], 0.0);
        // Mean-field KL(q || p) picks the conditional standard deviation sqrt(1 - rho^2).
        assert_abs_diff_eq!(q.std_devs()[0], 0.6, epsilon = 0.08);
        assert_abs_diff_eq!(q.std_devs()[1], 0.6, epsilon = 0.08);
    }

    #[test]
    fn loss_decreases() {
        let target = Correlated {
            mean: [3.0, 3.0],
            rho: 0.0,
        };
        let fit = advi(VariationalFamily::MeanField)
            .fit_target(&target, layout(2))
            .unwrap();
        let head: f64 = fit.loss_trace[..50].iter().sum::<f64>() / 50.0;
        let tail: f64 = fit.loss_trace[fit.loss_trace.len() - 50..].iter().sum::<f64>() / 50.0;
        assert!(tail < head);
    }

    #[test]
    fn invalid_draws_are_skipped() {
        let fit = Advi::<DefaultBackend>::mean_field()
            .with_iterations(500)
            .set_seed(3)
            .fit_target(&HalfLine, layout(1))
            .unwrap();
        assert!(fit.skipped > 0);
        assert!(fit.approximation.mean()[0] > 0.0);
    }

    #[test]
    fn expired_deadline_sets_flag() {
        let fit = advi(VariationalFamily::MeanField)
            .with_deadline(Some(Instant::now()))
            .fit_target(&Correlated { mean: [0.0, 0.0], rho: 0.0 }, layout(2))
            .unwrap();
        assert!(fit.timed_out);
        assert!(fit.loss_trace.is_empty());
    }
}
