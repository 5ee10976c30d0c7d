/*!
Gaussian posterior surrogates and the [`Approximator`] capability.

An [`Approximation`] is a multivariate normal over the *unconstrained* latent space of a model,
together with the [`ParamLayout`] that built it. Densities are always evaluated in that space;
callers holding constrained values go through [`Approximation::to_unconstrained`] (or
[`Approximation::log_density_constrained`]), which applies exactly the transforms the fit used.
*/

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::context::{Model, ParamLayout};
use crate::error::{InferenceError, Result};

/// How an [`Approximation`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproximationKind {
    Laplace,
    MeanField,
    FullRank,
    /// Moments of posterior draws.
    MomentMatched,
}

#[derive(Debug, Clone)]
pub struct Approximation {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    /// Lower Cholesky factor of `cov`.
    chol: DMatrix<f64>,
    log_det: f64,
    layout: ParamLayout,
    kind: ApproximationKind,
}

impl Approximation {
    /// Normal with the given mean and covariance. The covariance must be symmetric positive
    /// definite; otherwise the fit is reported as non-converged.
    pub fn new(
        mean: Vec<f64>,
        cov: DMatrix<f64>,
        layout: ParamLayout,
        kind: ApproximationKind,
    ) -> Result<Self> {
        let n = mean.len();
        if cov.nrows() != n || cov.ncols() != n || layout.dim() != n {
            return Err(InferenceError::malformed(format!(
                "approximation of dimension {n} with a {}x{} covariance \
                 over a {}-dimensional layout",
                cov.nrows(),
                cov.ncols(),
                layout.dim()
            )));
        }
        if mean.iter().chain(cov.iter()).any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinitePosterior(
                "approximation has non-finite moments".to_string(),
            ));
        }
        let cov = (&cov + cov.transpose()) * 0.5;
        let chol = cov
            .clone()
            .cholesky()
            .ok_or_else(|| not_positive_definite("covariance"))?
            .unpack();
        let log_det = 2.0 * chol.diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Ok(Self {
            mean: DVector::from_vec(mean),
            cov,
            chol,
            log_det,
            layout,
            kind,
        })
    }

    /// Normal with covariance equal to the inverse of `precision` (e.g. a negated Hessian).
    pub fn from_precision(
        mean: Vec<f64>,
        precision: DMatrix<f64>,
        layout: ParamLayout,
        kind: ApproximationKind,
    ) -> Result<Self> {
        let precision = (&precision + precision.transpose()) * 0.5;
        let cov = precision
            .cholesky()
            .ok_or_else(|| not_positive_definite("curvature"))?
            .inverse();
        Self::new(mean, cov, layout, kind)
    }

    /// Sample mean and covariance of unconstrained `draws`.
    pub fn from_draws(draws: &[Vec<f64>], layout: ParamLayout) -> Result<Self> {
        let n = layout.dim();
        if draws.len() < 2 {
            return Err(InferenceError::malformed(
                "at least two draws are needed to match moments",
            ));
        }
        let count = draws.len() as f64;
        let mut mean = DVector::zeros(n);
        for d in draws {
            mean += DVector::from_column_slice(d);
        }
        mean /= count;
        let mut cov = DMatrix::zeros(n, n);
        for d in draws {
            let c = DVector::from_column_slice(d) - &mean;
            cov += &c * c.transpose();
        }
        cov /= count - 1.0;
        Self::new(
            mean.data.into(),
            cov,
            layout,
            ApproximationKind::MomentMatched,
        )
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn kind(&self) -> ApproximationKind {
        self.kind
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn std_devs(&self) -> Vec<f64> {
        self.cov.diagonal().iter().map(|v| v.sqrt()).collect()
    }

    /// The mean pushed through the transforms: the median of each constrained marginal.
    pub fn constrained_median(&self) -> Vec<f64> {
        self.layout.constrain(self.mean.as_slice())
    }

    /// Log-density at an unconstrained point.
    pub fn log_density(&self, z: &[f64]) -> Result<f64> {
        if z.len() != self.dim() {
            return Err(InferenceError::malformed(format!(
                "point has {} values, approximation has dimension {}",
                z.len(),
                self.dim()
            )));
        }
        let centered = DVector::from_column_slice(z) - &self.mean;
        let y = self
            .chol
            .solve_lower_triangular(&centered)
            .ok_or_else(|| not_positive_definite("covariance"))?;
        Ok(-0.5 * (y.norm_squared() + self.log_det + self.dim() as f64 * (2.0 * PI).ln()))
    }

    /// Map constrained values into the space the approximation lives in.
    pub fn to_unconstrained(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.layout.unconstrain(x)
    }

    /// Density of the pushed-forward distribution at constrained `x` (includes `ln |dz/dx|`).
    pub fn log_density_constrained(&self, x: &[f64]) -> Result<f64> {
        let z = self.to_unconstrained(x)?;
        Ok(self.log_density(&z)? - self.layout.log_abs_det_jacobian(&z))
    }

    /// One unconstrained draw, `mean + L ε`.
    pub fn sample(&self, rng: &mut SmallRng) -> Vec<f64> {
        let eps = DVector::from_iterator(
            self.dim(),
            (0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)),
        );
        (&self.mean + &self.chol * eps).data.into()
    }

    pub fn sample_constrained(&self, rng: &mut SmallRng) -> Vec<f64> {
        self.layout.constrain(&self.sample(rng))
    }
}

fn not_positive_definite(what: &str) -> InferenceError {
    InferenceError::NonConvergence {
        iterations: 0,
        grad_norm: f64::NAN,
        reason: format!("{what} not positive definite"),
    }
}

/// Something that turns a conditioned model into a Gaussian surrogate of its posterior.
///
/// The nested orchestrator only talks to this trait, so Laplace, variational and sampling
/// backends are interchangeable.
pub trait Approximator: Sync {
    fn fit<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<Approximation>;
}
