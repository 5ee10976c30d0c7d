/*!
Laplace approximation.

The unconstrained log-joint is maximised with BFGS (minimising its negation), starting from
zero or a fixed point. The curvature at the optimum is the central finite difference of the
autodiff gradient, symmetrised; the approximation is the normal with mean at the mode and
covariance equal to the inverse of the negated Hessian.

A fit that does not reach the tolerance within the iteration budget, or whose curvature is
not positive definite, is an [`InferenceError::NonConvergence`]. A deadline that expires
first is an [`InferenceError::Timeout`].
*/

use burn::tensor::backend::AutodiffBackend;
use nalgebra::DMatrix;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{debug, warn};

use crate::approximation::{Approximation, ApproximationKind, Approximator};
use crate::context::Model;
use crate::error::{InferenceError, Result};
use crate::optim::{require_convergence, Bfgs};
use crate::target::{GradientTarget, ModelDensity, Target};
use crate::DefaultBackend;

/// Where the optimizer starts, in unconstrained space.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LaplaceInit {
    #[default]
    Zero,
    Fixed(Vec<f64>),
}

#[derive(Debug, Clone)]
pub struct Laplace<B = DefaultBackend> {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub init: LaplaceInit,
    /// Relative finite-difference step for the Hessian.
    pub hessian_step: f64,
    pub deadline: Option<Instant>,
    _backend: PhantomData<fn() -> B>,
}

impl<B> Default for Laplace<B> {
    fn default() -> Self {
        Self::new(1_000, 1e-8)
    }
}

impl<B> Laplace<B> {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            init: LaplaceInit::Zero,
            hessian_step: 1e-5,
            deadline: None,
            _backend: PhantomData,
        }
    }

    pub fn with_init(mut self, init: LaplaceInit) -> Self {
        self.init = init;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

impl<B: AutodiffBackend> Laplace<B> {
    /// Fit the approximation to a density directly.
    pub fn fit_density<M: Model>(&self, density: &ModelDensity<'_, M, B>) -> Result<Approximation> {
        let dim = density.dim();
        let x0 = match &self.init {
            LaplaceInit::Zero => vec![0.0; dim],
            LaplaceInit::Fixed(x) if x.len() == dim => x.clone(),
            LaplaceInit::Fixed(x) => {
                return Err(InferenceError::InvalidConfig(format!(
                    "initial point has {} values, model has {dim}",
                    x.len()
                )))
            }
        };

        let bfgs = Bfgs::new(self.max_iterations, self.tolerance).with_deadline(self.deadline);
        let result = bfgs.minimize(
            |x, grad| {
                let lp = density.unnorm_logp_and_grad(x, grad)?;
                grad.iter_mut().for_each(|g| *g = -*g);
                Ok(-lp)
            },
            x0,
        )?;
        let result = require_convergence(result)
            .inspect_err(|e| warn!(error = %e, "Laplace fit failed"))?;
        debug!(
            iterations = result.iterations,
            log_density = -result.value,
            grad_norm = result.gradient_norm(),
            "Laplace mode found"
        );

        let precision = self.negated_hessian(density, &result.solution)?;
        Approximation::from_precision(
            result.solution,
            precision,
            density.layout().clone(),
            ApproximationKind::Laplace,
        )
        .inspect_err(|e| warn!(error = %e, "Laplace curvature rejected"))
    }

    fn negated_hessian<T: GradientTarget>(&self, target: &T, mode: &[f64]) -> Result<DMatrix<f64>> {
        let n = mode.len();
        let mut hessian = DMatrix::zeros(n, n);
        let mut x = mode.to_vec();
        let mut up = vec![0.0; n];
        let mut down = vec![0.0; n];
        for j in 0..n {
            let h = self.hessian_step * mode[j].abs().max(1.0);
            x[j] = mode[j] + h;
            target
                .unnorm_logp_and_grad(&x, &mut up)
                .map_err(curvature_undefined)?;
            x[j] = mode[j] - h;
            target
                .unnorm_logp_and_grad(&x, &mut down)
                .map_err(curvature_undefined)?;
            x[j] = mode[j];
            for i in 0..n {
                hessian[(i, j)] = (up[i] - down[i]) / (2.0 * h);
            }
        }
        Ok(-(&hessian + hessian.transpose()) * 0.5)
    }
}

fn curvature_undefined(e: InferenceError) -> InferenceError {
    if !e.is_recoverable() {
        return e;
    }
    InferenceError::NonConvergence {
        iterations: 0,
        grad_norm: f64::NAN,
        reason: format!("curvature undefined near the mode: {e}"),
    }
}

impl<B: AutodiffBackend> Approximator for Laplace<B> {
    fn fit<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<Approximation> {
        let density = ModelDensity::<M, B>::new(model, params, data)?;
        self.fit_density(&density)
    }
}
