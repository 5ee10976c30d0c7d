//! Optimizers behind the approximators: BFGS with a backtracking Armijo line search for the
//! Laplace mode, Adam for stochastic variational updates.

use nalgebra::{DMatrix, DVector};
use std::time::Instant;

use crate::error::{InferenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Gradient norm below tolerance.
    Converged,
    MaxIterations,
    /// The line search could not find a decreasing step.
    Stalled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub solution: Vec<f64>,
    pub value: f64,
    pub gradient: Vec<f64>,
    pub iterations: usize,
    pub status: ConvergenceStatus,
}

impl OptimizationResult {
    pub fn gradient_norm(&self) -> f64 {
        inf_norm(&self.gradient)
    }
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}

/// A stagnating loss counts as converged only below this multiple of the gradient tolerance.
const STALL_GRADIENT_FACTOR: f64 = 100.0;

/// Backtracking line search with the Armijo sufficient-decrease condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktrackingLineSearch {
    pub c1: f64,
    pub rho: f64,
    pub max_iter: usize,
}

impl Default for BacktrackingLineSearch {
    fn default() -> Self {
        Self {
            c1: 1e-4,
            rho: 0.5,
            max_iter: 50,
        }
    }
}

/// Quasi-Newton minimizer with the BFGS inverse-Hessian update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bfgs {
    pub max_iterations: usize,
    /// Tolerance on the gradient infinity-norm.
    pub tolerance: f64,
    pub line_search: BacktrackingLineSearch,
    pub deadline: Option<Instant>,
}

impl Bfgs {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            line_search: BacktrackingLineSearch::default(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Minimize `objective`, which returns the value at `x` and writes the gradient.
    ///
    /// Recoverable errors at trial points are treated as an infinitely bad value and shrink
    /// the step; an error at `x0` is returned.
    pub fn minimize<F>(&self, mut objective: F, x0: Vec<f64>) -> Result<OptimizationResult>
    where
        F: FnMut(&[f64], &mut [f64]) -> Result<f64>,
    {
        let n = x0.len();
        let mut x = DVector::from_vec(x0);
        let mut g = DVector::zeros(n);
        let mut f = objective(x.as_slice(), g.as_mut_slice())?;
        let mut h_inv = DMatrix::<f64>::identity(n, n);
        let mut g_new = DVector::zeros(n);

        let finish = |x: DVector<f64>, f, g: DVector<f64>, iterations, status| OptimizationResult {
            solution: x.data.into(),
            value: f,
            gradient: g.data.into(),
            iterations,
            status,
        };

        for k in 0..self.max_iterations {
            if inf_norm(g.as_slice()) < self.tolerance {
                return Ok(finish(x, f, g, k, ConvergenceStatus::Converged));
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(finish(x, f, g, k, ConvergenceStatus::TimedOut));
            }

            let mut d = -(&h_inv * &g);
            let mut slope = g.dot(&d);
            if slope >= 0.0 {
                h_inv = DMatrix::identity(n, n);
                d = -g.clone();
                slope = g.dot(&d);
            }

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..self.line_search.max_iter {
                let trial = &x + alpha * &d;
                match objective(trial.as_slice(), g_new.as_mut_slice()) {
                    Ok(f_trial)
                        if f_trial.is_finite()
                            && f_trial <= f + self.line_search.c1 * alpha * slope =>
                    {
                        accepted = Some((trial, f_trial));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_recoverable() => {}
                    Err(e) => return Err(e),
                }
                alpha *= self.line_search.rho;
            }
            let Some((x_new, f_new)) = accepted else {
                return Ok(finish(x, f, g, k, ConvergenceStatus::Stalled));
            };

            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            if sy > 1e-12 {
                if k == 0 {
                    h_inv *= sy / y.dot(&y);
                }
                let rho = 1.0 / sy;
                let eye = DMatrix::<f64>::identity(n, n);
                let left = &eye - rho * &s * y.transpose();
                let right = &eye - rho * &y * s.transpose();
                h_inv = left * h_inv * right + rho * &s * s.transpose();
            }

            let decrease = f - f_new;
            x = x_new;
            f = f_new;
            g.copy_from(&g_new);

            let gnorm = inf_norm(g.as_slice());
            if gnorm < self.tolerance
                || (decrease.abs() <= self.tolerance * f.abs().max(1.0)
                    && gnorm < STALL_GRADIENT_FACTOR * self.tolerance)
            {
                return Ok(finish(x, f, g, k + 1, ConvergenceStatus::Converged));
            }
        }
        Ok(finish(x, f, g, self.max_iterations, ConvergenceStatus::MaxIterations))
    }
}

/// Turn a non-converged result into [`InferenceError::NonConvergence`] (or
/// [`InferenceError::Timeout`]).
pub fn require_convergence(result: OptimizationResult) -> Result<OptimizationResult> {
    let reason = match result.status {
        ConvergenceStatus::Converged => return Ok(result),
        ConvergenceStatus::TimedOut => {
            return Err(InferenceError::Timeout {
                iterations: result.iterations,
            })
        }
        ConvergenceStatus::MaxIterations => "iteration budget exhausted",
        ConvergenceStatus::Stalled => "line search found no decrease",
    };
    Err(InferenceError::NonConvergence {
        iterations: result.iterations,
        grad_norm: result.gradient_norm(),
        reason: reason.to_string(),
    })
}

/// Adam: per-parameter adaptive learning rates from bias-corrected moment estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: usize,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Descent step: `params -= lr · m̂ / (√v̂ + ε)`.
    pub fn step(&mut self, params: &mut [f64], gradients: &[f64]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
            self.t = 0;
        }
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        for i in 0..params.len() {
            let g = gradients[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}
