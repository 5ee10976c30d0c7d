//! Log-density targets consumed by the samplers and optimizers.
//!
//! Everything downstream of the model layer works on flat unconstrained `&[f64]` positions.
//! [`ModelDensity`] bridges a [`Model`] to that world: it discovers the parameter layout once,
//! then executes the model in substitute mode for every evaluation, using burn's autodiff
//! backend for gradients.

use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::marker::PhantomData;

use crate::context::{Context, Execution, Model, ParamLayout, Trace};
use crate::error::{InferenceError, Result};
use crate::host;

const LAYOUT_ATTEMPTS: u64 = 100;

/// An unnormalized log-density over `R^dim`.
pub trait Target: Send + Sync {
    fn dim(&self) -> usize;

    /// Unnormalized log-density at `position`. Recoverable errors mark the position as
    /// invalid.
    fn unnorm_logp(&self, position: &[f64]) -> Result<f64>;
}

/// A [`Target`] that can also provide its gradient.
pub trait GradientTarget: Target {
    /// Returns the log-density and writes its gradient into `grad`.
    fn unnorm_logp_and_grad(&self, position: &[f64], grad: &mut [f64]) -> Result<f64>;
}

/// The unconstrained log-joint of a model conditioned on parameters and data.
pub struct ModelDensity<'a, M: Model, B: Backend> {
    model: &'a M,
    params: &'a M::Params,
    data: &'a M::Data,
    layout: ParamLayout,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<M: Model, B: Backend> Clone for ModelDensity<'_, M, B> {
    fn clone(&self) -> Self {
        Self {
            model: self.model,
            params: self.params,
            data: self.data,
            layout: self.layout.clone(),
            device: self.device.clone(),
            _backend: PhantomData,
        }
    }
}

impl<'a, M: Model, B: Backend> ModelDensity<'a, M, B> {
    /// Condition `model` and discover its layout with a prior execution. Executions that hit a
    /// recoverable numerical problem (e.g. a prior draw on the boundary) are retried with a
    /// fresh stream.
    pub fn new(model: &'a M, params: &'a M::Params, data: &'a M::Data) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..LAYOUT_ATTEMPTS {
            let mut ctx = Context::<B>::prior(SmallRng::seed_from_u64(attempt));
            match model.run(params, data, &mut ctx).and_then(|_| ctx.finish()) {
                Ok(exec) => {
                    return Ok(Self {
                        model,
                        params,
                        data,
                        layout: exec.layout,
                        device: B::Device::default(),
                        _backend: PhantomData,
                    })
                }
                Err(e) if e.is_recoverable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| InferenceError::malformed("layout discovery failed")))
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn params(&self) -> &'a M::Params {
        self.params
    }

    pub fn data(&self) -> &'a M::Data {
        self.data
    }

    fn execute(&self, position: burn::tensor::Tensor<B, 1>) -> Result<Execution<B>> {
        let mut ctx = Context::substitute(position);
        self.model.run(self.params, self.data, &mut ctx)?;
        ctx.finish()
    }

    /// Full trace of the model at an unconstrained position.
    pub fn trace(&self, position: &[f64]) -> Result<Trace<B>> {
        self.check_dim(position)?;
        Ok(self
            .execute(host::tensor::<B>(position, &self.device))?
            .trace)
    }

    fn check_dim(&self, position: &[f64]) -> Result<()> {
        if position.len() != self.layout.dim() {
            return Err(InferenceError::malformed(format!(
                "position has {} values, model has {} unconstrained dimensions",
                position.len(),
                self.layout.dim()
            )));
        }
        Ok(())
    }
}

impl<M: Model, B: Backend> Target for ModelDensity<'_, M, B> {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn unnorm_logp(&self, position: &[f64]) -> Result<f64> {
        self.check_dim(position)?;
        let exec = self.execute(host::tensor::<B>(position, &self.device))?;
        let lp = host::scalar(exec.log_joint);
        if lp.is_finite() {
            Ok(lp)
        } else {
            Err(InferenceError::domain("log-joint", format!("{lp}")))
        }
    }
}

impl<M: Model, B: AutodiffBackend> GradientTarget for ModelDensity<'_, M, B> {
    fn unnorm_logp_and_grad(&self, position: &[f64], grad: &mut [f64]) -> Result<f64> {
        self.check_dim(position)?;
        let pos = host::tensor::<B>(position, &self.device).require_grad();
        let exec = self.execute(pos.clone())?;
        let lp = host::scalar(exec.log_joint.clone());
        if !lp.is_finite() {
            return Err(InferenceError::domain("log-joint", format!("{lp}")));
        }
        let grads = exec.log_joint.backward();
        match pos.grad(&grads) {
            Some(g) => {
                let g = host::to_vec(g)?;
                if let Some(bad) = g.iter().find(|v| !v.is_finite()) {
                    return Err(InferenceError::domain("gradient", format!("{bad}")));
                }
                grad.copy_from_slice(&g);
            }
            None => grad.fill(0.0),
        }
        Ok(lp)
    }
}

/// Central finite-difference gradients for targets that cannot be differentiated, such as a
/// density that wraps an inner optimisation.
#[derive(Debug, Clone)]
pub struct FiniteDifference<T> {
    inner: T,
    step: f64,
}

impl<T: Target> FiniteDifference<T> {
    pub fn new(inner: T, step: f64) -> Self {
        Self { inner, step }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Target> Target for FiniteDifference<T> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn unnorm_logp(&self, position: &[f64]) -> Result<f64> {
        self.inner.unnorm_logp(position)
    }
}

impl<T: Target> GradientTarget for FiniteDifference<T> {
    fn unnorm_logp_and_grad(&self, position: &[f64], grad: &mut [f64]) -> Result<f64> {
        let lp = self.inner.unnorm_logp(position)?;
        let mut x = position.to_vec();
        for i in 0..x.len() {
            let h = self.step * position[i].abs().max(1.0);
            x[i] = position[i] + h;
            let up = self.inner.unnorm_logp(&x)?;
            x[i] = position[i] - h;
            let down = self.inner.unnorm_logp(&x)?;
            x[i] = position[i];
            grad[i] = (up - down) / (2.0 * h);
        }
        Ok(lp)
    }
}
