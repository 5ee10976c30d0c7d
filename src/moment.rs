//! Sampling-based approximator: NUTS on the conditioned model, then a normal fitted to the
//! moments of the unconstrained draws. Much slower than [`crate::laplace::Laplace`], but its
//! error does not depend on the posterior being close to normal at the mode.

use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;
use tracing::warn;

use crate::approximation::{Approximation, Approximator};
use crate::config::InferenceConfig;
use crate::context::Model;
use crate::error::Result;
use crate::inference::run_nuts;
use crate::target::ModelDensity;
use crate::DefaultBackend;

#[derive(Debug, Clone)]
pub struct MomentMatched<B = DefaultBackend> {
    config: InferenceConfig,
    _backend: PhantomData<fn() -> B>,
}

impl<B> MomentMatched<B> {
    /// Inner runs never show progress bars.
    pub fn new(config: InferenceConfig) -> Self {
        Self {
            config: config.with_progress(false),
            _backend: PhantomData,
        }
    }
}

impl<B: AutodiffBackend> Approximator for MomentMatched<B> {
    fn fit<M: Model>(
        &self,
        model: &M,
        params: &M::Params,
        data: &M::Data,
    ) -> Result<Approximation> {
        let density = ModelDensity::<M, B>::new(model, params, data)?;
        let layout = density.layout().clone();
        let result = run_nuts(density, &layout, &self.config)?;
        if !result.is_trustworthy() {
            warn!(reasons = ?result.trust.reasons, "moment-matched fit built from a flagged run");
        }
        Approximation::from_draws(&result.posterior.unconstrained_draws(), layout)
    }
}
