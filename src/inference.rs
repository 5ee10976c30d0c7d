//! Sampling entry points.
//!
//! `sample_*` condition a [`Model`] and sample its unconstrained posterior; `run_*` do the same
//! for any [`Target`] with a known layout (the nested orchestrator uses these for its outer
//! density).

use burn::tensor::backend::{AutodiffBackend, Backend};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::InferenceConfig;
use crate::context::{Model, ParamLayout};
use crate::core::{init_positions, ChainOutput, ChainRunner, HasChains};
use crate::error::Result;
use crate::metropolis_hastings::MetropolisHastings;
use crate::nuts::NUTS;
use crate::posterior::InferenceResult;
use crate::target::{GradientTarget, ModelDensity, Target};

/// NUTS over a model's posterior, with gradients from burn's autodiff backend.
pub fn sample_nuts<B: AutodiffBackend, M: Model>(
    model: &M,
    params: &M::Params,
    data: &M::Data,
    config: &InferenceConfig,
) -> Result<InferenceResult> {
    config.validate()?;
    let density = ModelDensity::<M, B>::new(model, params, data)?;
    let layout = density.layout().clone();
    run_nuts(density, &layout, config)
}

/// Random-walk Metropolis over a model's posterior. No gradients are needed, so any backend
/// works.
pub fn sample_metropolis<B: Backend, M: Model>(
    model: &M,
    params: &M::Params,
    data: &M::Data,
    config: &InferenceConfig,
) -> Result<InferenceResult> {
    config.validate()?;
    let density = ModelDensity::<M, B>::new(model, params, data)?;
    let layout = density.layout().clone();
    run_metropolis(density, &layout, config)
}

pub fn run_nuts<T: GradientTarget + Clone>(
    target: T,
    layout: &ParamLayout,
    config: &InferenceConfig,
) -> Result<InferenceResult> {
    config.validate()?;
    let deadline = config.deadline();
    let init = init_positions(&target, config.chains, config.seed)?;
    let mut sampler = NUTS::new(target, init, config.nuts_options())?.set_seed(config.seed);
    let outputs = drive(&mut sampler, config, deadline)?;
    collect("NUTS", &outputs, layout, config)
}

pub fn run_metropolis<T: Target + Clone>(
    target: T,
    layout: &ParamLayout,
    config: &InferenceConfig,
) -> Result<InferenceResult> {
    config.validate()?;
    let deadline = config.deadline();
    let init = init_positions(&target, config.chains, config.seed)?;
    let mut sampler = MetropolisHastings::new(target, init)?.set_seed(config.seed);
    let outputs = drive(&mut sampler, config, deadline)?;
    collect("Metropolis", &outputs, layout, config)
}

fn drive<S: HasChains>(
    sampler: &mut S,
    config: &InferenceConfig,
    deadline: Option<Instant>,
) -> Result<Vec<ChainOutput>> {
    if config.progress {
        sampler.run_progress(config.samples, config.warmup, deadline)
    } else {
        sampler.run(config.samples, config.warmup, deadline)
    }
}

fn collect(
    sampler: &str,
    outputs: &[ChainOutput],
    layout: &ParamLayout,
    config: &InferenceConfig,
) -> Result<InferenceResult> {
    let result = InferenceResult::from_chains(outputs, layout, config.max_bad_fraction)?;
    if result.timed_out {
        warn!(
            sampler,
            draws = result.posterior.n_draws(),
            requested = config.samples,
            "deadline reached, returning partial draws"
        );
    }
    info!(
        sampler,
        chains = config.chains,
        draws = result.posterior.n_draws(),
        divergences = result.divergence_count,
        max_rhat = result.max_rhat(),
        min_ess = result.min_ess(),
        "sampling finished"
    );
    Ok(result)
}
