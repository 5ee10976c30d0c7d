/*!
# Adaptive random-walk Metropolis

A gradient-free sampler for targets whose density is not cleanly differentiable, for example a
density that wraps an inner optimisation. Each iteration perturbs the unconstrained position
with an isotropic Gaussian step and accepts with probability `min(1, exp(Δ log-density))`.

During warm-up the step scale is adapted (Robbins–Monro on the log scale) towards an
acceptance rate of 0.234. There is no divergence concept: the chain tracks its acceptance rate,
and proposals whose density cannot be evaluated count as invalid rejections.

## Example Usage

```rust
use nested_mcmc::core::ChainRunner;
use nested_mcmc::error::Result;
use nested_mcmc::metropolis_hastings::MetropolisHastings;
use nested_mcmc::target::Target;

#[derive(Clone)]
struct StdNormal;

impl Target for StdNormal {
    fn dim(&self) -> usize { 1 }
    fn unnorm_logp(&self, x: &[f64]) -> Result<f64> { Ok(-0.5 * x[0] * x[0]) }
}

let mut mh = MetropolisHastings::new(StdNormal, vec![vec![0.0]; 2]).unwrap().set_seed(42);
let outputs = mh.run(500, 500, None).unwrap();
assert_eq!(outputs.len(), 2);
assert!(outputs[0].accept_rate() > 0.0);
```
*/

use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::core::{ChainPhase, ChainState, HasChains, MarkovChain, StepInfo};
use crate::error::Result;
use crate::target::Target;

/// Acceptance rate the warm-up aims for (optimal for Gaussian random walks in moderate
/// dimension).
pub const TARGET_ACCEPT: f64 = 0.234;

/**
The Metropolis–Hastings sampler runs several independent random-walk chains in parallel.

A global seed is provided, and each chain's RNG is seeded with `seed + i`, ensuring
reproducibility.

# Examples

```rust
use nested_mcmc::error::Result;
use nested_mcmc::metropolis_hastings::MetropolisHastings;
use nested_mcmc::target::Target;

#[derive(Clone)]
struct Flat;

impl Target for Flat {
    fn dim(&self) -> usize { 2 }
    fn unnorm_logp(&self, _: &[f64]) -> Result<f64> { Ok(0.0) }
}

let mh = MetropolisHastings::new(Flat, vec![vec![0.0, 0.0]; 2]).unwrap().set_seed(42);
assert_eq!(mh.chains[0].seed, 42);
assert_eq!(mh.chains[1].seed, 43);
```
*/
#[derive(Debug, Clone)]
pub struct MetropolisHastings<T: Target + Clone> {
    /// The vector of independent Markov chains.
    pub chains: Vec<MHMarkovChain<T>>,
    /// The global random seed.
    pub seed: u64,
}

impl<T: Target + Clone> MetropolisHastings<T> {
    /**
    Constructs a sampler with one chain per initial position.

    # Arguments

    * `target` - The target log-density, cloned into every chain.
    * `initial_positions` - Unconstrained starting point of each chain.

    Fails when the target cannot be evaluated at a starting point.
    */
    pub fn new(target: T, initial_positions: Vec<Vec<f64>>) -> Result<Self> {
        let chains = initial_positions
            .into_iter()
            .map(|x| MHMarkovChain::new(target.clone(), x))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chains, seed: 0 }.set_seed(0))
    }

    /// Sets a new global seed; chain `i` receives `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        for (i, chain) in self.chains.iter_mut().enumerate() {
            let chain_seed = seed.wrapping_add(i as u64);
            chain.seed = chain_seed;
            chain.rng = SmallRng::seed_from_u64(chain_seed);
        }
        self
    }

    /// Sets the initial proposal scale of every chain.
    pub fn set_scale(mut self, scale: f64) -> Self {
        for chain in &mut self.chains {
            chain.state.step_size = scale;
        }
        self
    }
}

impl<T: Target + Clone> HasChains for MetropolisHastings<T> {
    type Chain = MHMarkovChain<T>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}

/// A single random-walk Metropolis chain.
///
/// Each chain stores its own copy of the target, its current state and a chain-specific random
/// number generator.
#[derive(Debug, Clone)]
pub struct MHMarkovChain<T: Target> {
    pub target: T,
    state: ChainState,
    phase: ChainPhase,
    n_warmup: usize,
    iteration: usize,
    accepted: usize,
    proposed: usize,
    /// The chain-specific random seed.
    pub seed: u64,
    pub rng: SmallRng,
}

impl<T: Target> MHMarkovChain<T> {
    pub fn new(target: T, initial_position: Vec<f64>) -> Result<Self> {
        let logp = target.unnorm_logp(&initial_position)?;
        let dim = initial_position.len().max(1) as f64;
        Ok(Self {
            target,
            state: ChainState {
                position: initial_position,
                logp,
                step_size: 2.38 / dim.sqrt(),
                accepted: false,
                divergent: false,
            },
            phase: ChainPhase::Terminated,
            n_warmup: 0,
            iteration: 0,
            accepted: 0,
            proposed: 0,
            seed: 0,
            rng: SmallRng::seed_from_u64(0),
        })
    }

    /// Fraction of accepted proposals since the last [`MarkovChain::begin`].
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.proposed as f64
    }
}

impl<T: Target> MarkovChain for MHMarkovChain<T> {
    fn begin(&mut self, n_warmup: usize) {
        self.n_warmup = n_warmup;
        self.iteration = 0;
        self.accepted = 0;
        self.proposed = 0;
        self.phase = if n_warmup > 0 {
            ChainPhase::WarmingUp
        } else {
            ChainPhase::Sampling
        };
    }

    /**
    Performs one Metropolis update.

    The candidate is `x + scale · ε` with `ε ~ N(0, I)`. The proposal is symmetric, so the
    log acceptance ratio is the difference of log-densities; the candidate is accepted when
    `ln u` falls below it for `u ~ Uniform(0, 1)`. A candidate whose density raises a
    recoverable error is rejected.
    */
    fn step(&mut self) -> Result<StepInfo> {
        let scale = self.state.step_size;
        let rng = &mut self.rng;
        let proposed: Vec<f64> = self
            .state
            .position
            .iter()
            .map(|x| x + scale * rng.sample::<f64, _>(StandardNormal))
            .collect();

        let mut info = StepInfo::default();
        match self.target.unnorm_logp(&proposed) {
            Ok(proposed_lp) => {
                let log_accept_ratio = proposed_lp - self.state.logp;
                info.accept_prob = log_accept_ratio.exp().min(1.0);
                let u: f64 = self.rng.gen();
                if log_accept_ratio > u.ln() {
                    self.state.position = proposed;
                    self.state.logp = proposed_lp;
                    info.accepted = true;
                }
            }
            Err(e) if e.is_recoverable() => info.invalid = true,
            Err(e) => return Err(e),
        }
        self.proposed += 1;
        self.accepted += info.accepted as usize;
        self.state.accepted = info.accepted;

        if self.phase == ChainPhase::WarmingUp {
            self.iteration += 1;
            let rate = (self.iteration as f64 + 1.0).powf(-0.6);
            let log_scale = self.state.step_size.ln() + rate * (info.accept_prob - TARGET_ACCEPT);
            self.state.step_size = log_scale.exp();
            if self.iteration >= self.n_warmup {
                self.phase = ChainPhase::Sampling;
                self.accepted = 0;
                self.proposed = 0;
            }
        }
        Ok(info)
    }

    fn state(&self) -> &ChainState {
        &self.state
    }

    fn phase(&self) -> ChainPhase {
        self.phase
    }

    fn terminate(&mut self) {
        self.phase = ChainPhase::Terminated;
    }
}
