//! Chain abstraction shared by the samplers, and the parallel runner that drives them.
//!
//! A chain owns its position, its random stream and its adaptation state; chains never share
//! mutable state, so [`ChainRunner`] simply runs them on the rayon pool.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{InferenceError, Result};
use crate::target::Target;

const INIT_ATTEMPTS: usize = 100;
const INIT_RADIUS: f64 = 2.0;

/// Where a chain is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    WarmingUp,
    Sampling,
    Terminated,
}

/// Current state of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    /// Unconstrained position.
    pub position: Vec<f64>,
    pub logp: f64,
    /// Integrator step size (NUTS) or proposal scale (random walk).
    pub step_size: f64,
    pub accepted: bool,
    pub divergent: bool,
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepInfo {
    pub accepted: bool,
    /// Acceptance statistic used for adaptation, in `[0, 1]`.
    pub accept_prob: f64,
    /// The Hamiltonian error of the trajectory exceeded the divergence threshold.
    pub divergent: bool,
    /// The proposal hit a recoverable numerical error and was rejected.
    pub invalid: bool,
}

pub trait MarkovChain: Send {
    /// Prepare a run with `n_warmup` adaptation iterations.
    fn begin(&mut self, n_warmup: usize);

    /// Advance one iteration, adapting tuning parameters while warming up.
    fn step(&mut self) -> Result<StepInfo>;

    fn state(&self) -> &ChainState;

    fn phase(&self) -> ChainPhase;

    fn terminate(&mut self);
}

/// Draws and counters of one completed (or timed-out) chain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChainOutput {
    /// Post-warmup draws in unconstrained space.
    pub draws: Vec<Vec<f64>>,
    pub accepted: usize,
    pub divergences: usize,
    pub warmup_divergences: usize,
    pub invalid: usize,
    pub step_size: f64,
    pub timed_out: bool,
}

impl ChainOutput {
    pub fn accept_rate(&self) -> f64 {
        if self.draws.is_empty() {
            return 0.0;
        }
        self.accepted as f64 / self.draws.len() as f64
    }
}

/// Run one chain for `n_discard` warm-up and `n_collect` sampling iterations.
pub fn run_chain<C: MarkovChain>(
    chain: &mut C,
    n_collect: usize,
    n_discard: usize,
    deadline: Option<Instant>,
    pb: Option<&ProgressBar>,
) -> Result<ChainOutput> {
    let mut out = ChainOutput {
        draws: Vec::with_capacity(n_collect),
        ..ChainOutput::default()
    };
    chain.begin(n_discard);
    for i in 0..n_collect + n_discard {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            out.timed_out = true;
            break;
        }
        let phase = chain.phase();
        // A deadline hit inside the target (an inner fit) ends the chain like our own.
        let info = match chain.step() {
            Ok(info) => info,
            Err(InferenceError::Timeout { iterations }) => {
                warn!(iteration = i, inner_iterations = iterations, "target timed out");
                out.timed_out = true;
                break;
            }
            Err(e) => return Err(e),
        };
        match phase {
            ChainPhase::WarmingUp => out.warmup_divergences += info.divergent as usize,
            ChainPhase::Sampling => {
                out.accepted += info.accepted as usize;
                out.divergences += info.divergent as usize;
                out.invalid += info.invalid as usize;
                out.draws.push(chain.state().position.clone());
            }
            ChainPhase::Terminated => break,
        }
        if let Some(pb) = pb {
            pb.inc(1);
            if i % 50 == 0 {
                pb.set_message(format!(
                    "p(accept)≈{:.2} divergences={}",
                    out.accept_rate(),
                    out.divergences
                ));
            }
        }
    }
    out.step_size = chain.state().step_size;
    chain.terminate();
    Ok(out)
}

/// Anything that owns a set of independent chains.
pub trait HasChains {
    type Chain: MarkovChain;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub trait ChainRunner: HasChains {
    /// Runs all chains in parallel.
    fn run(
        &mut self,
        n_collect: usize,
        n_discard: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<ChainOutput>> {
        self.chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let out = run_chain(chain, n_collect, n_discard, deadline, None)?;
                debug!(
                    chain = i,
                    draws = out.draws.len(),
                    divergences = out.divergences,
                    "chain finished"
                );
                Ok(out)
            })
            .collect()
    }

    /// Like [`ChainRunner::run`], with one progress bar per chain.
    fn run_progress(
        &mut self,
        n_collect: usize,
        n_discard: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<ChainOutput>> {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| InferenceError::InvalidConfig(e.to_string()))?
            .progress_chars("##-");

        self.chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new((n_collect + n_discard) as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(style.clone());
                let out = run_chain(chain, n_collect, n_discard, deadline, Some(&pb))?;
                pb.finish_with_message(format!(
                    "done: p(accept)≈{:.2} divergences={}",
                    out.accept_rate(),
                    out.divergences
                ));
                Ok(out)
            })
            .collect()
    }
}

impl<T: HasChains> ChainRunner for T {}

/// Initial unconstrained points, uniform in `(-2, 2)^dim`, redrawn until the log-density is
/// finite. Chain `i` draws from a stream seeded with `seed + i`.
pub fn init_positions<T: Target>(
    target: &T,
    n_chains: usize,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    (0..n_chains)
        .map(|i| {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
            let mut last_err = None;
            for _ in 0..INIT_ATTEMPTS {
                let x: Vec<f64> = (0..target.dim())
                    .map(|_| rng.gen_range(-INIT_RADIUS..INIT_RADIUS))
                    .collect();
                match target.unnorm_logp(&x) {
                    Ok(_) => return Ok(x),
                    Err(e) if e.is_recoverable() => last_err = Some(e),
                    Err(e) => return Err(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                InferenceError::malformed("no initial point with finite log-density")
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic chain that walks +1 per step and reports a divergence every third step.
    struct Counter {
        state: ChainState,
        warmup_left: usize,
        phase: ChainPhase,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                state: ChainState {
                    position: vec![0.0],
                    logp: 0.0,
                    step_size: 1.0,
                    accepted: false,
                    divergent: false,
                },
                warmup_left: 0,
                phase: ChainPhase::Terminated,
            }
        }
    }

    impl MarkovChain for Counter {
        fn begin(&mut self, n_warmup: usize) {
            self.warmup_left = n_warmup;
            self.phase = if n_warmup > 0 {
                ChainPhase::WarmingUp
            } else {
                ChainPhase::Sampling
            };
        }

        fn step(&mut self) -> Result<StepInfo> {
            self.state.position[0] += 1.0;
            let divergent = self.state.position[0] as usize % 3 == 0;
            if self.phase == ChainPhase::WarmingUp {
                self.warmup_left -= 1;
                if self.warmup_left == 0 {
                    self.phase = ChainPhase::Sampling;
                }
            }
            Ok(StepInfo {
                accepted: true,
                accept_prob: 1.0,
                divergent,
                invalid: false,
            })
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

    /// Counter whose target gives up after a fixed number of steps.
    struct Expiring {
        inner: Counter,
        steps_left: usize,
    }

    impl MarkovChain for Expiring {
        fn begin(&mut self, n_warmup: usize) {
            self.inner.begin(n_warmup);
        }

        fn step(&mut self) -> Result<StepInfo> {
            if self.steps_left == 0 {
                return Err(InferenceError::Timeout { iterations: 7 });
            }
            self.steps_left -= 1;
            self.inner.step()
        }

        fn state(&self) -> &ChainState {
            self.inner.state()
        }

        fn phase(&self) -> ChainPhase {
            self.inner.phase()
        }

        fn terminate(&mut self) {
            self.inner.terminate();
        }
    }

    struct Pool {
        chains: Vec<Counter>,
    }

    impl HasChains for Pool {
        type Chain = Counter;
        fn chains_mut(&mut self) -> &mut Vec<Counter> {
            &mut self.chains
        }
    }

    #[test]
    fn warmup_draws_are_discarded() {
        let mut chain = Counter::new();
        let out = run_chain(&mut chain, 4, 2, None, None).unwrap();
        let draws: Vec<f64> = out.draws.iter().map(|d| d[0]).collect();
        assert_eq!(draws, vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(out.warmup_divergences, 0);
        assert_eq!(out.divergences, 2);
        assert_eq!(chain.phase(), ChainPhase::Terminated);
    }

    #[test]
    fn expired_deadline_returns_partial_output() {
        let mut chain = Counter::new();
        let out = run_chain(&mut chain, 10, 0, Some(Instant::now()), None).unwrap();
        assert!(out.timed_out);
        assert!(out.draws.is_empty());
    }

    #[test]
    fn target_timeout_keeps_collected_draws() {
        let mut chain = Expiring {
            inner: Counter::new(),
            steps_left: 5,
        };
        let out = run_chain(&mut chain, 10, 2, None, None).unwrap();
        assert!(out.timed_out);
        let draws: Vec<f64> = out.draws.iter().map(|d| d[0]).collect();
        assert_eq!(draws, vec![3.0, 4.0, 5.0]);
        assert_eq!(chain.phase(), ChainPhase::Terminated);
    }

    #[test]
    fn runner_runs_every_chain() {
        let mut pool = Pool {
            chains: (0..3).map(|_| Counter::new()).collect(),
        };
        let outs = pool.run(5, 1, None).unwrap();
        assert_eq!(outs.len(), 3);
        assert!(outs.iter().all(|o| o.draws.len() == 5));
    }
}
