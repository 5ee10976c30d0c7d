/*!
No-U-Turn Sampler.

Multinomial NUTS over a [`GradientTarget`]: each iteration draws a momentum, doubles a
leapfrog trajectory in random directions until it makes a U-turn or reaches the maximum depth,
and picks the next state among the visited points with probability proportional to
`exp(-H)`. A trajectory whose Hamiltonian error exceeds the divergence threshold (or whose
density evaluation fails recoverably) stops growing, is counted as divergent, and its
unfinished half is discarded.

During warm-up the step size follows dual averaging towards the target acceptance
probability, and a diagonal inverse mass matrix is estimated from the draws of a middle
adaptation window.

# Example

```rust
use nested_mcmc::core::ChainRunner;
use nested_mcmc::error::Result;
use nested_mcmc::nuts::{NutsOptions, NUTS};
use nested_mcmc::target::{GradientTarget, Target};

#[derive(Clone)]
struct StdNormal;

impl Target for StdNormal {
    fn dim(&self) -> usize { 2 }
    fn unnorm_logp(&self, x: &[f64]) -> Result<f64> {
        Ok(-0.5 * x.iter().map(|v| v * v).sum::<f64>())
    }
}

impl GradientTarget for StdNormal {
    fn unnorm_logp_and_grad(&self, x: &[f64], grad: &mut [f64]) -> Result<f64> {
        for (g, v) in grad.iter_mut().zip(x) { *g = -v; }
        self.unnorm_logp(x)
    }
}

let mut sampler = NUTS::new(StdNormal, vec![vec![0.5, -0.5]; 2], NutsOptions::default())
    .unwrap()
    .set_seed(42);
let outputs = sampler.run(200, 200, None).unwrap();
assert_eq!(outputs.len(), 2);
assert_eq!(outputs[0].draws.len(), 200);
```
*/

use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::core::{ChainPhase, ChainState, HasChains, MarkovChain, StepInfo};
use crate::error::Result;
use crate::math::log_add_exp;
use crate::target::GradientTarget;

/// Energy error above which a trajectory is declared divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NutsOptions {
    /// Target mean acceptance statistic for step-size adaptation.
    pub target_accept: f64,
    /// Maximum number of trajectory doublings.
    pub max_depth: usize,
    pub max_energy_error: f64,
    /// Estimate a diagonal inverse mass matrix during warm-up.
    pub adapt_mass_matrix: bool,
}

impl Default for NutsOptions {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            max_depth: 10,
            max_energy_error: DIVERGENCE_THRESHOLD,
            adapt_mass_matrix: true,
        }
    }
}

/// Multi-chain NUTS sampler. Chain `i` uses seed `seed + i`.
#[derive(Debug, Clone)]
pub struct NUTS<T: GradientTarget + Clone> {
    pub chains: Vec<NUTSChain<T>>,
    pub seed: u64,
}

impl<T: GradientTarget + Clone> NUTS<T> {
    /// One chain per initial position.
    pub fn new(target: T, initial_positions: Vec<Vec<f64>>, options: NutsOptions) -> Result<Self> {
        let chains = initial_positions
            .into_iter()
            .map(|x| NUTSChain::new(target.clone(), x, options))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chains, seed: 0 }.set_seed(0))
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        for (i, chain) in self.chains.iter_mut().enumerate() {
            chain.reseed(seed.wrapping_add(i as u64));
        }
        self
    }
}

impl<T: GradientTarget + Clone> HasChains for NUTS<T> {
    type Chain = NUTSChain<T>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}

/// A point in phase space.
#[derive(Debug, Clone)]
struct Point {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl Point {
    fn hamiltonian(&self, inv_mass: &[f64]) -> f64 {
        let kinetic: f64 = self
            .p
            .iter()
            .zip(inv_mass)
            .map(|(p, m)| p * p * m)
            .sum();
        0.5 * kinetic - self.logp
    }
}

#[derive(Debug, Clone)]
struct Tree {
    left: Point,
    right: Point,
    proposal: Point,
    log_sum_weight: f64,
    sum_accept: f64,
    n_leaves: usize,
    turning: bool,
    divergent: bool,
}

impl Tree {
    fn leaf(point: Point, log_weight: f64, accept: f64, divergent: bool) -> Self {
        Self {
            left: point.clone(),
            right: point.clone(),
            proposal: point,
            log_sum_weight: log_weight,
            sum_accept: accept,
            n_leaves: 1,
            turning: false,
            divergent,
        }
    }

    fn edge(&self, direction: f64) -> &Point {
        if direction > 0.0 {
            &self.right
        } else {
            &self.left
        }
    }

    fn absorb_stats(&mut self, other: &Tree) {
        self.sum_accept += other.sum_accept;
        self.n_leaves += other.n_leaves;
    }

    /// Attach the edges and weight of `other`, built from this tree's edge in `direction`.
    /// The proposal and acceptance statistics are left to the caller.
    fn extend(&mut self, other: Tree, direction: f64) {
        self.log_sum_weight = log_add_exp(self.log_sum_weight, other.log_sum_weight);
        if direction > 0.0 {
            self.right = other.right;
        } else {
            self.left = other.left;
        }
    }
}

fn is_turning(left: &Point, right: &Point, inv_mass: &[f64]) -> bool {
    let (mut dot_left, mut dot_right) = (0.0, 0.0);
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * left.p[i] * inv_mass[i];
        dot_right += dq * right.p[i] * inv_mass[i];
    }
    dot_left < 0.0 || dot_right < 0.0
}

/// Dual averaging of the log step size (Hoffman & Gelman, 2014).
#[derive(Debug, Clone)]
struct DualAveraging {
    target: f64,
    mu: f64,
    log_eps: f64,
    log_eps_bar: f64,
    h_bar: f64,
    t: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(target: f64, step_size: f64) -> Self {
        Self {
            target,
            mu: (10.0 * step_size).ln(),
            log_eps: step_size.ln(),
            log_eps_bar: 0.0,
            h_bar: 0.0,
            t: 0.0,
        }
    }

    fn update(&mut self, accept_prob: f64) {
        self.t += 1.0;
        let eta = 1.0 / (self.t + Self::T0);
        self.h_bar = (1.0 - eta) * self.h_bar + eta * (self.target - accept_prob);
        self.log_eps = self.mu - self.t.sqrt() / Self::GAMMA * self.h_bar;
        let w = self.t.powf(-Self::KAPPA);
        self.log_eps_bar = w * self.log_eps + (1.0 - w) * self.log_eps_bar;
    }

    fn current(&self) -> f64 {
        self.log_eps.exp()
    }

    fn averaged(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Running mean and variance (Welford).
#[derive(Debug, Clone)]
struct Welford {
    n: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl Welford {
    fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn push(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    /// Variance shrunk towards `1e-3`, as Stan regularises its metric.
    fn regularized_variance(&self) -> Vec<f64> {
        let n = self.n as f64;
        self.m2
            .iter()
            .map(|m2| {
                let var = m2 / (n - 1.0);
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }
}

/// A single NUTS chain.
#[derive(Debug, Clone)]
pub struct NUTSChain<T: GradientTarget> {
    target: T,
    options: NutsOptions,
    state: ChainState,
    grad: Vec<f64>,
    inv_mass: Vec<f64>,
    adapt: DualAveraging,
    mass: Welford,
    phase: ChainPhase,
    iteration: usize,
    n_warmup: usize,
    window: (usize, usize),
    pub seed: u64,
    rng: SmallRng,
}

impl<T: GradientTarget> NUTSChain<T> {
    pub fn new(target: T, initial_position: Vec<f64>, options: NutsOptions) -> Result<Self> {
        let dim = initial_position.len();
        let mut grad = vec![0.0; dim];
        let logp = target.unnorm_logp_and_grad(&initial_position, &mut grad)?;
        Ok(Self {
            target,
            options,
            state: ChainState {
                position: initial_position,
                logp,
                step_size: 1.0,
                accepted: false,
                divergent: false,
            },
            grad,
            inv_mass: vec![1.0; dim],
            adapt: DualAveraging::new(options.target_accept, 1.0),
            mass: Welford::new(dim),
            phase: ChainPhase::Terminated,
            iteration: 0,
            n_warmup: 0,
            window: (0, 0),
            seed: 0,
            rng: SmallRng::seed_from_u64(0),
        })
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
    }

    pub fn inv_mass(&self) -> &[f64] {
        &self.inv_mass
    }

    fn current_point(&self, p: Vec<f64>) -> Point {
        Point {
            q: self.state.position.clone(),
            p,
            grad: self.grad.clone(),
            logp: self.state.logp,
        }
    }

    fn draw_momentum(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        self.inv_mass
            .iter()
            .map(|m| rng.sample::<f64, _>(StandardNormal) / m.sqrt())
            .collect()
    }

    /// One leapfrog step of size `eps` (negative to integrate backwards). `Ok(None)` when
    /// the target rejects the new position.
    fn leapfrog(&self, from: &Point, eps: f64) -> Result<Option<Point>> {
        let dim = from.q.len();
        let mut p: Vec<f64> = (0..dim).map(|i| from.p[i] + 0.5 * eps * from.grad[i]).collect();
        let q: Vec<f64> = (0..dim)
            .map(|i| from.q[i] + eps * self.inv_mass[i] * p[i])
            .collect();
        let mut grad = vec![0.0; dim];
        let logp = match self.target.unnorm_logp_and_grad(&q, &mut grad) {
            Ok(lp) => lp,
            Err(e) if e.is_recoverable() => return Ok(None),
            Err(e) => return Err(e),
        };
        for i in 0..dim {
            p[i] += 0.5 * eps * grad[i];
        }
        Ok(Some(Point { q, p, grad, logp }))
    }

    fn build_tree(&mut self, from: &Point, direction: f64, depth: usize, h0: f64) -> Result<Tree> {
        if depth == 0 {
            let eps = direction * self.state.step_size;
            return Ok(match self.leapfrog(from, eps)? {
                Some(point) => {
                    let energy_error = point.hamiltonian(&self.inv_mass) - h0;
                    let divergent = !energy_error.is_finite()
                        || energy_error > self.options.max_energy_error;
                    let accept = (-energy_error).exp().min(1.0);
                    let accept = if accept.is_finite() { accept } else { 0.0 };
                    Tree::leaf(point, -energy_error, accept, divergent)
                }
                None => Tree::leaf(from.clone(), f64::NEG_INFINITY, 0.0, true),
            });
        }

        let mut tree = self.build_tree(from, direction, depth - 1, h0)?;
        if tree.divergent || tree.turning {
            return Ok(tree);
        }
        let edge = tree.edge(direction).clone();
        let other = self.build_tree(&edge, direction, depth - 1, h0)?;
        tree.absorb_stats(&other);
        if other.divergent || other.turning {
            tree.divergent |= other.divergent;
            tree.turning |= other.turning;
            return Ok(tree);
        }
        let total = log_add_exp(tree.log_sum_weight, other.log_sum_weight);
        if self.rng.gen::<f64>().ln() < other.log_sum_weight - total {
            tree.proposal = other.proposal.clone();
        }
        tree.extend(other, direction);
        tree.turning = is_turning(&tree.left, &tree.right, &self.inv_mass);
        Ok(tree)
    }

    /// One NUTS transition from the current state.
    fn transition(&mut self) -> Result<StepInfo> {
        let momentum = self.draw_momentum();
        let start = self.current_point(momentum);
        let h0 = start.hamiltonian(&self.inv_mass);
        let mut tree = Tree::leaf(start, 0.0, 0.0, false);
        tree.n_leaves = 0;

        let mut info = StepInfo::default();
        for depth in 0..self.options.max_depth {
            let direction = if self.rng.gen::<bool>() { 1.0 } else { -1.0 };
            let edge = tree.edge(direction).clone();
            let sub = self.build_tree(&edge, direction, depth, h0)?;
            tree.absorb_stats(&sub);
            if sub.divergent {
                info.divergent = true;
                break;
            }
            if sub.turning {
                break;
            }
            // Biased progressive sampling favours the new subtree.
            if self.rng.gen::<f64>().ln() < sub.log_sum_weight - tree.log_sum_weight {
                tree.proposal = sub.proposal.clone();
                info.accepted = true;
            }
            tree.extend(sub, direction);
            if is_turning(&tree.left, &tree.right, &self.inv_mass) {
                break;
            }
        }

        info.accept_prob = if tree.n_leaves > 0 {
            tree.sum_accept / tree.n_leaves as f64
        } else {
            0.0
        };
        if info.accepted {
            let proposal = tree.proposal;
            self.state.position = proposal.q;
            self.state.logp = proposal.logp;
            self.grad = proposal.grad;
        }
        self.state.accepted = info.accepted;
        self.state.divergent = info.divergent;
        Ok(info)
    }

    /// Heuristic initial step size: double or halve until the one-step acceptance crosses
    /// one half.
    fn find_reasonable_epsilon(&mut self) -> Result<f64> {
        let mut eps = 1.0;
        let log_accept = |chain: &mut Self, eps: f64| -> Result<f64> {
            let p = chain.draw_momentum();
            let start = chain.current_point(p);
            let h0 = start.hamiltonian(&chain.inv_mass);
            Ok(match chain.leapfrog(&start, eps)? {
                Some(next) => {
                    let la = h0 - next.hamiltonian(&chain.inv_mass);
                    if la.is_nan() {
                        f64::NEG_INFINITY
                    } else {
                        la
                    }
                }
                None => f64::NEG_INFINITY,
            })
        };
        let la = log_accept(self, eps)?;
        let a = if la > 0.5f64.ln() { 1.0 } else { -1.0 };
        for _ in 0..100 {
            let la = log_accept(self, eps)?;
            if a * la <= -a * 2f64.ln() {
                break;
            }
            let next = eps * 2f64.powf(a);
            if !(1e-10..=1e7).contains(&next) {
                break;
            }
            eps = next;
        }
        Ok(eps)
    }

    fn restart_adaptation(&mut self) -> Result<()> {
        let eps = self.find_reasonable_epsilon()?;
        self.state.step_size = eps;
        self.adapt = DualAveraging::new(self.options.target_accept, eps);
        Ok(())
    }
}

impl<T: GradientTarget> MarkovChain for NUTSChain<T> {
    fn begin(&mut self, n_warmup: usize) {
        self.iteration = 0;
        self.n_warmup = n_warmup;
        // Mass-matrix window over the middle of warm-up; too short a warm-up skips it.
        self.window = if self.options.adapt_mass_matrix && n_warmup >= 100 {
            (n_warmup * 15 / 100, n_warmup * 85 / 100)
        } else {
            (n_warmup, n_warmup)
        };
        self.mass = Welford::new(self.state.position.len());
        self.phase = if n_warmup > 0 {
            ChainPhase::WarmingUp
        } else {
            ChainPhase::Sampling
        };
        if n_warmup > 0 {
            // A rejected trial step only leaves the step size at its default.
            if let Ok(eps) = self.find_reasonable_epsilon() {
                self.state.step_size = eps;
                self.adapt = DualAveraging::new(self.options.target_accept, eps);
            }
        }
    }

    fn step(&mut self) -> Result<StepInfo> {
        let info = self.transition()?;
        if self.phase == ChainPhase::WarmingUp {
            self.iteration += 1;
            self.adapt.update(info.accept_prob);
            self.state.step_size = self.adapt.current();

            let (start, end) = self.window;
            if self.iteration > start && self.iteration <= end {
                self.mass.push(&self.state.position);
            }
            if self.iteration == end && end > start && self.mass.n > 2 {
                self.inv_mass = self.mass.regularized_variance();
                self.restart_adaptation()?;
            }
            if self.iteration >= self.n_warmup {
                self.state.step_size = self.adapt.averaged();
                self.phase = ChainPhase::Sampling;
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
