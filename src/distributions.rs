/*!
Closed-form distribution families used to declare model variables.

Every family implements [`Distribution`]: an elementwise log-density over a rank-1 burn
tensor, host-side sampling from an explicit [`SmallRng`] stream, and its [`Support`]. Scalar
parameters are plain `f64`s; the [`Binomial`] success probabilities are a tensor so that they
can depend on latent variables and carry gradients.

A distribution has a batch length (1 unless [`Beta::expand`] and friends say otherwise). Inside a
plate the batch length must match the plate size.

# Examples

```rust
use burn::backend::NdArray;
use nested_mcmc::distributions::{Beta, Distribution};
use nested_mcmc::host;

type B = NdArray<f64>;
let device = Default::default();

// Beta(2, 2) has density 6 x (1 - x), i.e. 1.5 at x = 0.5.
let beta = Beta::new(2.0, 2.0).unwrap();
let x = host::tensor::<B>(&[0.5], &device);
let lp = Distribution::<B>::log_prob(&beta, x).unwrap();
let lp = host::to_vec(lp).unwrap();
assert!((lp[0] - 1.5f64.ln()).abs() < 1e-12);
```
*/

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::SmallRng;
use rand_distr::Distribution as RandDistribution;
use std::f64::consts::PI;

use crate::error::{InferenceError, Result};
use crate::host;
use crate::math::{ln_beta, ln_choose};
use crate::transforms::Support;

const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// A distribution over a batch of independent values.
pub trait Distribution<B: Backend> {
    /// Number of independent elements one draw consists of.
    fn batch_len(&self) -> usize;

    fn support(&self) -> Support;

    /// Elementwise log-density (or log-mass) of `value`, shape `[batch_len]`.
    fn log_prob(&self, value: Tensor<B, 1>) -> Result<Tensor<B, 1>>;

    /// Draw `batch_len` values on the host.
    fn sample(&self, rng: &mut SmallRng) -> Result<Vec<f64>>;
}

fn check_param(family: &str, name: &str, value: f64, positive: bool) -> Result<()> {
    let ok = value.is_finite() && (!positive || value > 0.0);
    if ok {
        Ok(())
    } else {
        Err(InferenceError::domain(
            family,
            format!("parameter `{name}` = {value} is not valid"),
        ))
    }
}

/// Beta(alpha, beta) on `(0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beta {
    alpha: f64,
    beta: f64,
    len: usize,
}

impl Beta {
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        check_param("Beta", "alpha", alpha, true)?;
        check_param("Beta", "beta", beta, true)?;
        Ok(Self {
            alpha,
            beta,
            len: 1,
        })
    }

    /// Repeat the distribution `len` times independently.
    pub fn expand(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn ln_pdf(&self, x: f64) -> f64 {
        (self.alpha - 1.0) * x.ln() + (self.beta - 1.0) * (-x).ln_1p()
            - ln_beta(self.alpha, self.beta)
    }
}

impl<B: Backend> Distribution<B> for Beta {
    fn batch_len(&self) -> usize {
        self.len
    }

    fn support(&self) -> Support {
        Support::UnitInterval
    }

    fn log_prob(&self, x: Tensor<B, 1>) -> Result<Tensor<B, 1>> {
        let mut lp = x.zeros_like().sub_scalar(ln_beta(self.alpha, self.beta));
        // Skip unit exponents so that Beta(1, 1) stays finite at saturated endpoints.
        if self.alpha != 1.0 {
            lp = lp + x.clone().log().mul_scalar(self.alpha - 1.0);
        }
        if self.beta != 1.0 {
            lp = lp + x.neg().log1p().mul_scalar(self.beta - 1.0);
        }
        Ok(lp)
    }

    fn sample(&self, rng: &mut SmallRng) -> Result<Vec<f64>> {
        let dist = rand_distr::Beta::new(self.alpha, self.beta)
            .map_err(|e| InferenceError::domain("Beta", e.to_string()))?;
        Ok((0..self.len).map(|_| dist.sample(rng)).collect())
    }
}

/// Normal(loc, scale) on the real line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normal {
    loc: f64,
    scale: f64,
    len: usize,
}

impl Normal {
    pub fn new(loc: f64, scale: f64) -> Result<Self> {
        check_param("Normal", "loc", loc, false)?;
        check_param("Normal", "scale", scale, true)?;
        Ok(Self { loc, scale, len: 1 })
    }

    pub fn expand(mut self, len: usize) -> Self {
        self.len = len;
        self
    }
}

impl<B: Backend> Distribution<B> for Normal {
    fn batch_len(&self) -> usize {
        self.len
    }

    fn support(&self) -> Support {
        Support::Real
    }

    fn log_prob(&self, x: Tensor<B, 1>) -> Result<Tensor<B, 1>> {
        let z = x.sub_scalar(self.loc).div_scalar(self.scale);
        Ok(z
            .powi_scalar(2)
            .mul_scalar(-0.5)
            .sub_scalar(self.scale.ln() + HALF_LN_2PI))
    }

    fn sample(&self, rng: &mut SmallRng) -> Result<Vec<f64>> {
        let dist = rand_distr::Normal::new(self.loc, self.scale)
            .map_err(|e| InferenceError::domain("Normal", e.to_string()))?;
        Ok((0..self.len).map(|_| dist.sample(rng)).collect())
    }
}

/// Half-Cauchy(scale) on `(0, inf)`: a Cauchy centred at zero folded onto the positive axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfCauchy {
    scale: f64,
    len: usize,
}

impl HalfCauchy {
    pub fn new(scale: f64) -> Result<Self> {
        check_param("HalfCauchy", "scale", scale, true)?;
        Ok(Self { scale, len: 1 })
    }

    pub fn expand(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn ln_pdf(&self, x: f64) -> f64 {
        if x < 0.0 {
            return f64::NEG_INFINITY;
        }
        (2.0 / (PI * self.scale)).ln() - (x / self.scale).powi(2).ln_1p()
    }
}

impl<B: Backend> Distribution<B> for HalfCauchy {
    fn batch_len(&self) -> usize {
        self.len
    }

    fn support(&self) -> Support {
        Support::Positive
    }

    fn log_prob(&self, x: Tensor<B, 1>) -> Result<Tensor<B, 1>> {
        let norm = (2.0 / (PI * self.scale)).ln();
        Ok(x
            .div_scalar(self.scale)
            .powi_scalar(2)
            .log1p()
            .neg()
            .add_scalar(norm))
    }

    fn sample(&self, rng: &mut SmallRng) -> Result<Vec<f64>> {
        let dist = rand_distr::Cauchy::new(0.0, self.scale)
            .map_err(|e| InferenceError::domain("HalfCauchy", e.to_string()))?;
        Ok((0..self.len).map(|_| dist.sample(rng).abs()).collect())
    }
}

/// Binomial(total_count, probs) with one trial count and one success probability per element.
#[derive(Debug, Clone)]
pub struct Binomial<B: Backend> {
    total_count: Vec<f64>,
    probs: Tensor<B, 1>,
}

impl<B: Backend> Binomial<B> {
    pub fn new(total_count: &[f64], probs: Tensor<B, 1>) -> Result<Self> {
        let [n] = probs.dims();
        if n != total_count.len() {
            return Err(InferenceError::malformed(format!(
                "Binomial has {} trial counts but {} probabilities",
                total_count.len(),
                n
            )));
        }
        if let Some(bad) = total_count
            .iter()
            .find(|c| !Support::Count.contains(**c))
        {
            return Err(InferenceError::malformed(format!(
                "Binomial trial count {bad} is not a non-negative integer"
            )));
        }
        Ok(Self {
            total_count: total_count.to_vec(),
            probs,
        })
    }
}

impl<B: Backend> Distribution<B> for Binomial<B> {
    fn batch_len(&self) -> usize {
        self.total_count.len()
    }

    fn support(&self) -> Support {
        Support::Count
    }

    fn log_prob(&self, k: Tensor<B, 1>) -> Result<Tensor<B, 1>> {
        let device = k.device();
        let counts = host::to_vec(k.clone())?;
        let log_coef: Vec<f64> = counts
            .iter()
            .zip(&self.total_count)
            .map(|(&k, &n)| ln_choose(n, k))
            .collect();
        let n = host::tensor::<B>(&self.total_count, &device);
        let failures = n - k.clone();
        let p = self.probs.clone();
        Ok(host::tensor::<B>(&log_coef, &device)
            + k * p.clone().log()
            + failures * p.neg().log1p())
    }

    fn sample(&self, rng: &mut SmallRng) -> Result<Vec<f64>> {
        let probs = host::to_vec(self.probs.clone())?;
        probs
            .iter()
            .zip(&self.total_count)
            .map(|(&p, &n)| {
                let dist = rand_distr::Binomial::new(n as u64, p)
                    .map_err(|e| InferenceError::domain("Binomial", e.to_string()))?;
                Ok(dist.sample(rng) as f64)
            })
            .collect()
    }
}
