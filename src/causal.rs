/*!
Causal-power model: the Beta-Binomial noisy-OR model of elemental causal induction.

A contingency table lists, per row, whether the candidate cause was present (`cause` 0/1), the
number of trials, and the number of trials on which the effect occurred. The effect
probability of a row is the noisy-OR of the causal power `wc` (gated by the cause) and the
background strength `wb`:

```text
p = c·wc + wb − c·wc·wb
```

and the effect count is Binomial(trials, p). Both strengths share one Beta(a, b) prior.

```rust
use nested_mcmc::causal::{power_pc, BetaPrior, CausalPowerModel, ContingencyData};
use nested_mcmc::laplace::Laplace;
use nested_mcmc::approximation::Approximator;
use nested_mcmc::DefaultBackend;

assert_eq!(power_pc(0.0, 0.7, 0.2), 0.2);

let data = ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0]).unwrap();
let fit = Laplace::<DefaultBackend>::default()
    .fit(&CausalPowerModel, &BetaPrior::new(1.0, 1.0).unwrap(), &data)
    .unwrap();
let median = fit.constrained_median();
assert!(median[0] > median[1]);
```
*/

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::context::{Context, Model};
use crate::distributions::{Beta, Binomial};
use crate::error::{InferenceError, Result};
use crate::transforms::Support;

/// Probability of the effect under the noisy-OR rule.
pub fn power_pc(c: f64, wc: f64, wb: f64) -> f64 {
    c * wc + wb - c * wc * wb
}

/// Elementwise noisy-OR of a cause indicator vector with scalar (shape `[1]`) strengths.
pub fn noisy_or<B: Backend>(
    cause: Tensor<B, 1>,
    wc: Tensor<B, 1>,
    wb: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let [n] = cause.dims();
    let wc = wc.expand([n]);
    let wb = wb.expand([n]);
    let cw = cause * wc;
    cw.clone() + wb.clone() - cw * wb
}

/// Rows of a contingency table. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyData {
    cause: Vec<f64>,
    effect: Vec<f64>,
    trials: Vec<f64>,
}

impl ContingencyData {
    pub fn new(cause: Vec<f64>, effect: Vec<f64>, trials: Vec<f64>) -> Result<Self> {
        if cause.len() != effect.len() || cause.len() != trials.len() {
            return Err(InferenceError::malformed(format!(
                "contingency columns differ in length: cause {}, effect {}, trials {}",
                cause.len(),
                effect.len(),
                trials.len()
            )));
        }
        if cause.is_empty() {
            return Err(InferenceError::malformed("contingency table has no rows"));
        }
        for (i, ((&c, &k), &n)) in cause.iter().zip(&effect).zip(&trials).enumerate() {
            if c != 0.0 && c != 1.0 {
                return Err(InferenceError::malformed(format!(
                    "row {i}: cause indicator {c} is not 0 or 1"
                )));
            }
            if !Support::Count.contains(n) || !Support::Count.contains(k) || k > n {
                return Err(InferenceError::malformed(format!(
                    "row {i}: effect count {k} of {n} trials"
                )));
            }
        }
        Ok(Self {
            cause,
            effect,
            trials,
        })
    }

    pub fn len(&self) -> usize {
        self.cause.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cause.is_empty()
    }

    pub fn cause(&self) -> &[f64] {
        &self.cause
    }

    pub fn effect(&self) -> &[f64] {
        &self.effect
    }

    pub fn trials(&self) -> &[f64] {
        &self.trials
    }
}

/// Shape parameters of the Beta prior on `wc` and `wb`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPrior {
    pub a: f64,
    pub b: f64,
}

impl BetaPrior {
    pub fn new(a: f64, b: f64) -> Result<Self> {
        Beta::new(a, b)?;
        Ok(Self { a, b })
    }

    pub fn mean(&self) -> f64 {
        self.a / (self.a + self.b)
    }
}

/// `wc, wb ~ Beta(a, b)`; `effect[i] ~ Binomial(trials[i], noisy_or(cause[i], wc, wb))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CausalPowerModel;

impl Model for CausalPowerModel {
    type Params = BetaPrior;
    type Data = ContingencyData;

    fn run<B: Backend>(
        &self,
        prior: &BetaPrior,
        data: &ContingencyData,
        ctx: &mut Context<B>,
    ) -> Result<()> {
        let strength = Beta::new(prior.a, prior.b)?;
        let wc = ctx.sample("wc", &strength, None)?;
        let wb = ctx.sample("wb", &strength, None)?;
        ctx.plate("rows", data.len(), |ctx| {
            let p = noisy_or(ctx.constant(&data.cause), wc, wb);
            ctx.observe("effect", &Binomial::new(&data.trials, p)?, &data.effect)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SiteKind;
    use crate::host;
    use crate::math::ln_choose;
    use crate::target::{ModelDensity, Target};
    use crate::HostBackend;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn scenario_a() -> ContingencyData {
        ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0]).unwrap()
    }

    proptest! {
        #[test]
        fn noisy_or_without_cause_is_background(wc in 0.0f64..=1.0, wb in 0.0f64..=1.0) {
            prop_assert_eq!(power_pc(0.0, wc, wb), wb);
        }

        #[test]
        fn noisy_or_with_cause(wc in 0.0f64..=1.0, wb in 0.0f64..=1.0) {
            let p = power_pc(1.0, wc, wb);
            prop_assert!((p - (wc + wb - wc * wb)).abs() < 1e-15);
            prop_assert!((p - (1.0 - (1.0 - wc) * (1.0 - wb))).abs() < 1e-12);
        }
    }

    #[test]
    fn tensor_noisy_or_matches_scalar() {
        let device = Default::default();
        let p = noisy_or(
            host::tensor::<HostBackend>(&[0.0, 1.0, 1.0], &device),
            host::tensor::<HostBackend>(&[0.6], &device),
            host::tensor::<HostBackend>(&[0.3], &device),
        );
        let p = host::to_vec(p).unwrap();
        assert_abs_diff_eq!(p[0], power_pc(0.0, 0.6, 0.3), epsilon = 1e-15);
        assert_abs_diff_eq!(p[1], power_pc(1.0, 0.6, 0.3), epsilon = 1e-15);
    }

    #[test]
    fn log_joint_at_origin() {
        let prior = BetaPrior::new(1.0, 1.0).unwrap();
        let data = scenario_a();
        let density =
            ModelDensity::<_, HostBackend>::new(&CausalPowerModel, &prior, &data).unwrap();
        assert_eq!(density.layout().coordinate_names(), vec!["wc", "wb"]);

        // wc = wb = 0.5: p = [0.5, 0.75]; each logit Jacobian is ln 0.25.
        let expected = 2.0 * 0.25f64.ln()
            + ln_choose(10.0, 2.0)
            + 10.0 * 0.5f64.ln()
            + ln_choose(10.0, 9.0)
            + 9.0 * 0.75f64.ln()
            + 0.25f64.ln();
        assert_abs_diff_eq!(density.unnorm_logp(&[0.0, 0.0]).unwrap(), expected, epsilon = 1e-10);

        let trace = density.trace(&[0.0, 0.0]).unwrap();
        let effect = trace.get("effect").unwrap();
        assert_eq!(effect.kind, SiteKind::Observed);
        assert_eq!(effect.plate.as_deref(), Some("rows"));
        assert_eq!(trace.value("effect").unwrap(), vec![2.0, 9.0]);
    }

    #[test]
    fn rejects_malformed_tables() {
        let cases = [
            ContingencyData::new(vec![0.0, 1.0], vec![2.0], vec![10.0, 10.0]),
            ContingencyData::new(vec![0.5], vec![2.0], vec![10.0]),
            ContingencyData::new(vec![1.0], vec![11.0], vec![10.0]),
            ContingencyData::new(vec![1.0], vec![2.5], vec![10.0]),
            ContingencyData::new(vec![], vec![], vec![]),
        ];
        for case in cases {
            assert!(matches!(case, Err(InferenceError::MalformedModel(_))));
        }
    }

    #[test]
    fn prior_requires_positive_shapes() {
        assert!(BetaPrior::new(0.0, 1.0).is_err());
        assert_abs_diff_eq!(BetaPrior::new(2.0, 5.0).unwrap().mean(), 2.0 / 7.0);
    }
}
