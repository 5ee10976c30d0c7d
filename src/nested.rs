/*!
Nested inference: an outer posterior over the hyperparameters of an inner model's prior.

Every agent of a population is assumed to report a posterior draw of the inner model's latent
variables, obtained by reasoning about the same data under a prior whose hyperparameters are
unknown. The likelihood of a report has no closed form, so the outer model replaces it with a
Gaussian surrogate:

1. the outer sampler proposes positive hyperparameters (half-Cauchy prior, log link);
2. the inner model is conditioned on them and the fixed inner data;
3. an [`Approximator`] fits the inner posterior (Laplace by default);
4. each report is mapped into the approximation's unconstrained space with the transforms the
   fit used, and the approximation's log-density, summed over the `agents` plate, becomes the
   outer log-likelihood.

The inner fit is recomputed on every outer proposal. Its failures (non-convergence, numerical
domain errors) are recoverable, so the outer sampler rejects the proposal and moves on.
*/

use rand::rngs::SmallRng;
use tracing::info;

use crate::approximation::Approximator;
use crate::causal::BetaPrior;
use crate::config::{ConfiguredApproximator, InferenceConfig};
use crate::context::{Context, Model};
use crate::distributions::HalfCauchy;
use crate::error::{InferenceError, Result};
use crate::host;
use crate::inference::{run_metropolis, run_nuts};
use crate::posterior::InferenceResult;
use crate::target::{FiniteDifference, ModelDensity};
use crate::HostBackend;

use burn::tensor::backend::{AutodiffBackend, Backend};

/// Positive hyperparameters an outer sampler can infer.
pub trait Hyperparameters: Sized + Sync {
    /// Site names, in the order of [`Hyperparameters::from_values`].
    fn names() -> &'static [&'static str];

    fn from_values(values: &[f64]) -> Result<Self>;
}

impl Hyperparameters for BetaPrior {
    fn names() -> &'static [&'static str] {
        &["a", "b"]
    }

    fn from_values(values: &[f64]) -> Result<Self> {
        match values {
            [a, b] => BetaPrior::new(*a, *b),
            _ => Err(InferenceError::malformed(format!(
                "BetaPrior needs 2 values, got {}",
                values.len()
            ))),
        }
    }
}

/// One constrained report of the inner latent variables per agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseData {
    responses: Vec<Vec<f64>>,
}

impl ResponseData {
    pub fn new(responses: Vec<Vec<f64>>) -> Result<Self> {
        let Some(first) = responses.first() else {
            return Err(InferenceError::malformed("no responses"));
        };
        let dim = first.len();
        for (i, r) in responses.iter().enumerate() {
            if r.len() != dim {
                return Err(InferenceError::malformed(format!(
                    "response {i} has {} values, response 0 has {dim}",
                    r.len()
                )));
            }
            if r.iter().any(|v| !v.is_finite()) {
                return Err(InferenceError::malformed(format!(
                    "response {i} is not finite"
                )));
            }
        }
        Ok(Self { responses })
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.responses.first().map_or(0, Vec::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.responses.iter().map(Vec::as_slice)
    }
}

/// The outer model: half-Cauchy hyperparameters, and the inner approximation's density of
/// every response as a factor.
pub struct PopulationModel<'a, M: Model, A> {
    inner: &'a M,
    inner_data: &'a M::Data,
    approximator: &'a A,
    prior_scale: f64,
}

impl<M, A> Model for PopulationModel<'_, M, A>
where
    M: Model,
    M::Params: Hyperparameters,
    A: Approximator,
{
    type Params = ();
    type Data = ResponseData;

    fn run<B: Backend>(
        &self,
        _: &(),
        responses: &ResponseData,
        ctx: &mut Context<B>,
    ) -> Result<()> {
        let prior = HalfCauchy::new(self.prior_scale)?;
        let mut values = Vec::with_capacity(M::Params::names().len());
        for name in M::Params::names() {
            let v = ctx.sample(name, &prior, None)?;
            values.push(host::scalar(v));
        }
        let params = M::Params::from_values(&values)?;
        let approx = self.approximator.fit(self.inner, &params, self.inner_data)?;

        let log_lik = responses
            .iter()
            .map(|r| approx.log_density(&approx.to_unconstrained(r)?))
            .collect::<Result<Vec<f64>>>()?;
        ctx.plate("agents", responses.len(), |ctx| {
            let weight = ctx.constant(&log_lik);
            ctx.factor("responses", weight)
        })
    }
}

/// Sampler used for the outer posterior.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OuterSampler {
    /// Gradient-free random-walk Metropolis.
    #[default]
    Metropolis,
    /// NUTS with central finite-difference gradients of the outer density.
    Nuts { fd_step: f64 },
}

/// Two-level fit of the hyperparameters of `inner`'s prior.
pub struct NestedInference<'a, M: Model, A> {
    inner: &'a M,
    inner_data: &'a M::Data,
    approximator: A,
    prior_scale: f64,
    outer: OuterSampler,
}

impl<'a, M, A> NestedInference<'a, M, A>
where
    M: Model,
    M::Params: Hyperparameters,
    A: Approximator,
{
    /// The approximator is fixed here. [`NestedInference::run`] reads only the sampling options
    /// of its config; use [`NestedInference::configured`] to pick inner fits from a config.
    pub fn new(inner: &'a M, inner_data: &'a M::Data, approximator: A) -> Self {
        Self {
            inner,
            inner_data,
            approximator,
            prior_scale: 5.0,
            outer: OuterSampler::default(),
        }
    }

    /// Scale of the half-Cauchy prior on every hyperparameter.
    pub fn with_prior_scale(mut self, scale: f64) -> Self {
        self.prior_scale = scale;
        self
    }

    pub fn with_outer_sampler(mut self, outer: OuterSampler) -> Self {
        self.outer = outer;
        self
    }

    /// Sample the outer posterior given the agents' responses.
    pub fn run(
        &self,
        responses: &ResponseData,
        config: &InferenceConfig,
    ) -> Result<InferenceResult> {
        config.validate()?;
        self.check_responses(responses)?;
        let population = self.population()?;
        let density = ModelDensity::<_, HostBackend>::new(&population, &(), responses)?;
        let layout = density.layout().clone();
        info!(
            agents = responses.len(),
            hyperparameters = ?layout.coordinate_names(),
            outer = ?self.outer,
            "starting nested inference"
        );
        match self.outer {
            OuterSampler::Metropolis => run_metropolis(density, &layout, config),
            OuterSampler::Nuts { fd_step } => {
                run_nuts(FiniteDifference::new(density, fd_step), &layout, config)
            }
        }
    }

    fn population(&self) -> Result<PopulationModel<'_, M, A>> {
        if !(self.prior_scale.is_finite() && self.prior_scale > 0.0) {
            return Err(InferenceError::InvalidConfig(format!(
                "hyperprior scale must be positive, got {}",
                self.prior_scale
            )));
        }
        Ok(PopulationModel {
            inner: self.inner,
            inner_data: self.inner_data,
            approximator: &self.approximator,
            prior_scale: self.prior_scale,
        })
    }

    /// Responses must match the inner layout and lie in the support of every latent variable.
    fn check_responses(&self, responses: &ResponseData) -> Result<()> {
        let reference = M::Params::from_values(&vec![1.0; M::Params::names().len()])?;
        let inner = ModelDensity::<M, HostBackend>::new(self.inner, &reference, self.inner_data)?;
        let layout = inner.layout();
        for (i, r) in responses.iter().enumerate() {
            layout.unconstrain(r).map_err(|e| {
                InferenceError::malformed(format!("response {i} does not fit the inner model: {e}"))
            })?;
        }
        Ok(())
    }
}

impl<'a, M, B> NestedInference<'a, M, ConfiguredApproximator<B>>
where
    M: Model,
    M::Params: Hyperparameters,
    B: AutodiffBackend,
{
    /// Inner fits chosen by `config.approximation_family`, with the config's iteration budget,
    /// tolerance, variational options and seed.
    pub fn configured(inner: &'a M, inner_data: &'a M::Data, config: &InferenceConfig) -> Self {
        Self::new(inner, inner_data, config.approximator())
    }
}

/// Draw one constrained response per agent from the inner approximation at known
/// hyperparameters.
pub fn simulate_responses<M: Model, A: Approximator>(
    inner: &M,
    params: &M::Params,
    inner_data: &M::Data,
    approximator: &A,
    n_agents: usize,
    rng: &mut SmallRng,
) -> Result<ResponseData> {
    let approx = approximator.fit(inner, params, inner_data)?;
    ResponseData::new(
        (0..n_agents)
            .map(|_| approx.sample_constrained(rng))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::{CausalPowerModel, ContingencyData};
    use crate::laplace::Laplace;
    use crate::target::Target;
    use crate::DefaultBackend;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn table() -> ContingencyData {
        ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0]).unwrap()
    }

    #[test]
    fn hyperparameters_from_values() {
        let prior = BetaPrior::from_values(&[2.0, 5.0]).unwrap();
        assert_eq!(prior, BetaPrior { a: 2.0, b: 5.0 });
        assert!(BetaPrior::from_values(&[2.0]).is_err());
        assert!(BetaPrior::from_values(&[-1.0, 5.0]).is_err());
    }

    #[test]
    fn responses_are_validated() {
        assert!(ResponseData::new(vec![]).is_err());
        assert!(ResponseData::new(vec![vec![0.1, 0.2], vec![0.3]]).is_err());
        assert!(ResponseData::new(vec![vec![f64::NAN, 0.2]]).is_err());
        assert_eq!(ResponseData::new(vec![vec![0.1, 0.2]; 3]).unwrap().len(), 3);
    }

    #[test]
    fn outer_density_sums_inner_log_densities() {
        let data = table();
        let laplace = Laplace::<DefaultBackend>::default();
        let responses = ResponseData::new(vec![vec![0.7, 0.2], vec![0.6, 0.3]]).unwrap();
        let nested = NestedInference::new(&CausalPowerModel, &data, laplace.clone())
            .with_prior_scale(2.0);
        let population = nested.population().unwrap();
        let density = ModelDensity::<_, HostBackend>::new(&population, &(), &responses).unwrap();
        assert_eq!(density.layout().coordinate_names(), vec!["a", "b"]);

        // Position (ln 2, ln 5) is a = 2, b = 5.
        let z = [2f64.ln(), 5f64.ln()];
        let fit = laplace
            .fit(&CausalPowerModel, &BetaPrior::new(2.0, 5.0).unwrap(), &data)
            .unwrap();
        let lik: f64 = responses
            .iter()
            .map(|r| fit.log_density(&fit.to_unconstrained(r).unwrap()).unwrap())
            .sum();
        let prior = HalfCauchy::new(2.0).unwrap();
        let expected = lik + prior.ln_pdf(2.0) + prior.ln_pdf(5.0) + z[0] + z[1];
        assert_abs_diff_eq!(density.unnorm_logp(&z).unwrap(), expected, epsilon = 1e-8);
    }

    #[test]
    fn hyperprior_scale_must_be_positive() {
        let data = table();
        let responses = ResponseData::new(vec![vec![0.7, 0.2]]).unwrap();
        let config = InferenceConfig::default()
            .with_chains(1)
            .with_samples(10)
            .with_warmup(10);
        for scale in [0.0, -1.0, f64::NAN] {
            let nested =
                NestedInference::new(&CausalPowerModel, &data, Laplace::<DefaultBackend>::default())
                    .with_prior_scale(scale);
            assert!(matches!(
                nested.run(&responses, &config),
                Err(InferenceError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn responses_outside_support_are_malformed() {
        let data = table();
        let nested =
            NestedInference::new(&CausalPowerModel, &data, Laplace::<DefaultBackend>::default());
        let responses = ResponseData::new(vec![vec![0.5, 1.5]]).unwrap();
        let config = InferenceConfig::default()
            .with_chains(1)
            .with_samples(10)
            .with_warmup(10);
        assert!(matches!(
            nested.run(&responses, &config),
            Err(InferenceError::MalformedModel(_))
        ));
        let wrong_dim = ResponseData::new(vec![vec![0.5]]).unwrap();
        assert!(nested.run(&wrong_dim, &config).is_err());
    }

    #[test]
    fn simulated_responses_lie_in_unit_square() {
        let data = table();
        let mut rng = SmallRng::seed_from_u64(4);
        let responses = simulate_responses(
            &CausalPowerModel,
            &BetaPrior::new(2.0, 5.0).unwrap(),
            &data,
            &Laplace::<DefaultBackend>::default(),
            50,
            &mut rng,
        )
        .unwrap();
        assert_eq!(responses.len(), 50);
        assert!(responses.iter().flatten().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn short_metropolis_run_produces_positive_draws() {
        let data = table();
        let mut rng = SmallRng::seed_from_u64(8);
        let laplace = Laplace::<DefaultBackend>::default();
        let truth = BetaPrior::new(2.0, 5.0).unwrap();
        let responses =
            simulate_responses(&CausalPowerModel, &truth, &data, &laplace, 20, &mut rng).unwrap();
        let config = InferenceConfig::default()
            .with_chains(2)
            .with_warmup(100)
            .with_samples(100)
            .set_seed(1);
        let result = NestedInference::new(&CausalPowerModel, &data, laplace)
            .run(&responses, &config)
            .unwrap();
        assert_eq!(result.posterior.n_draws(), 100);
        for name in ["a", "b"] {
            assert!(result.draws(name).unwrap().iter().all(|v| *v > 0.0));
        }
    }
}
