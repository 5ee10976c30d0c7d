//! Two-sample Kolmogorov-Smirnov checks of random-walk Metropolis on a conjugate model.
//!
//! `theta ~ Beta(2, 2)`, `k = 7` successes in `n = 10` trials, so the posterior is
//! `Beta(9, 5)`. Thinned sampler draws are compared with exact draws from that posterior,
//! and with draws from a mirrored `Beta(5, 9)` that the test must reject.

use burn::tensor::backend::Backend;
use nested_mcmc::config::InferenceConfig;
use nested_mcmc::context::{Context, Model};
use nested_mcmc::distributions::{Beta, Binomial};
use nested_mcmc::error::Result;
use nested_mcmc::inference::sample_metropolis;
use nested_mcmc::HostBackend;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    const THIN: usize = 20;
    const SEED: u64 = 42;

    struct Coin;

    impl Model for Coin {
        type Params = ();
        type Data = (f64, f64);

        fn run<B: Backend>(
            &self,
            _: &(),
            &(k, n): &(f64, f64),
            ctx: &mut Context<B>,
        ) -> Result<()> {
            let theta = ctx.sample("theta", &Beta::new(2.0, 2.0)?, None)?;
            ctx.observe("k", &Binomial::new(&[n], theta)?, &[k])?;
            Ok(())
        }
    }

    /// `f64` with a total order, as `kolmogorov_smirnov::test` requires `Ord`.
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Total(f64);

    impl Eq for Total {}

    impl PartialOrd for Total {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Total {
        fn cmp(&self, other: &Self) -> Ordering {
            self.0.total_cmp(&other.0)
        }
    }

    fn thinned_draws() -> Vec<Total> {
        let config = InferenceConfig::default()
            .with_chains(4)
            .with_warmup(2_000)
            .with_samples(20_000)
            .set_seed(SEED);
        let result =
            sample_metropolis::<HostBackend, _>(&Coin, &(), &(7.0, 10.0), &config).unwrap();
        assert!(result.is_trustworthy(), "{result}");
        result
            .draws("theta")
            .unwrap()
            .into_iter()
            .step_by(THIN)
            .map(Total)
            .collect()
    }

    fn exact_draws(alpha: f64, beta: f64, n: usize) -> Vec<Total> {
        let dist = rand_distr::Beta::new(alpha, beta).unwrap();
        let mut rng = SmallRng::seed_from_u64(SEED);
        (0..n).map(|_| Total(rng.sample(dist))).collect()
    }

    #[test]
    fn matches_conjugate_posterior() {
        let draws = thinned_draws();
        assert_eq!(draws.len(), 4 * 20_000 / THIN);
        let reference = exact_draws(9.0, 5.0, draws.len());
        let res = kolmogorov_smirnov::test(&draws, &reference, 0.95);
        assert!(
            !res.is_rejected,
            "KS statistic {} above critical value {}",
            res.statistic, res.critical_value
        );
    }

    #[test]
    fn rejects_mirrored_posterior() {
        let draws = thinned_draws();
        let wrong = exact_draws(5.0, 9.0, draws.len());
        let res = kolmogorov_smirnov::test(&draws, &wrong, 0.95);
        assert!(res.is_rejected, "KS statistic {}", res.statistic);
    }
}
