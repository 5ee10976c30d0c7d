//! End-to-end NUTS runs of the causal-power model on small contingency tables.
//!
//! Scenario A: background rate 2/10, rate with the cause 9/10, flat prior.
//! Scenario B: the same table under a prior favouring weak strengths, Beta(2, 5), and one
//! favouring strong strengths, Beta(5, 2).

use nested_mcmc::causal::{BetaPrior, CausalPowerModel, ContingencyData};
use nested_mcmc::config::InferenceConfig;
use nested_mcmc::inference::sample_nuts;
use nested_mcmc::posterior::InferenceResult;
use nested_mcmc::DefaultBackend;

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ContingencyData {
        ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0]).unwrap()
    }

    fn config() -> InferenceConfig {
        InferenceConfig::default()
            .with_warmup(500)
            .with_samples(1_000)
            .with_chains(2)
            .set_seed(42)
    }

    fn run(a: f64, b: f64) -> InferenceResult {
        sample_nuts::<DefaultBackend, _>(
            &CausalPowerModel,
            &BetaPrior::new(a, b).unwrap(),
            &table(),
            &config(),
        )
        .unwrap()
    }

    #[test]
    fn flat_prior_recovers_strengths() {
        let result = run(1.0, 1.0);
        let wc = result.summary_for("wc").unwrap();
        let wb = result.summary_for("wb").unwrap();

        // Exact posterior means, by quadrature: wc ≈ 0.76, wb ≈ 0.27.
        assert!(wc.mean > 0.65 && wc.mean < 0.90, "wc mean {}", wc.mean);
        assert!(wb.mean > 0.15 && wb.mean < 0.40, "wb mean {}", wb.mean);
        assert!(wc.q5 < wc.median && wc.median < wc.q95);
        assert!(wc.rhat < 1.05 && wb.rhat < 1.05);
        assert!(wc.ess > 200.0);
        assert!(result.is_trustworthy(), "{result}");
    }

    #[test]
    fn prior_strength_shifts_causal_power() {
        let weak = run(2.0, 5.0);
        let strong = run(5.0, 2.0);
        let weak_wc = weak.summary_for("wc").unwrap().mean;
        let strong_wc = strong.summary_for("wc").unwrap().mean;
        assert!(
            weak_wc < strong_wc,
            "weak prior {weak_wc} should give lower causal power than strong prior {strong_wc}"
        );
        assert_eq!(weak.divergence_count, 0);
        assert_eq!(strong.divergence_count, 0);
    }

    #[test]
    fn draws_stay_in_unit_interval() {
        let result = run(2.0, 5.0);
        for name in ["wc", "wb"] {
            let draws = result.draws(name).unwrap();
            assert_eq!(draws.len(), 2_000);
            assert!(draws.iter().all(|v| *v > 0.0 && *v < 1.0));
        }
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let first = run(1.0, 1.0);
        let second = run(1.0, 1.0);
        assert_eq!(first.draws("wc"), second.draws("wc"));
        assert_eq!(first.draws("wb"), second.draws("wb"));
    }
}
