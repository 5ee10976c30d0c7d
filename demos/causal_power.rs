//! Causal-power inference on a two-row contingency table, then nested recovery of the prior.
//!
//! Run with `RUST_LOG=nested_mcmc=debug` for per-fit logging.

use std::time::Instant;

use nested_mcmc::causal::{BetaPrior, CausalPowerModel, ContingencyData};
use nested_mcmc::config::InferenceConfig;
use nested_mcmc::error::InferenceError;
use nested_mcmc::inference::sample_nuts;
use nested_mcmc::laplace::Laplace;
use nested_mcmc::nested::{simulate_responses, NestedInference};
use nested_mcmc::DefaultBackend;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<(), InferenceError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nested_mcmc=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    // Effect on 2 of 10 trials without the cause, on 9 of 10 with it.
    let data = ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0])?;
    let config = InferenceConfig::default()
        .with_warmup(500)
        .with_samples(1_000)
        .with_progress(true)
        .set_seed(42);

    for (label, a, b) in [("flat", 1.0, 1.0), ("weak", 2.0, 5.0), ("strong", 5.0, 2.0)] {
        let start = Instant::now();
        let prior = BetaPrior::new(a, b)?;
        let result = sample_nuts::<DefaultBackend, _>(&CausalPowerModel, &prior, &data, &config)?;
        println!("\n{label} prior Beta({a}, {b}), {:.2?}", start.elapsed());
        println!("{result}");
    }

    // Agents answer with a draw from their own posterior under Beta(2, 5).
    let truth = BetaPrior::new(2.0, 5.0)?;
    let laplace = Laplace::<DefaultBackend>::default();
    let mut rng = SmallRng::seed_from_u64(7);
    let responses = simulate_responses(&CausalPowerModel, &truth, &data, &laplace, 50, &mut rng)?;

    let start = Instant::now();
    let nested_config = config.clone().with_warmup(1_000).with_samples(1_000);
    let result =
        NestedInference::new(&CausalPowerModel, &data, laplace).run(&responses, &nested_config)?;
    println!(
        "\nnested recovery of (a, b) = ({}, {}) from {} responses, {:.2?}",
        truth.a,
        truth.b,
        responses.len(),
        start.elapsed()
    );
    println!("{result}");
    Ok(())
}
