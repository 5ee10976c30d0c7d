//! # nested-mcmc
//!
//! Nested Bayesian inference on a differentiable-model substrate (burn).
//!
//! Models declare random variables against an explicit [`context::Context`]; their posteriors
//! can be sampled with [`nuts`] or [`metropolis_hastings`], or approximated by a Gaussian with
//! [`laplace`], [`advi`] or [`moment`]. The [`nested`] orchestrator puts an inner approximation
//! inside an outer sampler, inferring the hyperparameters of the inner prior from a population
//! of responses.
//!
//! ```rust
//! use nested_mcmc::causal::{BetaPrior, CausalPowerModel, ContingencyData};
//! use nested_mcmc::config::InferenceConfig;
//! use nested_mcmc::inference::sample_nuts;
//! use nested_mcmc::DefaultBackend;
//!
//! let data = ContingencyData::new(vec![0.0, 1.0], vec![2.0, 9.0], vec![10.0, 10.0]).unwrap();
//! let config = InferenceConfig::default().with_warmup(200).with_samples(200).with_chains(2);
//! let result = sample_nuts::<DefaultBackend, _>(
//!     &CausalPowerModel,
//!     &BetaPrior::new(1.0, 1.0).unwrap(),
//!     &data,
//!     &config,
//! )
//! .unwrap();
//! assert_eq!(result.draws("wc").unwrap().len(), 400);
//! ```

pub mod advi;
pub mod approximation;
pub mod causal;
pub mod config;
pub mod context;
pub mod core;
pub mod distributions;
pub mod error;
pub mod host;
pub mod inference;
pub mod laplace;
pub mod math;
pub mod metropolis_hastings;
pub mod moment;
pub mod nested;
pub mod nuts;
pub mod optim;
pub mod posterior;
pub mod stats;
pub mod target;
pub mod transforms;

/// Backend used for gradients: burn's autodiff over the CPU ndarray backend, in `f64`.
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::NdArray<f64>>;

/// Backend for gradient-free density evaluation.
pub type HostBackend = burn::backend::NdArray<f64>;
