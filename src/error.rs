//! Error taxonomy shared by model execution, samplers and approximators.

use thiserror::Error;

/// Errors raised while executing a model or running an inference routine.
///
/// Per-step numerical problems are recoverable (see [`InferenceError::is_recoverable`]):
/// samplers reject the offending proposal and optimizers shrink their step. Structural
/// problems abort the run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    /// A variable was declared twice, a plate and its data disagree in shape, or the
    /// model otherwise cannot be executed as written.
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// A density argument left its domain (e.g. a probability outside `(0, 1)`), or the
    /// log-density of a site is not finite.
    #[error("numerical domain error at `{site}`: {detail}")]
    NumericalDomain { site: String, detail: String },

    /// An optimizer did not reach its tolerance within the iteration budget, or the
    /// fitted curvature is unusable.
    #[error(
        "no convergence after {iterations} iterations (gradient norm {grad_norm:.3e}): {reason}"
    )]
    NonConvergence {
        iterations: usize,
        grad_norm: f64,
        reason: String,
    },

    /// The caller-supplied deadline passed before the routine finished.
    #[error("deadline exceeded after {iterations} iterations")]
    Timeout { iterations: usize },

    /// A completed run produced NaN or infinite draws.
    #[error("posterior draws for `{0}` are not finite")]
    NonFinitePosterior(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by the tensor backend while moving data to the host.
    #[error("backend error: {0}")]
    Backend(String),
}

impl InferenceError {
    pub(crate) fn domain(site: impl Into<String>, detail: impl Into<String>) -> Self {
        InferenceError::NumericalDomain {
            site: site.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        InferenceError::MalformedModel(msg.into())
    }

    /// Whether the owning sampler or optimizer may treat this error as a rejected
    /// proposal and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InferenceError::NumericalDomain { .. } | InferenceError::NonConvergence { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors() {
        assert!(InferenceError::domain("p", "outside (0, 1)").is_recoverable());
        assert!(InferenceError::NonConvergence {
            iterations: 10,
            grad_norm: 1.0,
            reason: "budget".into()
        }
        .is_recoverable());
        assert!(!InferenceError::malformed("duplicate site `wc`").is_recoverable());
        assert!(!InferenceError::Timeout { iterations: 3 }.is_recoverable());
    }

    #[test]
    fn messages_name_the_site() {
        let err = InferenceError::domain("effect", "log-density is NaN");
        assert_eq!(
            err.to_string(),
            "numerical domain error at `effect`: log-density is NaN"
        );
    }
}
