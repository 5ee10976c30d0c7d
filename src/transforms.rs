//! Bijections between constrained parameter spaces and the unconstrained real line.
//!
//! Samplers and optimizers always work on unconstrained coordinates `z`. A latent variable
//! with bounded support is recovered as `x = T(z)` and every density evaluated in `z` space
//! picks up `ln |dT/dz|`.

use burn::tensor::activation::log_sigmoid;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::math::{expit, logit, softplus};

/// Support of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Support {
    /// The whole real line.
    Real,
    /// `(0, inf)`.
    Positive,
    /// `(0, 1)`.
    UnitInterval,
    /// Non-negative integers. Discrete sites can be observed or drawn from the prior, but
    /// cannot be latent in a density evaluation.
    Count,
}

impl Support {
    pub fn contains(&self, x: f64) -> bool {
        match self {
            Support::Real => x.is_finite(),
            Support::Positive => x > 0.0 && x.is_finite(),
            Support::UnitInterval => x > 0.0 && x < 1.0,
            Support::Count => x >= 0.0 && x.is_finite() && x.fract() == 0.0,
        }
    }
}

/// A bijection from the real line onto a support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transform {
    Identity,
    /// `x = exp(z)`.
    Log,
    /// `x = expit(z)`.
    Logit,
}

impl Transform {
    /// The transform used to represent latent values of the given support, if any.
    pub fn for_support(support: Support) -> Option<Self> {
        match support {
            Support::Real => Some(Transform::Identity),
            Support::Positive => Some(Transform::Log),
            Support::UnitInterval => Some(Transform::Logit),
            Support::Count => None,
        }
    }

    /// Unconstrained to constrained.
    pub fn constrain(&self, z: f64) -> f64 {
        match self {
            Transform::Identity => z,
            Transform::Log => z.exp(),
            Transform::Logit => expit(z),
        }
    }

    /// Constrained to unconstrained. `None` when `x` lies outside the open support.
    pub fn unconstrain(&self, x: f64) -> Option<f64> {
        let z = match self {
            Transform::Identity if x.is_finite() => x,
            Transform::Log if x > 0.0 && x.is_finite() => x.ln(),
            Transform::Logit if x > 0.0 && x < 1.0 => logit(x),
            _ => return None,
        };
        z.is_finite().then_some(z)
    }

    /// `ln |d constrain / dz|` at `z`.
    pub fn log_abs_det_jacobian(&self, z: f64) -> f64 {
        match self {
            Transform::Identity => 0.0,
            Transform::Log => z,
            Transform::Logit => -softplus(z) - softplus(-z),
        }
    }

    pub fn constrain_tensor<B: Backend>(&self, z: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Transform::Identity => z,
            Transform::Log => z.exp(),
            Transform::Logit => sigmoid(z),
        }
    }

    /// Elementwise log-Jacobian, same shape as `z`.
    pub fn log_abs_det_jacobian_tensor<B: Backend>(&self, z: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Transform::Identity => z.zeros_like(),
            Transform::Log => z,
            Transform::Logit => log_sigmoid(z.clone()) + log_sigmoid(z.neg()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;
    use proptest::prelude::*;

    type B = NdArray<f64>;

    fn host(t: Tensor<B, 1>) -> Vec<f64> {
        t.into_data().to_vec::<f64>().unwrap()
    }

    proptest! {
        #[test]
        fn logit_round_trip(x in 1e-9f64..(1.0 - 1e-9)) {
            let z = Transform::Logit.unconstrain(x).unwrap();
            prop_assert!((Transform::Logit.constrain(z) - x).abs() < 1e-12);
        }

        #[test]
        fn log_round_trip(x in 1e-6f64..1e6) {
            let z = Transform::Log.unconstrain(x).unwrap();
            prop_assert!((Transform::Log.constrain(z) - x).abs() <= 1e-10 * x);
        }
    }

    #[test]
    fn rejects_values_outside_support() {
        assert_eq!(Transform::Logit.unconstrain(0.0), None);
        assert_eq!(Transform::Logit.unconstrain(1.0), None);
        assert_eq!(Transform::Log.unconstrain(-2.0), None);
        assert_eq!(Transform::Identity.unconstrain(f64::NAN), None);
        assert_eq!(Transform::for_support(Support::Count), None);
    }

    #[test]
    fn logit_jacobian_matches_derivative() {
        let h = 1e-6;
        for &z in &[-4.0, -0.3, 0.0, 1.2, 6.0] {
            let numeric = (Transform::Logit.constrain(z + h) - Transform::Logit.constrain(z - h))
                / (2.0 * h);
            assert_abs_diff_eq!(
                Transform::Logit.log_abs_det_jacobian(z),
                numeric.ln(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn tensor_path_agrees_with_scalar_path() {
        let zs = vec![-3.0, -0.5, 0.0, 0.25, 4.0];
        let device = Default::default();
        for t in [Transform::Identity, Transform::Log, Transform::Logit] {
            let z = Tensor::<B, 1>::from_data(TensorData::new(zs.clone(), [zs.len()]), &device);
            let x = host(t.constrain_tensor(z.clone()));
            let jac = host(t.log_abs_det_jacobian_tensor(z));
            for (i, &zi) in zs.iter().enumerate() {
                assert_abs_diff_eq!(x[i], t.constrain(zi), epsilon = 1e-12);
                assert_abs_diff_eq!(jac[i], t.log_abs_det_jacobian(zi), epsilon = 1e-10);
            }
        }
    }
}
