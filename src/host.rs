//! Moving values between host `f64` slices and backend tensors.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};

use crate::error::{InferenceError, Result};

/// Build a rank-1 tensor on `device`, converting to the backend's float element.
pub fn tensor<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let data = TensorData::new(values.to_vec(), [values.len()]).convert::<B::FloatElem>();
    Tensor::<B, 1>::from_data(data, device)
}

/// Copy a rank-1 tensor back to the host.
pub fn to_vec<B: Backend>(t: Tensor<B, 1>) -> Result<Vec<f64>> {
    t.into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| InferenceError::Backend(format!("{e:?}")))
}

/// Read a single-element tensor.
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}
