//! Backend selection for Burn.
//!
//! The CPU ndarray backend is the default: it runs everywhere, which is
//! what the training pipeline and the inference service both assume.

use burn::backend::Autodiff;

/// Default backend for inference and evaluation.
pub type DefaultBackend = burn_ndarray::NdArray;

/// Backend with automatic differentiation for training.
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device for the default backend.
pub fn default_device() -> burn_ndarray::NdArrayDevice {
    burn_ndarray::NdArrayDevice::default()
}

/// Human-readable backend name for logs and the health endpoint.
pub fn backend_name() -> &'static str {
    "ndarray (CPU)"
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;

    #[test]
    fn test_default_device_usable() {
        let device = default_device();
        let t = Tensor::<DefaultBackend, 2>::zeros([2, 3], &device);
        assert_eq!(t.dims(), [2, 3]);
    }

    #[test]
    fn test_backend_name() {
        assert!(backend_name().contains("ndarray"));
    }
}
