//! Backend selection
//!
//! Training runs on CUDA when the `cuda` feature is enabled and on the
//! NdArray CPU backend otherwise.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn_ndarray::NdArray;

/// The autodiff backend used by the training engine
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device of the active backend
pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Get a human-readable name for the active backend
pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA (GPU)"
    } else {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name_matches_feature() {
        let name = backend_name();
        if cfg!(feature = "cuda") {
            assert!(name.starts_with("CUDA"));
        } else {
            assert_eq!(name, "NdArray (CPU)");
        }
    }
}
