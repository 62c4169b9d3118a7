//! Model module
//!
//! The training engine only relies on [`GradingModel`]: a Burn module that
//! maps a batch of tile stacks to 5 logits per example. `tile_net` provides
//! the default implementation.

pub mod tile_net;

use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};

pub use tile_net::{TilePoolingClassifier, TilePoolingClassifierConfig};

/// Image-to-logits contract of a grading network
pub trait GradingModel<B: Backend>: Module<B> {
    /// `tiles`: `[batch, n_tiles, 3, T, T]`, returns logits `[batch, 5]`
    fn forward(&self, tiles: Tensor<B, 5>) -> Tensor<B, 2>;
}
