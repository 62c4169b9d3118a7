//! Tile-pooling classifier
//!
//! Each tile is encoded by a shared CNN, tile features are max-pooled over
//! the stack, and a small head produces the thermometer logits.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::model::GradingModel;

/// Configuration for [`TilePoolingClassifier`]
#[derive(Config, Debug)]
pub struct TilePoolingClassifierConfig {
    /// Logits per example (thermometer width)
    #[config(default = "5")]
    pub num_outputs: usize,

    /// Filters of the first conv block, doubled per block
    #[config(default = "16")]
    pub base_filters: usize,

    #[config(default = "128")]
    pub hidden_size: usize,

    #[config(default = "0.2")]
    pub dropout_rate: f64,
}

impl TilePoolingClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TilePoolingClassifier<B> {
        TilePoolingClassifier::new(self, device)
    }
}

/// Conv2d, BatchNorm, ReLU, then a 2x2 max-pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Shared tile encoder with max pooling over tiles
#[derive(Module, Debug)]
pub struct TilePoolingClassifier<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    global_pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    relu: Relu,
    dropout: Dropout,
    fc2: Linear<B>,
}

impl<B: Backend> TilePoolingClassifier<B> {
    pub fn new(config: &TilePoolingClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        Self {
            block1: ConvBlock::new(3, base, device),
            block2: ConvBlock::new(base, base * 2, device),
            block3: ConvBlock::new(base * 2, base * 4, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(base * 4, config.hidden_size).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_outputs).init(device),
        }
    }

    /// Per-tile features: `[batch * n_tiles, 3, T, T]` to `[batch * n_tiles, C]`
    fn encode_tiles(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        let x = self.global_pool.forward(x);

        let [rows, channels, _, _] = x.dims();
        x.reshape([rows, channels])
    }
}

impl<B: Backend> GradingModel<B> for TilePoolingClassifier<B> {
    fn forward(&self, tiles: Tensor<B, 5>) -> Tensor<B, 2> {
        let [batch, n_tiles, channels, height, width] = tiles.dims();

        let flat = tiles.reshape([batch * n_tiles, channels, height, width]);
        let features = self.encode_tiles(flat);
        let [_, dim] = features.dims();

        // [B, N, C] -> [B, C, N] -> [B, C, 1]; reduce over the last axis
        let pooled = features
            .reshape([batch, n_tiles, dim])
            .swap_dims(1, 2)
            .max_dim(2);
        let pooled = pooled.reshape([batch, dim]);

        let x = self.fc1.forward(pooled);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}
