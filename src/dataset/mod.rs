//! Dataset module
//!
//! - `labels`: thermometer encoding of ISUP grades
//! - `table`: CSV label table with precomputed folds
//! - `folds`: train/validation splits per fold
//! - `augmentation`: geometric tile transforms
//! - `tiles`: tile-set variants, the Burn dataset and batcher
//! - `sampler`: per-epoch variant selection
//! - `loader`: prefetching batch loader

pub mod augmentation;
pub mod folds;
pub mod labels;
pub mod loader;
pub mod sampler;
pub mod table;
pub mod tiles;

pub use augmentation::{AugmentationConfig, TileAugmenter};
pub use folds::{FoldAssignment, FoldSplitter};
pub use labels::{LabelCodec, MultiLabelTarget, LABEL_WIDTH, NUM_GRADES};
pub use loader::{worker_pool, BatchLoader};
pub use sampler::{SamplerOptions, TileSetSampler};
pub use table::{Example, LabelTable};
pub use tiles::{TileBatch, TileBatcher, TileDataset, TileItem, TileSetVariant};
