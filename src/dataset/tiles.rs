//! Tile-set datasets and batching
//!
//! Every example is a stack of `n_tiles` square tiles cut from one slide.
//! Several pre-extracted variants of the same tiles exist on disk, each in
//! its own directory with its own filename suffix:
//!
//! ```text
//! {train_path}/0/{image_id}_{k}.png       variant 0 (base set)
//! {train_path}/{i}/{image_id}_{i}_{k}.png variant i >= 1
//! ```

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use image::imageops::FilterType;
use image::ImageReader;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::augmentation::{AugmentationConfig, TileAugmenter};
use crate::dataset::labels::{LabelCodec, MultiLabelTarget, LABEL_WIDTH};
use crate::dataset::table::Example;
use crate::utils::error::{GradingError, Result};

/// ImageNet channel means
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One pre-extracted tile set: where it lives and how its files are named
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSetVariant {
    pub id: usize,
    pub dir: PathBuf,
    pub suffix: String,
}

impl TileSetVariant {
    /// Variant `id` under the tile root
    pub fn new(train_path: &Path, id: usize) -> Self {
        let suffix = if id == 0 {
            String::new()
        } else {
            format!("_{}", id)
        };
        Self {
            id,
            dir: train_path.join(id.to_string()),
            suffix,
        }
    }

    /// Path of tile `k` for `image_id`
    pub fn tile_path(&self, image_id: &str, k: usize) -> PathBuf {
        self.dir.join(format!("{}{}_{}.png", image_id, self.suffix, k))
    }
}

/// A loaded example, ready for batching
#[derive(Debug, Clone)]
pub struct TileItem {
    /// Row index in the label table
    pub index: usize,
    /// Tiles as flattened `[n_tiles, 3, T, T]`, scaled to [0, 1]
    pub tiles: Vec<f32>,
    pub target: MultiLabelTarget,
    pub provider: String,
}

/// Dataset over one tile-set variant for a subset of the label table
#[derive(Debug, Clone)]
pub struct TileDataset {
    variant: TileSetVariant,
    /// (table index, example) pairs
    examples: Vec<(usize, Example)>,
    n_tiles: usize,
    tile_size: usize,
    augmenter: Option<TileAugmenter>,
}

impl TileDataset {
    pub fn new(
        variant: TileSetVariant,
        examples: Vec<(usize, Example)>,
        n_tiles: usize,
        tile_size: usize,
        augmentation: AugmentationConfig,
    ) -> Self {
        let augmenter = if augmentation.is_identity() {
            None
        } else {
            Some(TileAugmenter::new(augmentation))
        };
        Self {
            variant,
            examples,
            n_tiles,
            tile_size,
            augmenter,
        }
    }

    pub fn variant(&self) -> &TileSetVariant {
        &self.variant
    }

    pub fn is_augmented(&self) -> bool {
        self.augmenter.is_some()
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn n_tiles(&self) -> usize {
        self.n_tiles
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Load and preprocess the item at `position`
    ///
    /// `aug_seed` drives the augmentation of this item only, so the result
    /// does not depend on which loader thread picks it up.
    pub fn load(&self, position: usize, aug_seed: u64) -> Result<TileItem> {
        let (index, example) = self.examples.get(position).ok_or_else(|| {
            GradingError::Dataset(format!(
                "position {} out of range for {} examples",
                position,
                self.examples.len()
            ))
        })?;

        let mut rng = ChaCha8Rng::seed_from_u64(aug_seed);
        let plane = self.tile_size * self.tile_size;
        let mut tiles = Vec::with_capacity(self.n_tiles * 3 * plane);

        for k in 0..self.n_tiles {
            let path = self.variant.tile_path(&example.image_id, k);
            let mut img = ImageReader::open(&path)
                .map_err(|e| GradingError::ImageLoad(path.clone(), e.to_string()))?
                .decode()
                .map_err(|e| GradingError::ImageLoad(path.clone(), e.to_string()))?;

            let size = self.tile_size as u32;
            if img.width() != size || img.height() != size {
                img = img.resize_exact(size, size, FilterType::Triangle);
            }
            if let Some(augmenter) = &self.augmenter {
                img = augmenter.augment(img, &mut rng);
            }

            let rgb = img.to_rgb8();
            let offset = tiles.len();
            tiles.resize(offset + 3 * plane, 0.0);
            for (x, y, pixel) in rgb.enumerate_pixels() {
                let pos = y as usize * self.tile_size + x as usize;
                for c in 0..3 {
                    tiles[offset + c * plane + pos] = pixel[c] as f32 / 255.0;
                }
            }
        }

        Ok(TileItem {
            index: *index,
            tiles,
            target: LabelCodec::encode(example.isup_grade as i64)?,
            provider: example.provider.clone(),
        })
    }
}

/// A batch of tile stacks with their thermometer targets
#[derive(Clone, Debug)]
pub struct TileBatch<B: Backend> {
    /// Label-table indices of the batch rows
    pub indices: Vec<usize>,
    /// `[batch, n_tiles, 3, T, T]`, ImageNet-normalised
    pub images: Tensor<B, 5>,
    /// `[batch, 5]` thermometer code
    pub targets: Tensor<B, 2, Int>,
    pub providers: Vec<String>,
}

/// Stacks [`TileItem`]s into a [`TileBatch`]
#[derive(Clone, Debug)]
pub struct TileBatcher<B: Backend> {
    n_tiles: usize,
    tile_size: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> TileBatcher<B> {
    pub fn new(n_tiles: usize, tile_size: usize) -> Self {
        Self {
            n_tiles,
            tile_size,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, TileItem, TileBatch<B>> for TileBatcher<B> {
    fn batch(&self, items: Vec<TileItem>, device: &B::Device) -> TileBatch<B> {
        let batch_size = items.len();
        let (n, t) = (self.n_tiles, self.tile_size);

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.tiles.iter().copied()).collect();
        let images = Tensor::<B, 5>::from_floats(
            TensorData::new(images_data, [batch_size, n, 3, t, t]),
            device,
        );

        let mean = Tensor::<B, 5>::from_floats(TensorData::new(MEAN.to_vec(), [1, 1, 3, 1, 1]), device);
        let std = Tensor::<B, 5>::from_floats(TensorData::new(STD.to_vec(), [1, 1, 3, 1, 1]), device);
        let images = (images - mean) / std;

        let targets_data: Vec<i64> = items
            .iter()
            .flat_map(|item| item.target.iter().map(|&v| v as i64))
            .collect();
        let targets = Tensor::<B, 2, Int>::from_data(
            TensorData::new(targets_data, [batch_size, LABEL_WIDTH]),
            device,
        );

        TileBatch {
            indices: items.iter().map(|item| item.index).collect(),
            images,
            targets,
            providers: items.into_iter().map(|item| item.provider).collect(),
        }
    }
}
