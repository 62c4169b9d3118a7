//! Per-epoch tile-set selection
//!
//! Training draws from one tile-set variant per epoch, chosen uniformly at
//! random. The draw for epoch `e` of fold `f` comes from a generator seeded
//! with `(seed, f, e)`, so a run is reproducible from its recorded seed and
//! an epoch's choice does not depend on the epochs before it.

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::dataset::augmentation::AugmentationConfig;
use crate::dataset::table::Example;
use crate::dataset::tiles::{TileDataset, TileSetVariant};
use crate::utils::error::{GradingError, Result};

/// Options shared by every dataset a sampler builds
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub variants: Vec<usize>,
    pub n_tiles: usize,
    pub tile_size: usize,
    /// Augment variant 0 when it is drawn for training
    pub augment_base_variant: bool,
    pub seed: u64,
}

/// Holds the training variants of one fold and its fixed validation set
pub struct TileSetSampler {
    train_sources: Vec<Arc<TileDataset>>,
    validation: Arc<TileDataset>,
    seed: u64,
    fold: usize,
}

impl TileSetSampler {
    /// Build one training dataset per variant plus the validation dataset
    ///
    /// Every training variant covers the same `train` rows; validation always
    /// reads variant 0 without augmentation.
    pub fn new(
        train_path: &Path,
        fold: usize,
        train: Vec<(usize, Example)>,
        validation: Vec<(usize, Example)>,
        options: &SamplerOptions,
    ) -> Result<Self> {
        if options.variants.is_empty() {
            return Err(GradingError::Config(
                "tile-set sampler needs at least one variant".to_string(),
            ));
        }

        let train_sources = options
            .variants
            .iter()
            .map(|&id| {
                let augmentation = if id == 0 && !options.augment_base_variant {
                    AugmentationConfig::none()
                } else {
                    AugmentationConfig::train()
                };
                Arc::new(TileDataset::new(
                    TileSetVariant::new(train_path, id),
                    train.clone(),
                    options.n_tiles,
                    options.tile_size,
                    augmentation,
                ))
            })
            .collect();

        let validation = Arc::new(TileDataset::new(
            TileSetVariant::new(train_path, 0),
            validation,
            options.n_tiles,
            options.tile_size,
            AugmentationConfig::none(),
        ));

        Ok(Self {
            train_sources,
            validation,
            seed: options.seed,
            fold,
        })
    }

    /// Number of examples in one training variant
    pub fn train_len(&self) -> usize {
        self.train_sources.first().map(|d| d.len()).unwrap_or(0)
    }

    pub fn variant_count(&self) -> usize {
        self.train_sources.len()
    }

    /// Generator for everything random in a given epoch of this fold
    pub fn epoch_rng(&self, epoch: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(mix_seed(self.seed, self.fold, epoch))
    }

    /// Training source for `epoch`, drawn uniformly over the variants
    pub fn next_training_source(&self, epoch: usize) -> Arc<TileDataset> {
        let mut rng = self.epoch_rng(epoch);
        let choice = rng.gen_range(0..self.train_sources.len());
        let source = Arc::clone(&self.train_sources[choice]);
        debug!(
            "Fold {} epoch {}: using tile-set variant {}",
            self.fold,
            epoch,
            source.variant().id
        );
        source
    }

    /// The fixed, unaugmented validation source
    pub fn validation_source(&self) -> Arc<TileDataset> {
        Arc::clone(&self.validation)
    }
}

/// Combine run seed, fold and epoch into one generator seed
fn mix_seed(seed: u64, fold: usize, epoch: usize) -> u64 {
    // splitmix64 finaliser over the packed inputs
    let mut z = seed
        ^ (fold as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93)
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tiles::tests::example;

    fn options(variants: Vec<usize>, augment_base_variant: bool) -> SamplerOptions {
        SamplerOptions {
            variants,
            n_tiles: 2,
            tile_size: 4,
            augment_base_variant,
            seed: 2020,
        }
    }

    fn sampler(opts: &SamplerOptions, fold: usize) -> TileSetSampler {
        let train = vec![(0, example("a", 1, "radboud", 1)), (1, example("b", 3, "karolinska", 1))];
        let val = vec![(2, example("c", 0, "radboud", 0))];
        TileSetSampler::new(Path::new("/tiles"), fold, train, val, opts).unwrap()
    }

    #[test]
    fn test_one_source_per_variant() {
        let s = sampler(&options((0..16).collect(), true), 0);
        assert_eq!(s.variant_count(), 16);
        assert_eq!(s.train_len(), 2);
    }

    #[test]
    fn test_selection_is_reproducible_per_epoch() {
        let opts = options((0..16).collect(), true);
        let a = sampler(&opts, 1);
        let b = sampler(&opts, 1);

        // querying out of order gives the same answers
        let forward: Vec<usize> = (0..30).map(|e| a.next_training_source(e).variant().id).collect();
        let backward: Vec<usize> = (0..30).rev().map(|e| b.next_training_source(e).variant().id).collect();
        let backward: Vec<usize> = backward.into_iter().rev().collect();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_selection_visits_several_variants() {
        let s = sampler(&options((0..16).collect(), true), 0);
        let distinct: std::collections::HashSet<usize> =
            (0..60).map(|e| s.next_training_source(e).variant().id).collect();
        assert!(distinct.len() > 4);
    }

    #[test]
    fn test_validation_is_base_variant_without_augmentation() {
        let s = sampler(&options(vec![3, 5], true), 0);
        let val = s.validation_source();
        assert_eq!(val.variant().id, 0);
        assert_eq!(val.variant().suffix, "");
        assert!(!val.is_augmented());
    }

    #[test]
    fn test_base_variant_augmentation_toggle() {
        let on = sampler(&options(vec![0], true), 0);
        assert!(on.next_training_source(0).is_augmented());

        let off = sampler(&options(vec![0, 1], false), 0);
        for epoch in 0..20 {
            let source = off.next_training_source(epoch);
            assert_eq!(source.is_augmented(), source.variant().id != 0);
        }
    }

    #[test]
    fn test_empty_variant_list_rejected() {
        let result = TileSetSampler::new(Path::new("/tiles"), 0, vec![], vec![], &options(vec![], true));
        assert!(result.is_err());
    }
}
