//! Prefetching batch loader
//!
//! A producer thread walks the epoch's index order batch by batch, decodes
//! each batch's items on a bounded rayon pool, and hands the finished items
//! to the compute loop through a bounded channel. Tensors are built on the
//! consumer side so device memory stays with the training thread.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::dataset::tiles::{TileDataset, TileItem};
use crate::utils::error::{Result, ResultExt};

/// Batches buffered ahead of the consumer
const PREFETCH_BATCHES: usize = 2;

/// Build the loader pool with `num_workers` threads
pub fn worker_pool(num_workers: usize) -> Result<Arc<ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers.max(1))
        .thread_name(|i| format!("tile-loader-{}", i))
        .build()
        .map(Arc::new)
        .context("failed to build loader pool")
}

/// Iterator over loaded batches of one epoch
pub struct BatchLoader {
    rx: Option<Receiver<Result<Vec<TileItem>>>>,
    handle: Option<JoinHandle<()>>,
    num_batches: usize,
}

impl BatchLoader {
    /// Shuffled order with per-item augmentation seeds, both drawn from `rng`
    pub fn shuffled(
        dataset: Arc<TileDataset>,
        batch_size: usize,
        rng: &mut ChaCha8Rng,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(rng);
        let aug_seed = rng.gen::<u64>();
        Self::spawn(dataset, order, batch_size, aug_seed, pool)
    }

    /// Table order, no randomness
    pub fn sequential(dataset: Arc<TileDataset>, batch_size: usize, pool: Arc<ThreadPool>) -> Self {
        let order: Vec<usize> = (0..dataset.len()).collect();
        Self::spawn(dataset, order, batch_size, 0, pool)
    }

    fn spawn(
        dataset: Arc<TileDataset>,
        order: Vec<usize>,
        batch_size: usize,
        aug_seed: u64,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let num_batches = order.len().div_ceil(batch_size);
        let (tx, rx) = sync_channel(PREFETCH_BATCHES);

        let handle = std::thread::spawn(move || {
            for (batch_idx, chunk) in order.chunks(batch_size).enumerate() {
                let items: Result<Vec<TileItem>> = pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|&pos| dataset.load(pos, item_seed(aug_seed, pos)))
                        .collect()
                });
                let failed = items.is_err();
                if tx.send(items).is_err() {
                    debug!("Batch consumer dropped after {} batches", batch_idx);
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        Self {
            rx: Some(rx),
            handle: Some(handle),
            num_batches,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchLoader {
    type Item = Result<Vec<TileItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        // closing the channel unblocks a producer waiting on a full buffer
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn item_seed(aug_seed: u64, position: usize) -> u64 {
    aug_seed ^ (position as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::tiles::tests::{example, write_tiles};
    use crate::dataset::tiles::TileSetVariant;
    use crate::utils::error::GradingError;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn dataset(dir: &TempDir, count: usize) -> Arc<TileDataset> {
        let variant = TileSetVariant::new(dir.path(), 0);
        let examples: Vec<_> = (0..count)
            .map(|i| example(&format!("s{}", i), i % 6, "radboud", 0))
            .collect();
        write_tiles(&variant, &examples, 1, 2);
        Arc::new(TileDataset::new(
            variant,
            examples.into_iter().enumerate().collect(),
            1,
            2,
            AugmentationConfig::train(),
        ))
    }

    #[test]
    fn test_sequential_keeps_table_order() {
        let dir = TempDir::new().unwrap();
        let loader = BatchLoader::sequential(dataset(&dir, 7), 3, worker_pool(2).unwrap());
        assert_eq!(loader.num_batches(), 3);

        let indices: Vec<usize> = loader
            .map(|batch| batch.unwrap().into_iter().map(|item| item.index))
            .flatten()
            .collect();
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffled_is_a_permutation_and_seeded() {
        let dir = TempDir::new().unwrap();
        let data = dataset(&dir, 10);
        let pool = worker_pool(3).unwrap();

        let run = |seed: u64| -> Vec<(usize, Vec<f32>)> {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            BatchLoader::shuffled(Arc::clone(&data), 4, &mut rng, Arc::clone(&pool))
                .flat_map(|batch| batch.unwrap())
                .map(|item| (item.index, item.tiles))
                .collect()
        };

        let first = run(9);
        let second = run(9);
        assert_eq!(first, second);

        let mut indices: Vec<usize> = first.iter().map(|(i, _)| *i).collect();
        indices.sort();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_files_surface_as_error() {
        let dir = TempDir::new().unwrap();
        let variant = TileSetVariant::new(dir.path(), 2);
        let data = Arc::new(TileDataset::new(
            variant,
            vec![(0, example("missing", 0, "radboud", 0))],
            1,
            2,
            AugmentationConfig::none(),
        ));

        let mut loader = BatchLoader::sequential(data, 4, worker_pool(1).unwrap());
        assert!(matches!(loader.next(), Some(Err(GradingError::ImageLoad(_, _)))));
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let dir = TempDir::new().unwrap();
        let mut loader = BatchLoader::sequential(dataset(&dir, 12), 1, worker_pool(1).unwrap());
        assert!(loader.next().is_some());
        drop(loader);
    }
}
