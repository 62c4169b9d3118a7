//! Per-fold training engine
//!
//! Drives one fold from `Initialized` through `Training(epoch)` to
//! `Completed`. Each epoch trains on the tile-set variant the sampler draws
//! for it, then scores the fixed validation set, reports, and offers the
//! model to the checkpoint store. Any error inside an epoch ends the fold.

use std::sync::Arc;

use burn::{
    data::dataloader::batcher::Batcher,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    nn::loss::BinaryCrossEntropyLossConfig,
    optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::{activation::sigmoid, backend::AutodiffBackend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::config::Hyperparameters;
use crate::dataset::loader::BatchLoader;
use crate::dataset::sampler::TileSetSampler;
use crate::dataset::tiles::{TileBatch, TileBatcher, TileDataset};
use crate::model::GradingModel;
use crate::training::checkpoint::CheckpointStore;
use crate::training::reporter::{EpochAggregate, EvaluationReporter, StepOutput};
use crate::training::scheduler::OneCycleSchedule;
use crate::utils::error::{GradingError, Result};
use crate::utils::logging::TrainingLogger;
use crate::utils::tracking::TrackingSink;

/// Lifecycle of one fold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Initialized,
    Training(usize),
    Completed,
}

/// What one epoch produced
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub variant: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub kappa: f64,
    /// Learning rate after the epoch's last optimizer step
    pub lr: f64,
    pub is_best: bool,
}

/// Result of a completed fold
#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub fold: usize,
    pub epochs: Vec<EpochSummary>,
    pub global_step: usize,
}

/// Trains and validates one fold on the autodiff backend `B`
pub struct TrainingEngine<B: AutodiffBackend> {
    fold: usize,
    hparams: Hyperparameters,
    device: B::Device,
    reporter: EvaluationReporter,
    pool: Arc<ThreadPool>,
    phase: EnginePhase,
    global_step: usize,
    show_progress: bool,
    print_reports: bool,
}

impl<B: AutodiffBackend> TrainingEngine<B> {
    pub fn new(
        fold: usize,
        hparams: Hyperparameters,
        device: B::Device,
        reporter: EvaluationReporter,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            fold,
            hparams,
            device,
            reporter,
            pool,
            phase: EnginePhase::Initialized,
            global_step: 0,
            show_progress: true,
            print_reports: true,
        }
    }

    /// Disable progress bars and the console epoch report
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self.print_reports = false;
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Optimizer steps taken so far in this fold
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Adam with global-norm clipping and the fold's one-cycle schedule
    ///
    /// The schedule spans `epochs * steps_per_epoch` optimizer steps and
    /// warms up over the first epoch.
    pub fn configure_schedule<M>(
        hparams: &Hyperparameters,
        steps_per_epoch: usize,
    ) -> (impl Optimizer<M, B>, OneCycleSchedule)
    where
        M: AutodiffModule<B>,
    {
        let mut config = AdamConfig::new();
        if let Some(clip) = hparams.grad_clip {
            config = config.with_grad_clipping(Some(GradientClippingConfig::Norm(clip)));
        }
        let schedule = OneCycleSchedule::from_hparams(hparams, steps_per_epoch);
        (config.init::<B, M>(), schedule)
    }

    /// Mean binary cross-entropy of the logits against the thermometer targets
    pub fn training_step<M: GradingModel<B>>(&self, model: &M, batch: &TileBatch<B>) -> Tensor<B, 1> {
        let logits = model.forward(batch.images.clone());
        BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits, batch.targets.clone())
    }

    /// Continuous grade estimate (sum of sigmoids) and ground truth for one batch
    pub fn validation_step<I>(&self, model: &I, batch: TileBatch<B>) -> Result<StepOutput>
    where
        I: GradingModel<B::InnerBackend>,
    {
        let logits = model.forward(batch.images.inner());
        let device = logits.device();
        let targets = Tensor::<B::InnerBackend, 2, Int>::from_data(batch.targets.into_data(), &device);

        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device)
            .forward(logits.clone(), targets.clone());
        let loss: f64 = loss.into_scalar().elem();

        let scores = read_floats(sigmoid(logits).sum_dim(1))?;
        let ground_truth = read_floats(targets.float().sum_dim(1))?
            .into_iter()
            .map(|v| v.round().max(0.0) as usize)
            .collect();

        Ok(StepOutput {
            indices: batch.indices,
            scores,
            ground_truth,
            providers: batch.providers,
            loss,
        })
    }

    /// No-gradient pass over `source` in table order
    pub fn predict<I>(&self, model: &I, source: Arc<TileDataset>) -> Result<EpochAggregate>
    where
        I: GradingModel<B::InnerBackend>,
    {
        let batcher = TileBatcher::<B>::new(source.n_tiles(), source.tile_size());
        let loader = BatchLoader::sequential(source, self.hparams.batch_size, Arc::clone(&self.pool));
        let progress = self.progress_bar(loader.num_batches(), "val");

        let mut outputs = Vec::with_capacity(loader.num_batches());
        for items in loader {
            let batch = batcher.batch(items?, &self.device);
            outputs.push(self.validation_step(model, batch)?);
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(self.reporter.aggregate(outputs))
    }

    /// Run every epoch of the fold
    ///
    /// Returns the model as it stands after the last epoch; the best
    /// weights live in `store`.
    pub fn fit<M>(
        &mut self,
        mut model: M,
        sampler: &TileSetSampler,
        store: &mut CheckpointStore,
        sink: &mut dyn TrackingSink,
    ) -> Result<(M, FoldOutcome)>
    where
        M: AutodiffModule<B> + GradingModel<B>,
        M::InnerModule: GradingModel<B::InnerBackend>,
    {
        if self.phase != EnginePhase::Initialized {
            return Err(GradingError::Config(format!(
                "fold {} engine already used ({:?})",
                self.fold, self.phase
            )));
        }

        let steps_per_epoch = self.hparams.steps_per_epoch(sampler.train_len());
        let (mut optimizer, mut schedule) = Self::configure_schedule::<M>(&self.hparams, steps_per_epoch);
        info!("Fold {}: {}", self.fold + 1, schedule.description());

        let mut logger = TrainingLogger::new(self.fold, self.hparams.epochs);
        let mut summaries = Vec::with_capacity(self.hparams.epochs);
        let mut best_kappa = f64::NEG_INFINITY;

        for epoch in 0..self.hparams.epochs {
            self.phase = EnginePhase::Training(epoch);

            // a fresh source every epoch, drawn from the epoch's generator
            let source = sampler.next_training_source(epoch);
            let variant = source.variant().id;
            logger.start_epoch(epoch, variant);

            let mut rng = sampler.epoch_rng(epoch);
            rng.set_stream(1);

            let (trained, train_loss) =
                self.train_epoch(model, source, &mut optimizer, &mut schedule, &mut rng, sink)?;
            model = trained;
            sink.log_scalar("avg_train_loss", train_loss, self.global_step)?;

            let aggregate = self.predict(&model.valid(), sampler.validation_source())?;
            let report = self.reporter.score(&aggregate)?;
            let lr = schedule.current_lr();
            if self.print_reports {
                self.reporter.print(&report, epoch, lr);
            }
            self.reporter.emit(&report, sink, self.global_step)?;

            let is_best = store.save::<B, M>(&model, report.kappa(), epoch)?;
            if report.kappa() > best_kappa {
                best_kappa = report.kappa();
                logger.log_new_best(best_kappa);
            }
            logger.end_epoch(train_loss, report.kappa(), lr);

            summaries.push(EpochSummary {
                epoch,
                variant,
                train_loss,
                val_loss: report.avg_loss,
                kappa: report.kappa(),
                lr,
                is_best,
            });
        }

        self.phase = EnginePhase::Completed;
        logger.log_complete(best_kappa);

        Ok((
            model,
            FoldOutcome {
                fold: self.fold,
                epochs: summaries,
                global_step: self.global_step,
            },
        ))
    }

    /// One pass over `source`, returning the updated model and mean batch loss
    fn train_epoch<M, O>(
        &mut self,
        mut model: M,
        source: Arc<TileDataset>,
        optimizer: &mut O,
        schedule: &mut OneCycleSchedule,
        rng: &mut rand_chacha::ChaCha8Rng,
        sink: &mut dyn TrackingSink,
    ) -> Result<(M, f64)>
    where
        M: AutodiffModule<B> + GradingModel<B>,
        O: Optimizer<M, B>,
    {
        let accumulate = self.hparams.accumulate.max(1);
        let batcher = TileBatcher::<B>::new(source.n_tiles(), source.tile_size());
        let loader = BatchLoader::shuffled(source, self.hparams.batch_size, rng, Arc::clone(&self.pool));
        let num_batches = loader.num_batches();
        let progress = self.progress_bar(num_batches, "train");

        let mut accumulator = GradientsAccumulator::<M>::new();
        let mut pending = 0;
        let mut loss_sum = 0.0;

        for (batch_idx, items) in loader.enumerate() {
            let batch = batcher.batch(items?, &self.device);
            let loss = self.training_step(&model, &batch);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            loss_sum += loss_value;

            let loss = if accumulate > 1 {
                loss.div_scalar(accumulate as f64)
            } else {
                loss
            };
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            accumulator.accumulate(&model, grads);
            pending += 1;

            // the trailing partial group still gets its update
            if pending == accumulate || batch_idx + 1 == num_batches {
                let lr = schedule.current_lr();
                model = optimizer.step(lr, model, accumulator.grads());
                schedule.step();
                self.global_step += 1;
                pending = 0;
                sink.log_scalar("lr", lr, self.global_step)?;
            }

            progress.inc(1);
            progress.set_message(format!("loss {:.4}", loss_value));
        }
        progress.finish_and_clear();

        if num_batches == 0 {
            return Err(GradingError::Dataset(format!(
                "fold {} has no training batches",
                self.fold
            )));
        }
        let avg_loss = loss_sum / num_batches as f64;
        debug!("Fold {} train loss {:.4} over {} batches", self.fold, avg_loss, num_batches);
        Ok((model, avg_loss))
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("  {prefix:>5} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress.set_style(style);
        progress.set_prefix(label.to_string());
        progress
    }
}

fn read_floats<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GradingError::Tensor(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::loader::worker_pool;
    use crate::dataset::sampler::SamplerOptions;
    use crate::dataset::table::Example;
    use crate::dataset::tiles::tests::{example, write_tiles};
    use crate::dataset::tiles::TileSetVariant;
    use crate::model::{TilePoolingClassifier, TilePoolingClassifierConfig};
    use crate::utils::tracking::MemoryTracker;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    const N_TILES: usize = 2;
    const TILE_SIZE: usize = 8;

    fn hparams(epochs: usize) -> Hyperparameters {
        Hyperparameters {
            n_tiles: N_TILES,
            tile_size: TILE_SIZE,
            batch_size: 2,
            accumulate: 2,
            epochs,
            num_workers: 2,
            ..Hyperparameters::default()
        }
    }

    fn engine(hp: Hyperparameters) -> TrainingEngine<TestBackend> {
        TrainingEngine::new(
            0,
            hp,
            Default::default(),
            EvaluationReporter::new(vec!["radboud".to_string(), "karolinska".to_string()]),
            worker_pool(2).unwrap(),
        )
        .quiet()
    }

    fn tiny_model() -> TilePoolingClassifier<TestBackend> {
        TilePoolingClassifierConfig::new()
            .with_base_filters(2)
            .with_hidden_size(4)
            .init(&Default::default())
    }

    /// Four training rows in fold 1, four validation rows in fold 0
    fn examples() -> Vec<Example> {
        vec![
            example("v0", 0, "radboud", 0),
            example("v1", 2, "karolinska", 0),
            example("v2", 4, "radboud", 0),
            example("v3", 5, "karolinska", 0),
            example("t0", 1, "radboud", 1),
            example("t1", 3, "karolinska", 1),
            example("t2", 5, "radboud", 1),
            example("t3", 0, "karolinska", 1),
        ]
    }

    fn sampler(dir: &TempDir) -> TileSetSampler {
        sampler_over(dir, examples())
    }

    fn sampler_over(dir: &TempDir, all: Vec<Example>) -> TileSetSampler {
        for id in [0, 1] {
            write_tiles(&TileSetVariant::new(dir.path(), id), &all, N_TILES, TILE_SIZE as u32);
        }
        let indexed: Vec<(usize, Example)> = all.into_iter().enumerate().collect();
        let (val, train): (Vec<_>, Vec<_>) = indexed.into_iter().partition(|(_, e)| e.fold == 0);

        let options = SamplerOptions {
            variants: vec![0, 1],
            n_tiles: N_TILES,
            tile_size: TILE_SIZE,
            augment_base_variant: true,
            seed: 2020,
        };
        TileSetSampler::new(dir.path(), 0, train, val, &options).unwrap()
    }

    #[test]
    fn test_configure_schedule_spans_all_epochs() {
        let (_, schedule) =
            TrainingEngine::<TestBackend>::configure_schedule::<TilePoolingClassifier<TestBackend>>(
                &Hyperparameters::default(),
                50,
            );
        assert_eq!(schedule.total_steps, 1500);
        assert!((schedule.initial_lr() - 3e-5).abs() < 1e-12);
        assert!((schedule.lr_at(49) - 3e-4).abs() < 1e-12);
    }

    #[test]
    fn test_training_step_loss_is_finite_scalar() {
        let device = Default::default();
        let engine = engine(hparams(1));
        let model = tiny_model();
        let batch = TileBatch::<TestBackend> {
            indices: vec![0, 1],
            images: Tensor::zeros([2, N_TILES, 3, TILE_SIZE, TILE_SIZE], &device),
            targets: Tensor::from_data(
                TensorData::new(vec![1i64, 1, 0, 0, 0, 0, 0, 0, 0, 0], [2, 5]),
                &device,
            ),
            providers: vec!["radboud".to_string(), "karolinska".to_string()],
        };

        let loss = engine.training_step(&model, &batch);
        assert_eq!(loss.dims(), [1]);
        let value: f64 = loss.into_scalar().elem();
        assert!(value.is_finite() && value > 0.0);
    }

    #[test]
    fn test_training_step_backpropagates_through_tile_pooling() {
        let device = Default::default();
        let engine = engine(hparams(1));
        let model = tiny_model();
        let batch = TileBatch::<TestBackend> {
            indices: vec![0, 1],
            images: Tensor::random(
                [2, N_TILES, 3, TILE_SIZE, TILE_SIZE],
                burn::tensor::Distribution::Default,
                &device,
            ),
            targets: Tensor::from_data(
                TensorData::new(vec![1i64, 1, 1, 0, 0, 1, 0, 0, 0, 0], [2, 5]),
                &device,
            ),
            providers: vec!["radboud".to_string(), "karolinska".to_string()],
        };

        let grads = GradientsParams::from_grads(engine.training_step(&model, &batch).backward(), &model);
        assert!(!grads.is_empty());
    }

    #[test]
    fn test_validation_step_scores_and_ground_truth() {
        let device = Default::default();
        let engine = engine(hparams(1));
        let model = tiny_model().valid();
        let batch = TileBatch::<TestBackend> {
            indices: vec![7, 3],
            images: Tensor::ones([2, N_TILES, 3, TILE_SIZE, TILE_SIZE], &device),
            targets: Tensor::from_data(
                TensorData::new(vec![1i64, 1, 1, 0, 0, 1, 1, 1, 1, 1], [2, 5]),
                &device,
            ),
            providers: vec!["karolinska".to_string(), "radboud".to_string()],
        };

        let output = engine.validation_step(&model, batch).unwrap();
        assert_eq!(output.indices, vec![7, 3]);
        assert_eq!(output.ground_truth, vec![3, 5]);
        assert_eq!(output.providers, vec!["karolinska", "radboud"]);
        assert!(output.scores.iter().all(|s| (0.0..=5.0).contains(s)));
        assert!(output.loss.is_finite());
    }

    #[test]
    fn test_fit_runs_every_epoch_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let sampler = sampler(&dir);
        let mut store = CheckpointStore::open(&dir.path().join("fold_1")).unwrap();
        let mut tracker = MemoryTracker::default();

        let mut engine = engine(hparams(2));
        assert_eq!(engine.phase(), EnginePhase::Initialized);
        let (_model, outcome) = engine
            .fit(tiny_model(), &sampler, &mut store, &mut tracker)
            .unwrap();

        assert_eq!(engine.phase(), EnginePhase::Completed);
        assert_eq!(outcome.epochs.len(), 2);
        // 4 rows, batch 2, accumulate 2: one optimizer step per epoch
        assert_eq!(outcome.global_step, 2);
        assert!(outcome.epochs.iter().all(|e| e.variant <= 1));
        assert!(store.best().is_some());
        assert!(store.best_path().is_ok());

        assert!(tracker.scalar("avg_train_loss").is_some());
        assert!(tracker.scalar("kappa_radboud").is_some());
        let lr_steps: Vec<usize> = tracker
            .scalars
            .iter()
            .filter(|(n, _, _)| n == "lr")
            .map(|(_, _, s)| *s)
            .collect();
        assert_eq!(lr_steps, vec![1, 2]);
    }

    #[test]
    fn test_trailing_partial_group_takes_a_step() {
        let dir = TempDir::new().unwrap();
        let mut all = vec![example("v0", 1, "radboud", 0), example("v1", 4, "karolinska", 0)];
        for i in 0..6 {
            let provider = if i % 2 == 0 { "radboud" } else { "karolinska" };
            all.push(example(&format!("t{}", i), i % 6, provider, 1));
        }
        let sampler = sampler_over(&dir, all);
        let mut store = CheckpointStore::open(&dir.path().join("fold_1")).unwrap();
        let mut tracker = MemoryTracker::default();

        // 6 rows, batch 2: three batches, the last one alone in its group
        let hp = hparams(1);
        assert_eq!(hp.steps_per_epoch(sampler.train_len()), 1);
        let mut engine = engine(hp.clone());
        let (_model, outcome) = engine
            .fit(tiny_model(), &sampler, &mut store, &mut tracker)
            .unwrap();
        assert_eq!(outcome.global_step, 2);

        let lr: Vec<(f64, usize)> = tracker
            .scalars
            .iter()
            .filter(|(n, _, _)| n == "lr")
            .map(|(_, v, s)| (*v, *s))
            .collect();
        assert_eq!(lr.iter().map(|(_, s)| *s).collect::<Vec<_>>(), vec![1, 2]);
        // the overrun step holds the schedule's final rate
        assert!((lr[0].0 - hp.init_lr).abs() < 1e-12);
        assert!((lr[1].0 - lr[0].0).abs() < 1e-12);
    }

    #[test]
    fn test_engine_is_single_use() {
        let dir = TempDir::new().unwrap();
        let sampler = sampler(&dir);
        let mut store = CheckpointStore::open(&dir.path().join("ckpt")).unwrap();
        let mut tracker = MemoryTracker::default();

        let mut engine = engine(hparams(1));
        engine.fit(tiny_model(), &sampler, &mut store, &mut tracker).unwrap();
        assert!(engine
            .fit(tiny_model(), &sampler, &mut store, &mut tracker)
            .is_err());
    }

    #[test]
    fn test_predict_keeps_table_order() {
        let dir = TempDir::new().unwrap();
        let all = examples();
        let variant = TileSetVariant::new(dir.path(), 0);
        write_tiles(&variant, &all, N_TILES, TILE_SIZE as u32);
        let source = Arc::new(TileDataset::new(
            variant,
            all.into_iter().enumerate().collect(),
            N_TILES,
            TILE_SIZE,
            AugmentationConfig::none(),
        ));

        let aggregate = engine(hparams(1))
            .predict(&tiny_model().valid(), source)
            .unwrap();
        assert_eq!(aggregate.indices, (0..8).collect::<Vec<_>>());
        assert_eq!(aggregate.ground_truth, vec![0, 2, 4, 5, 1, 3, 5, 0]);
    }
}
