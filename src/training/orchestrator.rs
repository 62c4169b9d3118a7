//! Cross-validation driver
//!
//! Seeds the backend, splits the label table into folds, then trains the
//! folds one after another. After each fold the best checkpoint is reloaded
//! and the validation set scored once more; its rows go to
//! `fold{n}_preds.csv` in the run directory next to `hparams.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use chrono::Local;
use colored::Colorize;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ExperimentConfig, Hyperparameters};
use crate::dataset::folds::{FoldAssignment, FoldSplitter};
use crate::dataset::loader::worker_pool;
use crate::dataset::sampler::{SamplerOptions, TileSetSampler};
use crate::dataset::table::{Example, LabelTable};
use crate::model::GradingModel;
use crate::training::checkpoint::CheckpointStore;
use crate::training::engine::{FoldOutcome, TrainingEngine};
use crate::training::reporter::{EpochAggregate, EvaluationReporter, GroupScore};
use crate::utils::error::{GradingError, Result};
use crate::utils::format_duration;
use crate::utils::tracking::FileTracker;

/// One row of a fold prediction file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    /// Row index in the label table
    pub val_idx: usize,
    /// Continuous grade estimate
    pub preds: f32,
    /// Grade recovered from the thermometer target
    pub gt: usize,
}

/// Run-level configuration snapshot written to `hparams.json`
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub name: String,
    pub seed: u64,
    pub backend: String,
    pub variants: Vec<usize>,
    pub augment_base_variant: bool,
    pub providers: Vec<String>,
    pub fold_count: usize,
    pub started_at: String,
    pub hparams: Hyperparameters,
}

/// What a finished fold left behind
#[derive(Debug, Clone)]
pub struct FoldResult {
    pub fold: usize,
    pub best_epoch: usize,
    pub best_kappa: f64,
    pub predictions_path: PathBuf,
    pub outcome: FoldOutcome,
}

/// Summary of a completed cross-validation run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub folds: Vec<FoldResult>,
    pub elapsed_secs: f64,
}

/// Top-level driver for one experiment
pub struct ExperimentOrchestrator {
    config: ExperimentConfig,
    quiet: bool,
}

impl ExperimentOrchestrator {
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            quiet: false,
        })
    }

    /// Suppress progress bars and console epoch reports
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Train every fold in order
    ///
    /// `model_factory` builds a freshly initialised model; it is called once
    /// per fold for training and once more to receive the best weights.
    pub fn run<B, M, F>(&self, device: &B::Device, model_factory: F) -> Result<RunSummary>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + GradingModel<B>,
        M::InnerModule: GradingModel<B::InnerBackend>,
        F: Fn(&B::Device) -> M,
    {
        let start = Instant::now();
        B::seed(self.config.seed);

        let table = LabelTable::from_csv(&self.config.csv_path)?;
        let fold_count = table.fold_count();
        // fold-id errors abort before anything is trained
        let folds = FoldSplitter::split(table.examples(), fold_count)?;

        let run_dir = self.create_run_dir()?;
        self.write_snapshot(&run_dir, fold_count)?;
        let pool = worker_pool(self.config.hparams.num_workers)?;

        let mut results = Vec::with_capacity(folds.len());
        for assignment in &folds {
            if !self.quiet {
                println!("{}", format!("Fold {}", assignment.fold + 1).green().bold());
            }
            let result = self.run_fold::<B, M, F>(
                &table,
                assignment,
                &run_dir,
                device,
                &model_factory,
                Arc::clone(&pool),
            )?;
            results.push(result);
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            "Run {:?} finished {} folds in {}",
            run_dir,
            results.len(),
            format_duration(elapsed_secs)
        );

        Ok(RunSummary {
            run_dir,
            folds: results,
            elapsed_secs,
        })
    }

    fn run_fold<B, M, F>(
        &self,
        table: &LabelTable,
        assignment: &FoldAssignment,
        run_dir: &Path,
        device: &B::Device,
        model_factory: &F,
        pool: Arc<ThreadPool>,
    ) -> Result<FoldResult>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + GradingModel<B>,
        M::InnerModule: GradingModel<B::InnerBackend>,
        F: Fn(&B::Device) -> M,
    {
        let fold = assignment.fold;
        let fold_start = Instant::now();
        let fold_dir = run_dir.join(format!("fold_{}", fold + 1));

        let sampler = TileSetSampler::new(
            &self.config.train_path(),
            fold,
            indexed(table, &assignment.train_indices),
            indexed(table, &assignment.val_indices),
            &self.sampler_options(),
        )?;
        info!(
            "Fold {}: {} train / {} validation examples, {} tile-set variants",
            fold + 1,
            assignment.train_indices.len(),
            assignment.val_indices.len(),
            sampler.variant_count()
        );

        let mut store = CheckpointStore::open(&fold_dir)?;
        let mut tracker = FileTracker::new(&fold_dir)?;
        let mut engine = TrainingEngine::<B>::new(
            fold,
            self.config.hparams.clone(),
            device.clone(),
            EvaluationReporter::new(self.config.providers.clone()),
            pool,
        );
        if self.quiet {
            engine = engine.quiet();
        }

        let (last, outcome) = engine.fit(model_factory(device), &sampler, &mut store, &mut tracker)?;
        drop(last);

        // the best checkpoint, not the last epoch, produces the fold output
        let best = store
            .best()
            .cloned()
            .ok_or_else(|| GradingError::CheckpointNotFound(fold_dir.clone()))?;
        let model = store.load_best::<B, M>(model_factory(device), device)?;
        let aggregate = engine.predict(&model.valid(), sampler.validation_source())?;

        let predictions_path = run_dir.join(format!("fold{}_preds.csv", fold + 1));
        write_predictions(&predictions_path, &aggregate)?;
        info!(
            "Fold {} done in {}: best epoch {} (kappa {:.4}), predictions in {:?}",
            fold + 1,
            format_duration(fold_start.elapsed().as_secs_f64()),
            best.epoch,
            best.kappa,
            predictions_path
        );

        Ok(FoldResult {
            fold,
            best_epoch: best.epoch,
            best_kappa: best.kappa,
            predictions_path,
            outcome,
        })
    }

    fn sampler_options(&self) -> SamplerOptions {
        SamplerOptions {
            variants: self.config.variants.clone(),
            n_tiles: self.config.hparams.n_tiles,
            tile_size: self.config.hparams.tile_size,
            augment_base_variant: self.config.augment_base_variant,
            seed: self.config.seed,
        }
    }

    /// `{output_dir}/{name}-{YYYYmmdd-HHMMSS}`
    fn create_run_dir(&self) -> Result<PathBuf> {
        let date = Local::now().format("%Y%m%d-%H%M%S");
        let run_dir = self
            .config
            .output_dir
            .join(format!("{}-{}", self.config.name, date));
        std::fs::create_dir_all(&run_dir)?;
        Ok(run_dir)
    }

    fn write_snapshot(&self, run_dir: &Path, fold_count: usize) -> Result<()> {
        let snapshot = RunSnapshot {
            name: self.config.name.clone(),
            seed: self.config.seed,
            backend: crate::backend::backend_name().to_string(),
            variants: self.config.variants.clone(),
            augment_base_variant: self.config.augment_base_variant,
            providers: self.config.providers.clone(),
            fold_count,
            started_at: Local::now().to_rfc3339(),
            hparams: self.config.hparams.clone(),
        };
        std::fs::write(
            run_dir.join("hparams.json"),
            serde_json::to_string_pretty(&snapshot)?,
        )?;
        Ok(())
    }
}

fn indexed(table: &LabelTable, indices: &[usize]) -> Vec<(usize, Example)> {
    indices
        .iter()
        .zip(table.subset(indices))
        .map(|(&index, example)| (index, example))
        .collect()
}

/// Write `val_idx,preds,gt` rows in validation order
pub fn write_predictions(path: &Path, aggregate: &EpochAggregate) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for ((&val_idx, &preds), &gt) in aggregate
        .indices
        .iter()
        .zip(&aggregate.predictions)
        .zip(&aggregate.ground_truth)
    {
        writer.serialize(PredictionRow { val_idx, preds, gt })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<PredictionRow>() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Out-of-fold agreement of a finished run
#[derive(Debug, Clone)]
pub struct OutOfFoldScore {
    pub files: usize,
    pub overall: GroupScore,
    pub providers: Vec<GroupScore>,
}

/// Score every `fold*_preds.csv` in `run_dir` against the label table
///
/// Providers listed in `providers` but absent from the predictions are
/// reported as `InsufficientData`.
pub fn score_run(run_dir: &Path, table: &LabelTable, providers: &[String]) -> Result<OutOfFoldScore> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(run_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("fold") && name.ends_with("_preds.csv"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(GradingError::Dataset(format!(
            "no fold prediction files in {:?}",
            run_dir
        )));
    }

    let mut aggregate = EpochAggregate::default();
    for path in &files {
        for row in read_predictions(path)? {
            let example = table.get(row.val_idx).ok_or_else(|| {
                GradingError::Dataset(format!(
                    "{:?}: row index {} outside the label table",
                    path, row.val_idx
                ))
            })?;
            aggregate.indices.push(row.val_idx);
            aggregate.predictions.push(row.preds);
            aggregate.ground_truth.push(row.gt);
            aggregate.providers.push(example.provider.clone());
        }
    }

    let report = EvaluationReporter::new(providers.to_vec()).score(&aggregate)?;
    Ok(OutOfFoldScore {
        files: files.len(),
        overall: report.overall,
        providers: report.providers,
    })
}

impl OutOfFoldScore {
    /// Write the overall confusion matrix to `{run_dir}/oof_confusion.csv`
    pub fn save_confusion(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join("oof_confusion.csv");
        self.overall.confusion.save_csv(&path)?;
        Ok(path)
    }

    pub fn print(&self) {
        println!(
            "{}",
            format!(
                "Out-of-fold kappa over {} folds ({} examples): {:.4}",
                self.files, self.overall.count, self.overall.kappa
            )
            .yellow()
            .bold()
        );
        print!("{}", self.overall.confusion.display());
        for group in &self.providers {
            println!("kappa {}: {:.4} ({} examples)", group.name, group.kappa, group.count);
        }
    }
}
