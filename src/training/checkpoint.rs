//! Checkpoint store with an explicit best pointer
//!
//! Each fold directory holds model weights named
//! `epoch={epoch:02}-kappa={kappa:.4}.mpk` and a `checkpoints.json` index.
//! The index records every kept checkpoint and which one is best: highest
//! kappa, ties going to the most recent save.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::{GradingError, Result};

const INDEX_FILE: &str = "checkpoints.json";
/// Extension added by `CompactRecorder`
const WEIGHTS_EXTENSION: &str = "mpk";

/// One saved checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    pub kappa: f64,
    pub timestamp: DateTime<Utc>,
    /// File stem inside the store directory
    pub name: String,
}

impl CheckpointRecord {
    pub fn new(epoch: usize, kappa: f64) -> Self {
        Self {
            epoch,
            kappa,
            timestamp: Utc::now(),
            name: format!("epoch={:02}-kappa={:.4}", epoch, kappa),
        }
    }

    /// Ranking used for the best pointer: kappa, then timestamp, then epoch
    fn rank(&self, other: &Self) -> Ordering {
        self.kappa
            .total_cmp(&other.kappa)
            .then(self.timestamp.cmp(&other.timestamp))
            .then(self.epoch.cmp(&other.epoch))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    records: Vec<CheckpointRecord>,
    best: Option<String>,
}

/// Pick the best record: maximum kappa, latest timestamp on ties
pub fn select_best(records: &[CheckpointRecord]) -> Option<&CheckpointRecord> {
    records.iter().max_by(|a, b| a.rank(b))
}

/// Per-fold checkpoint directory
pub struct CheckpointStore {
    dir: PathBuf,
    keep_top_k: usize,
    index: StoreIndex,
}

impl CheckpointStore {
    /// Open (or create) a store, reading an existing index
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            StoreIndex::default()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            keep_top_k: 1,
            index,
        })
    }

    /// How many checkpoints to keep on disk (0 keeps all)
    pub fn keep_top_k(mut self, k: usize) -> Self {
        self.keep_top_k = k;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.index.records
    }

    pub fn best(&self) -> Option<&CheckpointRecord> {
        let name = self.index.best.as_ref()?;
        self.index.records.iter().find(|r| &r.name == name)
    }

    /// Whether a checkpoint with this kappa would be kept
    pub fn would_keep(&self, kappa: f64) -> bool {
        if self.keep_top_k == 0 || self.index.records.len() < self.keep_top_k {
            return true;
        }
        // a newer checkpoint wins ties, so equal kappa still qualifies
        self.index.records.iter().any(|r| kappa >= r.kappa)
    }

    /// Save `model` for `epoch` if it ranks among the kept checkpoints
    ///
    /// Returns true when the saved checkpoint became the new best.
    pub fn save<B: Backend, M: Module<B>>(&mut self, model: &M, kappa: f64, epoch: usize) -> Result<bool> {
        if !self.would_keep(kappa) {
            debug!("Epoch {} (kappa {:.4}) not kept", epoch, kappa);
            return Ok(false);
        }

        let record = CheckpointRecord::new(epoch, kappa);
        // full file name, the stem itself contains a '.'
        let path = self.weights_path(&record);
        model
            .clone()
            .save_file(&path, &CompactRecorder::new())
            .map_err(|e| GradingError::Checkpoint(format!("failed to save {:?}: {:?}", path, e)))?;

        let is_best = self.push_record(record.clone())?;
        info!("Checkpoint saved to {:?}{}", path, if is_best { " (best)" } else { "" });
        Ok(is_best)
    }

    /// Add a record whose weights are already on disk
    fn push_record(&mut self, record: CheckpointRecord) -> Result<bool> {
        let name = record.name.clone();
        self.index.records.retain(|r| r.name != name);
        self.index.records.push(record);
        self.prune()?;

        let best = select_best(&self.index.records).map(|r| r.name.clone());
        let is_best = best.as_deref() == Some(name.as_str());
        self.index.best = best;
        self.write_index()?;
        Ok(is_best)
    }

    /// Drop the lowest-ranked checkpoints beyond `keep_top_k`
    fn prune(&mut self) -> Result<()> {
        if self.keep_top_k == 0 {
            return Ok(());
        }
        self.index.records.sort_by(|a, b| b.rank(a));
        while self.index.records.len() > self.keep_top_k {
            if let Some(dropped) = self.index.records.pop() {
                let path = self.weights_path(&dropped);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                debug!("Removed checkpoint {:?}", path);
            }
        }
        Ok(())
    }

    fn write_index(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.index)?;
        fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(())
    }

    pub fn weights_path(&self, record: &CheckpointRecord) -> PathBuf {
        self.dir.join(format!("{}.{}", record.name, WEIGHTS_EXTENSION))
    }

    /// Weights file of the best checkpoint
    pub fn best_path(&self) -> Result<PathBuf> {
        let best = self
            .best()
            .ok_or_else(|| GradingError::CheckpointNotFound(self.dir.clone()))?;
        let path = self.weights_path(best);
        if !path.exists() {
            return Err(GradingError::CheckpointNotFound(path));
        }
        Ok(path)
    }

    /// Load the best checkpoint into `model`
    pub fn load_best<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> Result<M> {
        let path = self.best_path()?;
        let best = self.best().map(|r| (r.epoch, r.kappa)).unwrap_or_default();
        info!(
            "Loading best checkpoint {:?} (epoch {}, kappa {:.4})",
            path, best.0, best.1
        );
        model
            .load_file(&path, &CompactRecorder::new(), device)
            .map_err(|e| GradingError::Checkpoint(format!("failed to load {:?}: {:?}", path, e)))
    }
}
