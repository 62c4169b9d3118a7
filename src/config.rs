//! Run configuration
//!
//! `Hyperparameters` is the immutable bundle snapshotted next to the fold
//! predictions. `ExperimentConfig` adds where the data lives, where output
//! goes, and the sampling options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils::error::{GradingError, Result};
use crate::utils::logging::LogLevel;

/// Training hyperparameters, fixed for the lifetime of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// Backbone name recorded with the run
    pub backbone: String,
    /// Peak learning rate of the one-cycle schedule
    pub init_lr: f64,
    /// The schedule starts at `init_lr / warmup_factor`
    pub warmup_factor: f64,
    /// Tiles per example
    pub n_tiles: usize,
    /// Slide pyramid level the tiles were extracted at
    pub level: usize,
    pub scale: f64,
    /// Tile edge in pixels
    pub tile_size: usize,
    /// Loader threads
    pub num_workers: usize,
    pub batch_size: usize,
    /// Batches per optimizer step
    pub accumulate: usize,
    pub epochs: usize,
    /// Global gradient norm limit, `None` disables clipping
    pub grad_clip: Option<f32>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            backbone: "efficientnet-b0".to_string(),
            init_lr: 3e-4,
            warmup_factor: 10.0,
            n_tiles: 36,
            level: 2,
            scale: 1.0,
            tile_size: 224,
            num_workers: 8,
            batch_size: 8,
            accumulate: 1,
            epochs: 30,
            grad_clip: Some(1.0),
        }
    }
}

impl Hyperparameters {
    /// Optimizer steps in one epoch over a variant with `examples` rows
    ///
    /// Floor division, as the one-cycle schedule length is derived from it.
    pub fn steps_per_epoch(&self, examples: usize) -> usize {
        examples / self.batch_size.max(1) / self.accumulate.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(GradingError::Config("epochs must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(GradingError::Config("batch_size must be > 0".to_string()));
        }
        if self.accumulate == 0 {
            return Err(GradingError::Config("accumulate must be > 0".to_string()));
        }
        if self.n_tiles == 0 || self.tile_size == 0 {
            return Err(GradingError::Config(
                "n_tiles and tile_size must be > 0".to_string(),
            ));
        }
        if !(self.init_lr > 0.0) {
            return Err(GradingError::Config("init_lr must be positive".to_string()));
        }
        if self.warmup_factor < 1.0 {
            return Err(GradingError::Config(
                "warmup_factor must be >= 1".to_string(),
            ));
        }
        if let Some(clip) = self.grad_clip {
            if clip <= 0.0 {
                return Err(GradingError::Config("grad_clip must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Full experiment configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Run name, prefix of the run directory
    pub name: String,
    /// Directory holding the `train_tiles_*` folders
    pub root_dir: PathBuf,
    /// Label table with a `fold` column
    pub csv_path: PathBuf,
    pub output_dir: PathBuf,
    pub seed: u64,
    /// Tile-set variants drawn from during training. Variant 0 is the base set.
    pub variants: Vec<usize>,
    /// Apply train-time augmentation to variant 0 as well
    pub augment_base_variant: bool,
    /// Providers scored separately; each must appear in every validation fold
    pub providers: Vec<String>,
    pub log_level: LogLevel,
    pub hparams: Hyperparameters,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "efficient0".to_string(),
            root_dir: PathBuf::from("data"),
            csv_path: PathBuf::from("train.csv"),
            output_dir: PathBuf::from("runs"),
            seed: 2020,
            variants: (0..16).collect(),
            augment_base_variant: true,
            providers: vec!["radboud".to_string(), "karolinska".to_string()],
            log_level: LogLevel::Info,
            hparams: Hyperparameters::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `{root}/train_tiles_{size}_{level}_{scale*10}/imgs`
    pub fn train_path(&self) -> PathBuf {
        let hp = &self.hparams;
        self.root_dir
            .join(format!(
                "train_tiles_{}_{}_{}",
                hp.tile_size,
                hp.level,
                (hp.scale * 10.0) as i64
            ))
            .join("imgs")
    }

    pub fn validate(&self) -> Result<()> {
        self.hparams.validate()?;

        if self.variants.is_empty() {
            return Err(GradingError::Config(
                "at least one tile-set variant is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for variant in &self.variants {
            if !seen.insert(*variant) {
                return Err(GradingError::Config(format!(
                    "variant {} listed twice",
                    variant
                )));
            }
        }

        let mut providers = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.is_empty() || !providers.insert(provider.as_str()) {
                return Err(GradingError::Config(format!(
                    "invalid or duplicate provider '{}'",
                    provider
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.variants.len(), 16);
        assert_eq!(config.hparams.epochs, 30);
    }

    #[test]
    fn test_train_path_layout() {
        let config = ExperimentConfig {
            root_dir: PathBuf::from("/data"),
            ..Default::default()
        };
        assert_eq!(
            config.train_path(),
            PathBuf::from("/data/train_tiles_224_2_10/imgs")
        );
    }

    #[test]
    fn test_steps_per_epoch_floor_division() {
        let hp = Hyperparameters {
            batch_size: 8,
            accumulate: 2,
            ..Default::default()
        };
        // 100 / 8 = 12, 12 / 2 = 6
        assert_eq!(hp.steps_per_epoch(100), 6);
        assert_eq!(hp.steps_per_epoch(7), 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ExperimentConfig::default();
        config.hparams.epochs = 0;
        assert!(matches!(config.validate(), Err(GradingError::Config(_))));

        let mut config = ExperimentConfig::default();
        config.variants = vec![];
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.variants = vec![0, 1, 1];
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.providers.push("radboud".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "name = \"quick\"\nseed = 7\nvariants = [0, 3]\n\n[hparams]\nepochs = 2\n",
        )?;

        let config = ExperimentConfig::load(&path)?;
        assert_eq!(config.name, "quick");
        assert_eq!(config.seed, 7);
        assert_eq!(config.variants, vec![0, 3]);
        assert_eq!(config.hparams.epochs, 2);
        assert_eq!(config.hparams.batch_size, 8);

        let saved = dir.path().join("saved.toml");
        config.save(&saved)?;
        let reloaded = ExperimentConfig::load(&saved)?;
        assert_eq!(reloaded.hparams, config.hparams);
        Ok(())
    }
}
