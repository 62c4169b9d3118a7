//! # ISUP Grading
//!
//! Cross-validated training of an ISUP grade classifier on pre-extracted
//! prostate biopsy tile sets, built on the Burn framework.
//!
//! ## Features
//!
//! - **Thermometer targets**: grade `g` becomes five binary labels, the first `g` set
//! - **Tile-set sampling**: each epoch trains on one of several pre-extracted tile variants
//! - **One-cycle schedule** stepped per optimizer update, with gradient accumulation
//! - **Quadratic-weighted kappa** overall and per data provider, with confusion matrices
//!
//! ## Modules
//!
//! - `dataset`: label table, folds, tile datasets and the prefetching loader
//! - `model`: the `GradingModel` contract and a tile-pooling CNN
//! - `training`: engine, reporter, checkpoints and the cross-validation driver
//! - `utils`: errors, logging, metrics, charts and tracking
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use isup_grading::backend::{default_device, TrainingBackend};
//! use isup_grading::config::ExperimentConfig;
//! use isup_grading::model::TilePoolingClassifierConfig;
//! use isup_grading::training::ExperimentOrchestrator;
//!
//! let config = ExperimentConfig::load("experiment.toml".as_ref())?;
//! let summary = ExperimentOrchestrator::new(config)?
//!     .run::<TrainingBackend, _, _>(&default_device(), |device| {
//!         TilePoolingClassifierConfig::new().init(device)
//!     })?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

pub use config::{ExperimentConfig, Hyperparameters};
pub use dataset::{LabelCodec, LabelTable};
pub use model::{GradingModel, TilePoolingClassifier};
pub use training::{ExperimentOrchestrator, TrainingEngine};
pub use utils::error::{GradingError, Result};
pub use utils::metrics::ConfusionMatrix;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
