//! Training module
//!
//! - `scheduler`: one-cycle learning rate schedule
//! - `reporter`: validation aggregation, kappa scoring and reporting
//! - `checkpoint`: per-fold checkpoint store with a best pointer
//! - `engine`: the per-fold epoch loop
//! - `orchestrator`: the cross-validation driver and prediction files

pub mod checkpoint;
pub mod engine;
pub mod orchestrator;
pub mod reporter;
pub mod scheduler;

pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use engine::{EnginePhase, EpochSummary, FoldOutcome, TrainingEngine};
pub use orchestrator::{score_run, ExperimentOrchestrator, PredictionRow, RunSummary};
pub use reporter::{EpochAggregate, EvaluationReporter, Report, StepOutput};
pub use scheduler::{AnnealStrategy, OneCycleSchedule};
