//! Validation reporting
//!
//! Collects per-batch validation outputs into one epoch aggregate, scores it
//! (overall and per provider) and emits the console report plus tracked
//! scalars and confusion-matrix images.

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::dataset::labels::{LabelCodec, NUM_GRADES};
use crate::utils::charts::{render_confusion_matrix, CM_IMAGE_SIZE};
use crate::utils::error::{GradingError, Result};
use crate::utils::metrics::ConfusionMatrix;
use crate::utils::tracking::TrackingSink;

/// What one validation batch produces
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Label-table indices of the batch rows
    pub indices: Vec<usize>,
    /// Sum of sigmoids per row, continuous grade estimate
    pub scores: Vec<f32>,
    /// Grades recovered from the thermometer targets
    pub ground_truth: Vec<usize>,
    pub providers: Vec<String>,
    /// Mean loss of the batch
    pub loss: f64,
}

/// Everything one validation epoch produced, concatenated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochAggregate {
    pub avg_loss: f64,
    pub indices: Vec<usize>,
    pub predictions: Vec<f32>,
    pub ground_truth: Vec<usize>,
    pub providers: Vec<String>,
}

impl EpochAggregate {
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

/// Kappa and confusion matrix for one group of examples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupScore {
    pub name: String,
    pub kappa: f64,
    pub confusion: ConfusionMatrix,
    pub count: usize,
}

impl GroupScore {
    fn from_grades(name: &str, truth: &[usize], predicted: &[usize]) -> Self {
        let confusion = ConfusionMatrix::from_predictions(predicted, truth, NUM_GRADES);
        Self {
            name: name.to_string(),
            kappa: confusion.quadratic_weighted_kappa(),
            count: truth.len(),
            confusion,
        }
    }
}

/// Scored validation epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub avg_loss: f64,
    pub overall: GroupScore,
    pub providers: Vec<GroupScore>,
}

impl Report {
    pub fn kappa(&self) -> f64 {
        self.overall.kappa
    }

    pub fn provider(&self, name: &str) -> Option<&GroupScore> {
        self.providers.iter().find(|group| group.name == name)
    }
}

/// Aggregates and scores validation epochs for a fixed provider list
#[derive(Debug, Clone)]
pub struct EvaluationReporter {
    providers: Vec<String>,
}

impl EvaluationReporter {
    pub fn new(providers: Vec<String>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    /// Concatenate batch outputs; loss is the mean of batch losses
    pub fn aggregate(&self, outputs: Vec<StepOutput>) -> EpochAggregate {
        let batches = outputs.len();
        let mut aggregate = EpochAggregate::default();
        let mut loss_sum = 0.0;

        for output in outputs {
            loss_sum += output.loss;
            aggregate.indices.extend(output.indices);
            aggregate.predictions.extend(output.scores);
            aggregate.ground_truth.extend(output.ground_truth);
            aggregate.providers.extend(output.providers);
        }

        aggregate.avg_loss = if batches > 0 {
            loss_sum / batches as f64
        } else {
            0.0
        };
        aggregate
    }

    /// Round predictions and compute kappa plus confusion matrices
    ///
    /// Fails with `InsufficientData` when a configured provider has no rows.
    pub fn score(&self, aggregate: &EpochAggregate) -> Result<Report> {
        if aggregate.is_empty() {
            return Err(GradingError::Dataset(
                "cannot score an empty validation epoch".to_string(),
            ));
        }

        let predicted: Vec<usize> = aggregate
            .predictions
            .iter()
            .map(|&score| LabelCodec::round_score(score))
            .collect();
        let overall = GroupScore::from_grades("overall", &aggregate.ground_truth, &predicted);

        let mut providers = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let (truth, preds): (Vec<usize>, Vec<usize>) = aggregate
                .providers
                .iter()
                .zip(aggregate.ground_truth.iter().zip(predicted.iter()))
                .filter(|(p, _)| *p == provider)
                .map(|(_, (&t, &p))| (t, p))
                .unzip();

            if truth.is_empty() {
                return Err(GradingError::InsufficientData {
                    provider: provider.clone(),
                });
            }
            providers.push(GroupScore::from_grades(provider, &truth, &preds));
        }

        Ok(Report {
            avg_loss: aggregate.avg_loss,
            overall,
            providers,
        })
    }

    /// Console report for one validation epoch
    pub fn print(&self, report: &Report, epoch: usize, lr: f64) {
        println!("lr: {:.7}", lr);
        println!("{}", "CM".cyan().bold());
        print!("{}", report.overall.confusion.display());
        println!(
            "{}",
            format!(
                "Epoch {}: {:.2}, kappa: {:.4}",
                epoch, report.avg_loss, report.overall.kappa
            )
            .yellow()
            .bold()
        );
        for group in &report.providers {
            println!("{}", format!("CM {}", group.name).cyan().bold());
            print!("{}", group.confusion.display());
            println!("kappa {}: {:.4}", group.name, group.kappa);
        }
    }

    /// Log scalars and rendered confusion matrices at `step`
    pub fn emit(&self, report: &Report, sink: &mut dyn TrackingSink, step: usize) -> Result<()> {
        sink.log_scalar("val_loss", report.avg_loss, step)?;
        sink.log_scalar("kappa", report.overall.kappa, step)?;
        sink.log_image(
            "CM",
            &render_confusion_matrix(&report.overall.confusion, CM_IMAGE_SIZE),
            step,
        )?;

        for group in &report.providers {
            sink.log_scalar(&format!("kappa_{}", group.name), group.kappa, step)?;
            sink.log_image(
                &format!("CM {}", capitalize(&group.name)),
                &render_confusion_matrix(&group.confusion, CM_IMAGE_SIZE),
                step,
            )?;
        }
        sink.flush()
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
