//! Metrics Module for grade agreement
//!
//! - Confusion matrix over ISUP grades (rows = true grade, cols = predicted)
//! - Quadratic-weighted Cohen's kappa

use serde::{Deserialize, Serialize};

/// Square confusion matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Row-major counts, row = actual, column = predicted
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Create confusion matrix from predictions and ground truth
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);

        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }

        cm
    }

    /// Add a single prediction; out-of-range labels are ignored
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            let idx = actual * self.num_classes + predicted;
            self.matrix[idx] += 1;
        }
    }

    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    /// Largest single cell
    pub fn max_count(&self) -> usize {
        self.matrix.iter().copied().max().unwrap_or(0)
    }

    /// Counts per true grade
    pub fn row_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|row| (0..self.num_classes).map(|col| self.get(row, col)).sum())
            .collect()
    }

    /// Counts per predicted grade
    pub fn col_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|col| (0..self.num_classes).map(|row| self.get(row, col)).sum())
            .collect()
    }

    /// Quadratic-weighted kappa of this matrix
    ///
    /// Disagreement weight of cell (i, j) is `(i - j)^2 / (k - 1)^2`. When
    /// chance disagreement is zero (a single grade on both sides) the result
    /// is 1.0 if the matrix has no disagreement and 0.0 otherwise.
    pub fn quadratic_weighted_kappa(&self) -> f64 {
        let k = self.num_classes;
        let total = self.total();
        if k < 2 || total == 0 {
            return 0.0;
        }

        let rows = self.row_sums();
        let cols = self.col_sums();
        let norm = ((k - 1) * (k - 1)) as f64;
        let n = total as f64;

        let mut observed = 0.0;
        let mut expected = 0.0;
        for i in 0..k {
            for j in 0..k {
                let d = i as f64 - j as f64;
                let weight = d * d / norm;
                observed += weight * self.get(i, j) as f64;
                expected += weight * rows[i] as f64 * cols[j] as f64 / n;
            }
        }

        if expected == 0.0 {
            return if observed == 0.0 { 1.0 } else { 0.0 };
        }
        1.0 - observed / expected
    }

    /// Text rendering in the same layout as the CSV export
    pub fn display(&self) -> String {
        let mut output = String::new();
        output.push_str("       ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", col));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>6} ", row));
            for col in 0..self.num_classes {
                output.push_str(&format!("{:>6}", self.get(row, col)));
            }
            output.push('\n');
        }
        output
    }

    /// Save confusion matrix to CSV
    pub fn save_csv(&self, path: &std::path::Path) -> crate::utils::error::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = vec!["actual\\predicted".to_string()];
        header.extend((0..self.num_classes).map(|c| c.to_string()));
        writer.write_record(&header)?;

        for row in 0..self.num_classes {
            let mut record = vec![row.to_string()];
            record.extend((0..self.num_classes).map(|col| self.get(row, col).to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Quadratic-weighted Cohen's kappa between two grade sequences
pub fn quadratic_weighted_kappa(truth: &[usize], predicted: &[usize], num_classes: usize) -> f64 {
    ConfusionMatrix::from_predictions(predicted, truth, num_classes).quadratic_weighted_kappa()
}
