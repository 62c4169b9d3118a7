//! Cross-validation fold splitting
//!
//! Folds are assigned upstream and stored in the label table. Splitting
//! only reads them back: fold `i` validates on every row tagged `i` and
//! trains on the rest.

use serde::{Deserialize, Serialize};

use crate::dataset::table::Example;
use crate::utils::error::{GradingError, Result};

/// Train/validation indices for one fold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldAssignment {
    pub fold: usize,
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
}

/// Produces one [`FoldAssignment`] per fold id
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldSplitter;

impl FoldSplitter {
    /// Split `examples` into `fold_count` train/validation pairs
    ///
    /// Fails with `EmptyFold` if any fold id in `0..fold_count` has no rows.
    /// Deterministic: indices come out in table order.
    pub fn split(examples: &[Example], fold_count: usize) -> Result<Vec<FoldAssignment>> {
        if fold_count == 0 {
            return Err(GradingError::Dataset("fold count must be > 0".to_string()));
        }

        let mut folds = Vec::with_capacity(fold_count);
        for fold in 0..fold_count {
            let (val_indices, train_indices): (Vec<usize>, Vec<usize>) =
                (0..examples.len()).partition(|&i| examples[i].fold == fold);

            if val_indices.is_empty() {
                return Err(GradingError::EmptyFold { fold, fold_count });
            }

            folds.push(FoldAssignment {
                fold,
                train_indices,
                val_indices,
            });
        }
        Ok(folds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_examples(n: usize, folds: usize) -> Vec<Example> {
        (0..n)
            .map(|i| Example {
                image_id: format!("slide_{}", i),
                isup_grade: i % 6,
                provider: if i % 2 == 0 { "radboud" } else { "karolinska" }.to_string(),
                fold: i % folds,
            })
            .collect()
    }

    #[test]
    fn test_four_folds_of_twenty_five() {
        let examples = make_examples(100, 4);
        let folds = FoldSplitter::split(&examples, 4).unwrap();

        assert_eq!(folds.len(), 4);
        for assignment in &folds {
            assert_eq!(assignment.val_indices.len(), 25);
            assert_eq!(assignment.train_indices.len(), 75);
        }

        for a in 0..4 {
            for b in (a + 1)..4 {
                let left: HashSet<_> = folds[a].val_indices.iter().collect();
                assert!(folds[b].val_indices.iter().all(|i| !left.contains(i)));
            }
        }
    }

    #[test]
    fn test_validation_sets_cover_everything_once() {
        let examples = make_examples(37, 5);
        let folds = FoldSplitter::split(&examples, 5).unwrap();

        let mut seen = vec![0usize; examples.len()];
        for assignment in &folds {
            for &i in &assignment.val_indices {
                seen[i] += 1;
            }
            // train and validation are complementary within a fold
            assert_eq!(
                assignment.train_indices.len() + assignment.val_indices.len(),
                examples.len()
            );
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_empty_fold_is_an_error() {
        let mut examples = make_examples(12, 3);
        for example in examples.iter_mut() {
            if example.fold == 1 {
                example.fold = 2;
            }
        }

        match FoldSplitter::split(&examples, 3) {
            Err(GradingError::EmptyFold { fold, fold_count }) => {
                assert_eq!(fold, 1);
                assert_eq!(fold_count, 3);
            }
            other => panic!("expected EmptyFold, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_folds_rejected() {
        assert!(FoldSplitter::split(&make_examples(4, 2), 0).is_err());
    }
}
