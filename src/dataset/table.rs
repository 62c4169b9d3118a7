//! Label table loading
//!
//! Reads the training CSV (`image_id`, `data_provider`, `isup_grade`, `fold`)
//! into immutable [`Example`] rows. Extra columns such as `gleason_score`
//! are ignored.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::labels::LabelCodec;
use crate::utils::error::{GradingError, Result};

/// One slide: identifier, grade, provider tag and precomputed fold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub image_id: String,
    pub isup_grade: usize,
    pub provider: String,
    pub fold: usize,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    image_id: String,
    data_provider: String,
    isup_grade: i64,
    fold: i64,
}

/// The full set of examples for a run
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    examples: Vec<Example>,
}

impl LabelTable {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Load from a CSV file on disk
    pub fn from_csv(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GradingError::Dataset(format!(
                "label table not found: {}",
                path.display()
            )));
        }
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        info!(
            "Loaded {} examples across {} folds from {:?}",
            table.len(),
            table.fold_count(),
            path
        );
        Ok(table)
    }

    /// Parse CSV content, validating every grade
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut examples = Vec::new();

        for (line, row) in csv_reader.deserialize::<CsvRow>().enumerate() {
            let row = row?;
            LabelCodec::encode(row.isup_grade)?;
            if row.fold < 0 {
                return Err(GradingError::Dataset(format!(
                    "row {} ({}): negative fold id {}",
                    line + 1,
                    row.image_id,
                    row.fold
                )));
            }
            examples.push(Example {
                image_id: row.image_id,
                isup_grade: row.isup_grade as usize,
                provider: row.data_provider,
                fold: row.fold as usize,
            });
        }

        Ok(Self { examples })
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Highest fold id plus one
    pub fn fold_count(&self) -> usize {
        self.examples
            .iter()
            .map(|e| e.fold)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0)
    }

    /// Rows at the given indices, in index order
    pub fn subset(&self, indices: &[usize]) -> Vec<Example> {
        indices
            .iter()
            .filter_map(|&i| self.examples.get(i).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "image_id,data_provider,isup_grade,gleason_score,fold\n\
        a1,karolinska,0,0+0,0\n\
        b2,radboud,4,4+4,1\n\
        c3,radboud,5,5+5,2\n\
        d4,karolinska,1,3+3,1\n";

    #[test]
    fn test_parse_ignores_extra_columns() {
        let table = LabelTable::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.fold_count(), 3);

        let row = table.get(1).unwrap();
        assert_eq!(row.image_id, "b2");
        assert_eq!(row.provider, "radboud");
        assert_eq!(row.isup_grade, 4);
        assert_eq!(row.fold, 1);
    }

    #[test]
    fn test_invalid_grade_is_rejected() {
        let csv = "image_id,data_provider,isup_grade,fold\nx,radboud,7,0\n";
        assert!(matches!(
            LabelTable::from_reader(csv.as_bytes()),
            Err(GradingError::InvalidGrade(7))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = LabelTable::from_csv(Path::new("/nonexistent/train.csv"));
        assert!(matches!(result, Err(GradingError::Dataset(_))));
    }

    #[test]
    fn test_subset_keeps_order() {
        let table = LabelTable::from_reader(CSV.as_bytes()).unwrap();
        let rows = table.subset(&[3, 0]);
        assert_eq!(rows[0].image_id, "d4");
        assert_eq!(rows[1].image_id, "a1");
    }
}
