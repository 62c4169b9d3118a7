//! Ordinal label codec
//!
//! An ISUP grade `g` is encoded as a 5-position thermometer code: the first
//! `g` positions are 1, the rest 0. Summing the code recovers the grade, which
//! lets a multi-label loss stand in for ordinal regression.

use crate::utils::error::{GradingError, Result};

/// Number of ISUP grades (0..=5)
pub const NUM_GRADES: usize = 6;

/// Length of the thermometer code
pub const LABEL_WIDTH: usize = NUM_GRADES - 1;

/// Thermometer-coded target for one example
pub type MultiLabelTarget = [f32; LABEL_WIDTH];

/// Converts ISUP grades to and from their cumulative multi-label form
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCodec;

impl LabelCodec {
    /// Encode a grade, failing for anything outside 0..=5
    pub fn encode(grade: i64) -> Result<MultiLabelTarget> {
        if !(0..NUM_GRADES as i64).contains(&grade) {
            return Err(GradingError::InvalidGrade(grade));
        }

        let mut target = [0.0f32; LABEL_WIDTH];
        for slot in target.iter_mut().take(grade as usize) {
            *slot = 1.0;
        }
        Ok(target)
    }

    /// Decode per-position probabilities to a grade
    ///
    /// Counts positions above 0.5. Any real input is accepted; the result is
    /// always in 0..=5.
    pub fn decode(probabilities: &[f32]) -> usize {
        probabilities
            .iter()
            .take(LABEL_WIDTH)
            .filter(|&&p| p > 0.5)
            .count()
    }

    /// Round a continuous score (sum of sigmoids) to the nearest grade
    ///
    /// Ties go to the even grade.
    pub fn round_score(score: f32) -> usize {
        if score.is_nan() {
            return 0;
        }
        score.round_ties_even().clamp(0.0, LABEL_WIDTH as f32) as usize
    }
}
