//! One-cycle learning rate schedule
//!
//! Warm-up from `max_lr / div_factor` to `max_lr` over the first
//! `pct_start` of the run, then anneal to
//! `max_lr / div_factor / final_div_factor`. The schedule is indexed by
//! optimizer step (after gradient accumulation), not by batch.

use serde::{Deserialize, Serialize};

use crate::config::Hyperparameters;

/// Interpolation used by both phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AnnealStrategy {
    #[default]
    Cos,
    Linear,
}

impl AnnealStrategy {
    fn anneal(&self, start: f64, end: f64, pct: f64) -> f64 {
        match self {
            AnnealStrategy::Cos => end + (start - end) / 2.0 * (1.0 + (std::f64::consts::PI * pct).cos()),
            AnnealStrategy::Linear => start + (end - start) * pct,
        }
    }
}

/// Step-indexed one-cycle schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneCycleSchedule {
    pub max_lr: f64,
    pub total_steps: usize,
    /// Fraction of the run spent warming up
    pub pct_start: f64,
    pub div_factor: f64,
    pub final_div_factor: f64,
    pub anneal: AnnealStrategy,
    step: usize,
}

impl OneCycleSchedule {
    /// Cosine one-cycle with the usual 30% warm-up
    pub fn new(max_lr: f64, total_steps: usize) -> Self {
        Self {
            max_lr,
            total_steps,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            anneal: AnnealStrategy::Cos,
            step: 0,
        }
    }

    /// Schedule for a fold: `epochs * steps_per_epoch` steps, first epoch warm-up
    pub fn from_hparams(hparams: &Hyperparameters, steps_per_epoch: usize) -> Self {
        Self::new(hparams.init_lr, hparams.epochs * steps_per_epoch)
            .with_pct_start(1.0 / hparams.epochs.max(1) as f64)
            .with_div_factor(hparams.warmup_factor)
    }

    pub fn with_pct_start(mut self, pct_start: f64) -> Self {
        self.pct_start = pct_start;
        self
    }

    pub fn with_div_factor(mut self, div_factor: f64) -> Self {
        self.div_factor = div_factor;
        self
    }

    pub fn with_anneal(mut self, anneal: AnnealStrategy) -> Self {
        self.anneal = anneal;
        self
    }

    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    /// Last step index of the warm-up phase
    pub fn warmup_end_step(&self) -> f64 {
        (self.pct_start * self.total_steps as f64 - 1.0).max(0.0)
    }

    /// Learning rate at optimizer step `step`
    ///
    /// Steps past the end of the schedule hold the final rate.
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.max_lr;
        }

        let last_step = (self.total_steps - 1) as f64;
        let step = (step as f64).min(last_step);
        let warmup_end = self.warmup_end_step();

        if step <= warmup_end {
            let pct = if warmup_end > 0.0 { step / warmup_end } else { 1.0 };
            self.anneal.anneal(self.initial_lr(), self.max_lr, pct)
        } else {
            let span = last_step - warmup_end;
            let pct = if span > 0.0 { (step - warmup_end) / span } else { 1.0 };
            self.anneal.anneal(self.max_lr, self.min_lr(), pct)
        }
    }

    /// Rate for the upcoming optimizer step
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    /// Advance one optimizer step, returning the new rate
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn description(&self) -> String {
        format!(
            "One-Cycle: max_lr={:.6}, total_steps={}, warmup={:.1}%, div={}, final_div={}",
            self.max_lr,
            self.total_steps,
            self.pct_start * 100.0,
            self.div_factor,
            self.final_div_factor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thirty_epoch_schedule() -> OneCycleSchedule {
        let hparams = Hyperparameters {
            epochs: 30,
            init_lr: 3e-4,
            warmup_factor: 10.0,
            ..Default::default()
        };
        OneCycleSchedule::from_hparams(&hparams, 50)
    }

    #[test]
    fn test_peak_at_end_of_first_epoch() {
        let schedule = thirty_epoch_schedule();
        assert_eq!(schedule.total_steps, 1500);

        let peak_step = (0..schedule.total_steps)
            .max_by(|&a, &b| schedule.lr_at(a).total_cmp(&schedule.lr_at(b)))
            .unwrap();
        let expected = (1500.0f64 / 30.0).round() as i64;
        assert!((peak_step as i64 - expected).abs() <= 1, "peak at {}", peak_step);
        assert!((schedule.lr_at(peak_step) - 3e-4).abs() < 1e-12);
    }

    #[test]
    fn test_endpoints() {
        let schedule = thirty_epoch_schedule();
        assert!((schedule.lr_at(0) - 3e-5).abs() < 1e-12);
        assert!((schedule.lr_at(1499) - 3e-9).abs() < 1e-15);
        // past the end holds the final rate
        assert_eq!(schedule.lr_at(5000), schedule.lr_at(1499));
    }

    #[test]
    fn test_monotone_phases() {
        let schedule = thirty_epoch_schedule();
        for step in 1..50 {
            assert!(schedule.lr_at(step) > schedule.lr_at(step - 1));
        }
        for step in 50..1500 {
            assert!(schedule.lr_at(step) <= schedule.lr_at(step - 1));
        }
    }

    #[test]
    fn test_step_advances() {
        let mut schedule = OneCycleSchedule::new(0.1, 10).with_anneal(AnnealStrategy::Linear);
        let first = schedule.current_lr();
        let second = schedule.step();
        assert_eq!(schedule.steps_taken(), 1);
        assert!(second > first);
    }

    #[test]
    fn test_degenerate_lengths() {
        assert_eq!(OneCycleSchedule::new(0.1, 0).lr_at(3), 0.1);

        // warm-up shorter than one step goes straight to the peak
        let schedule = OneCycleSchedule::new(0.1, 2).with_pct_start(0.1);
        assert!((schedule.lr_at(0) - 0.1).abs() < 1e-12);
    }
}
