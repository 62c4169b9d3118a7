//! Logging Module
//!
//! Structured logging through the `tracing` crate, plus a small helper that
//! reports fold and epoch timing during cross-validation.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Debug output with module paths and thread ids (loader threads show up)
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Default preset at a given level
    pub fn with_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Initialize the global subscriber
///
/// # Returns
/// * `Result<(), String>` - Err when a global subscriber was already set
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Fold/epoch timing logger
pub struct TrainingLogger {
    fold: usize,
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    fold_start: Instant,
}

impl TrainingLogger {
    pub fn new(fold: usize, total_epochs: usize) -> Self {
        Self {
            fold,
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            fold_start: Instant::now(),
        }
    }

    /// Log start of an epoch, naming the tile-set variant it trains on
    pub fn start_epoch(&mut self, epoch: usize, variant: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::info!(
            "Fold {} epoch {}/{} started on tile-set variant {}",
            self.fold + 1,
            epoch + 1,
            self.total_epochs,
            variant
        );
    }

    /// Log end of an epoch with its scores
    pub fn end_epoch(&self, train_loss: f64, kappa: f64, learning_rate: f64) {
        let epoch_time = self.epoch_start.elapsed();
        let total_time = self.fold_start.elapsed();

        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time.as_secs_f64() / (self.epoch + 1) as f64;
        let eta_secs = epochs_remaining as f64 * avg_epoch_time;

        tracing::info!(
            "Fold {} epoch {}/{} done in {:.1}s | train loss {:.4} | kappa {:.4} | lr {:.7} | ETA {:.0}s",
            self.fold + 1,
            self.epoch + 1,
            self.total_epochs,
            epoch_time.as_secs_f64(),
            train_loss,
            kappa,
            learning_rate,
            eta_secs
        );
    }

    pub fn log_new_best(&self, kappa: f64) {
        tracing::info!("New best checkpoint for fold {}: kappa {:.4}", self.fold + 1, kappa);
    }

    pub fn log_complete(&self, best_kappa: f64) {
        tracing::info!(
            "Fold {} complete: {} epochs in {:.1}s | best kappa {:.4}",
            self.fold + 1,
            self.total_epochs,
            self.fold_start.elapsed().as_secs_f64(),
            best_kappa
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::default().level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level, LogLevel::Debug);
        assert_eq!(LogConfig::with_level(LogLevel::Warn).level, LogLevel::Warn);
    }

    #[test]
    fn test_log_level_serde_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: LogLevel,
        }
        let parsed: Wrapper = toml::from_str("level = \"warn\"").unwrap();
        assert_eq!(parsed.level, LogLevel::Warn);
    }
}
