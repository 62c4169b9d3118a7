//! ISUP grading CLI
//!
//! Entry point for cross-validated training, out-of-fold scoring of a
//! finished run, and writing the default experiment configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use isup_grading::backend::{backend_name, default_device, TrainingBackend};
use isup_grading::config::ExperimentConfig;
use isup_grading::dataset::LabelTable;
use isup_grading::model::TilePoolingClassifierConfig;
use isup_grading::training::{score_run, ExperimentOrchestrator};
use isup_grading::utils::format_duration;
use isup_grading::utils::logging::{init_logging, LogConfig};

/// Cross-validated ISUP grading on pre-extracted tile sets
#[derive(Parser, Debug)]
#[command(name = "isup_grading")]
#[command(version)]
#[command(about = "Cross-validated ISUP grading with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train every fold of the label table
    Train {
        /// Experiment configuration (TOML); defaults are used when absent
        #[arg(short, long, default_value = "experiment.toml")]
        config: PathBuf,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the directory holding the tile folders
        #[arg(long)]
        root_dir: Option<PathBuf>,

        /// Override the label table
        #[arg(long)]
        csv_path: Option<PathBuf>,

        /// Override the output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Out-of-fold kappa of a finished run
    Score {
        /// Run directory holding the fold prediction files
        #[arg(short, long)]
        run_dir: PathBuf,

        /// Label table the run was trained on
        #[arg(long, default_value = "train.csv")]
        csv_path: PathBuf,

        /// Providers to score separately
        #[arg(long, value_delimiter = ',', default_value = "radboud,karolinska")]
        providers: Vec<String>,
    },

    /// Write the default configuration file
    InitConfig {
        #[arg(short, long, default_value = "experiment.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            epochs,
            seed,
            root_dir,
            csv_path,
            output_dir,
        } => {
            let mut experiment = load_config(&config)?;
            if let Some(epochs) = epochs {
                experiment.hparams.epochs = epochs;
            }
            if let Some(seed) = seed {
                experiment.seed = seed;
            }
            if let Some(root_dir) = root_dir {
                experiment.root_dir = root_dir;
            }
            if let Some(csv_path) = csv_path {
                experiment.csv_path = csv_path;
            }
            if let Some(output_dir) = output_dir {
                experiment.output_dir = output_dir;
            }

            let log_config = if cli.verbose {
                LogConfig::verbose()
            } else {
                LogConfig::with_level(experiment.log_level)
            };
            let _ = init_logging(&log_config);
            print_banner();
            cmd_train(experiment)?;
        }

        Commands::Score {
            run_dir,
            csv_path,
            providers,
        } => {
            let _ = init_logging(&log_config(cli.verbose));
            cmd_score(&run_dir, &csv_path, &providers)?;
        }

        Commands::InitConfig { output, force } => {
            let _ = init_logging(&log_config(cli.verbose));
            cmd_init_config(&output, force)?;
        }
    }

    Ok(())
}

fn log_config(verbose: bool) -> LogConfig {
    if verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    }
}

fn load_config(path: &Path) -> Result<ExperimentConfig> {
    if path.exists() {
        ExperimentConfig::load(path).with_context(|| format!("failed to load {:?}", path))
    } else {
        Ok(ExperimentConfig::default())
    }
}

fn print_banner() {
    println!();
    println!("{}", "ISUP grading".green().bold());
    println!("  version {} | backend {}", isup_grading::VERSION, backend_name());
    println!();
}

fn cmd_train(config: ExperimentConfig) -> Result<()> {
    let hp = &config.hparams;
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Run name:        {}", config.name);
    println!("  Label table:     {:?}", config.csv_path);
    println!("  Tiles:           {:?}", config.train_path());
    println!("  Variants:        {:?}", config.variants);
    println!("  Tiles/example:   {} x {}px", hp.n_tiles, hp.tile_size);
    println!("  Epochs:          {}", hp.epochs);
    println!("  Batch size:      {} (accumulate {})", hp.batch_size, hp.accumulate);
    println!("  Learning rate:   {} (warmup factor {})", hp.init_lr, hp.warmup_factor);
    println!("  Seed:            {}", config.seed);
    println!();

    let device = default_device();
    let summary = ExperimentOrchestrator::new(config)?
        .run::<TrainingBackend, _, _>(&device, |device| TilePoolingClassifierConfig::new().init(device))?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    for fold in &summary.folds {
        println!(
            "  Fold {}: best epoch {:02}, kappa {:.4}",
            fold.fold + 1,
            fold.best_epoch,
            fold.best_kappa
        );
    }
    println!("  Run directory: {:?}", summary.run_dir);
    println!("  Total time:    {}", format_duration(summary.elapsed_secs));
    Ok(())
}

fn cmd_score(run_dir: &Path, csv_path: &Path, providers: &[String]) -> Result<()> {
    let table = LabelTable::from_csv(csv_path)
        .with_context(|| format!("failed to read label table {:?}", csv_path))?;
    let score = score_run(run_dir, &table, providers)?;
    info!("Scored {} prediction files from {:?}", score.files, run_dir);
    score.print();
    let cm_path = score.save_confusion(run_dir)?;
    println!("{} {:?}", "Confusion matrix written to".green(), cm_path);
    Ok(())
}

fn cmd_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{:?} already exists, pass --force to overwrite", output);
    }
    ExperimentConfig::default().save(output)?;
    println!("{} {:?}", "Wrote default configuration to".green(), output);
    Ok(())
}
