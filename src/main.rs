//! PaveMaster AI CLI
//!
//! Entry point for the pavement condition assessment system: synthetic
//! data generation, model training, evaluation, registry management,
//! and the inference server.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use pavemaster_ai::backend::{default_device, DefaultBackend};
use pavemaster_ai::config::PipelineConfig;
use pavemaster_ai::dataset::{
    export_png_dataset, generate_synthetic_dataset, ConditionClass, SyntheticConfig,
};
use pavemaster_ai::evaluation::evaluate_predictions;
use pavemaster_ai::inference::Predictor;
use pavemaster_ai::logging::{init_logging, LogConfig};
use pavemaster_ai::registry::ModelRegistry;
use pavemaster_ai::training::run_pipeline;
use pavemaster_ai::LOW_CONFIDENCE_THRESHOLD;

/// PaveMaster AI Pavement Condition Assessment
///
/// Classifies pavement surface condition from images using the Burn
/// framework, with synthetic data generation, a model registry, and an
/// HTTP inference server.
#[derive(Parser, Debug)]
#[command(name = "pavemaster")]
#[command(version = "0.1.0")]
#[command(about = "Pavement condition classification with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a synthetic pavement dataset as PNG files
    Generate {
        /// Output directory for the dataset
        #[arg(short, long, default_value = "data/synthetic")]
        output_dir: String,

        /// Samples per condition class
        #[arg(short, long, default_value = "500")]
        samples_per_class: usize,

        /// Image size (square)
        #[arg(long, default_value = "64")]
        image_size: usize,

        /// Random seed for reproducibility
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Run the training pipeline from a configuration file
    Train {
        /// Path to the pipeline configuration (JSON)
        #[arg(short, long, default_value = "pipeline.json")]
        config: String,

        /// Set the best artifact as production after training
        #[arg(long, default_value = "false")]
        auto_deploy: bool,
    },

    /// Evaluate a registered version against a labeled image directory
    Evaluate {
        /// Registry directory
        #[arg(short, long, default_value = "registry")]
        registry_dir: String,

        /// Version to evaluate (e.g. v0001)
        #[arg(long)]
        model_version: String,

        /// Directory with one subdirectory per condition class
        #[arg(short, long)]
        data_dir: String,
    },

    /// Inspect and manage the model registry
    Registry {
        /// Registry directory
        #[arg(short, long, default_value = "registry")]
        registry_dir: String,

        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Start the HTTP inference server
    Serve {
        /// Path to the pipeline configuration (JSON)
        #[arg(short, long, default_value = "pipeline.json")]
        config: String,
    },
}

#[derive(Subcommand, Debug)]
enum RegistryCommands {
    /// List registered artifacts
    List,

    /// Point the production alias at a version
    SetProduction {
        /// Version to promote (e.g. v0001)
        #[arg(long)]
        model_version: String,
    },

    /// Export a model version for mobile deployment
    ExportMobile {
        /// Version to export (e.g. v0001)
        #[arg(long)]
        model_version: String,

        /// Destination file (.bin)
        #[arg(short, long)]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Generate {
            output_dir,
            samples_per_class,
            image_size,
            seed,
        } => {
            cmd_generate(&output_dir, samples_per_class, image_size, seed)?;
        }

        Commands::Train {
            config,
            auto_deploy,
        } => {
            let exit_code = cmd_train(Path::new(&config), auto_deploy)?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }

        Commands::Evaluate {
            registry_dir,
            model_version,
            data_dir,
        } => {
            cmd_evaluate(Path::new(&registry_dir), &model_version, Path::new(&data_dir))?;
        }

        Commands::Registry {
            registry_dir,
            command,
        } => {
            cmd_registry(Path::new(&registry_dir), command)?;
        }

        Commands::Serve { config } => {
            let config = PipelineConfig::load(Path::new(&config))?;
            let registry = ModelRegistry::open(&config.registry_dir)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(pavemaster_ai::server::serve(registry, config.serving))?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════╗
 ║   PaveMaster AI - Pavement Condition Assessment          ║
 ║   Surface Classification with Burn + Rust                ║
 ╚══════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn cmd_generate(
    output_dir: &str,
    samples_per_class: usize,
    image_size: usize,
    seed: u64,
) -> Result<()> {
    let config = SyntheticConfig {
        samples_per_class,
        image_size,
        seed,
    };
    let samples = generate_synthetic_dataset(&config);
    export_png_dataset(&samples, &config, Path::new(output_dir))?;

    println!(
        "{} {} samples written to {}",
        "Done:".green().bold(),
        samples.len(),
        output_dir
    );
    Ok(())
}

fn cmd_train(config_path: &Path, auto_deploy: bool) -> Result<i32> {
    let config = if config_path.exists() {
        PipelineConfig::load(config_path)?
    } else {
        info!(
            "No configuration at {:?}; writing defaults and using them",
            config_path
        );
        let config = PipelineConfig::default();
        config.save(config_path)?;
        config
    };

    let report = run_pipeline(&config, auto_deploy)?;

    println!("{}", "Training Summary:".cyan().bold());
    for experiment in &report.experiments {
        let status = format!("{:?}", experiment.status);
        let accuracy = experiment
            .best_val_accuracy()
            .map(|a| format!("{:.1}%", a * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<12} val acc {}",
            experiment.spec.name, status, accuracy
        );
    }
    for (name, version, report) in &report.registered {
        println!(
            "  {} {} registered as {} (test acc {:.1}%)",
            "✓".green(),
            name,
            version,
            report.accuracy * 100.0
        );
    }
    if let Some(version) = &report.ensemble_version {
        println!("  {} ensemble registered as {}", "✓".green(), version);
    }

    if report.any_failed() {
        println!("{}", "Some experiments failed".yellow().bold());
        return Ok(1);
    }
    Ok(0)
}

fn cmd_evaluate(registry_dir: &Path, version: &str, data_dir: &Path) -> Result<()> {
    let registry = ModelRegistry::open(registry_dir)?;
    let predictor = Predictor::from_registry(&registry, version, LOW_CONFIDENCE_THRESHOLD)?;

    println!("{}", "Evaluation Configuration:".cyan().bold());
    println!("  Version:  {}", version);
    println!("  Data dir: {:?}", data_dir);

    let mut truths = Vec::new();
    let mut predictions = Vec::new();
    let mut skipped = 0usize;

    for class in ConditionClass::ALL {
        let class_dir = data_dir.join(class.as_str());
        if !class_dir.is_dir() {
            continue;
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let bytes = std::fs::read(&path)?;
            match predictor.predict(&bytes) {
                Ok(prediction) => {
                    truths.push(class);
                    predictions.push(prediction.predicted_class);
                }
                Err(err) => {
                    tracing::warn!("Skipping {:?}: {}", path, err);
                    skipped += 1;
                }
            }
        }
    }

    if truths.is_empty() {
        anyhow::bail!("no readable labeled images under {:?}", data_dir);
    }

    let report = evaluate_predictions(&truths, &predictions);
    println!("{report}");
    if skipped > 0 {
        println!("{} {} unreadable images skipped", "Note:".yellow(), skipped);
    }
    Ok(())
}

fn cmd_registry(registry_dir: &Path, command: RegistryCommands) -> Result<()> {
    let registry = ModelRegistry::open(registry_dir)?;

    match command {
        RegistryCommands::List => {
            let production = registry.production()?;
            let artifacts = registry.list()?;
            if artifacts.is_empty() {
                println!("Registry is empty");
                return Ok(());
            }

            println!("{}", "Registered Artifacts:".cyan().bold());
            for artifact in artifacts {
                let marker = if production.as_deref() == Some(artifact.version.as_str()) {
                    " (production)".green().to_string()
                } else {
                    String::new()
                };
                let accuracy = artifact
                    .accuracy
                    .map(|a| format!("{:.1}%", a * 100.0))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<8} {:<10} acc {:<8} {}{}",
                    artifact.version,
                    format!("{:?}", artifact.kind).to_lowercase(),
                    accuracy,
                    artifact.created_at.format("%Y-%m-%d %H:%M"),
                    marker
                );
            }
        }

        RegistryCommands::SetProduction { model_version } => {
            registry.set_production(&model_version)?;
            println!(
                "{} production set to {}",
                "✓".green(),
                model_version
            );
        }

        RegistryCommands::ExportMobile {
            model_version,
            output,
        } => {
            let device = default_device();
            let bytes = registry.export_mobile::<DefaultBackend>(
                &model_version,
                Path::new(&output),
                &device,
            )?;
            println!(
                "{} exported {} to {} ({:.2} MiB)",
                "✓".green(),
                model_version,
                output,
                bytes as f64 / (1024.0 * 1024.0)
            );
        }
    }
    Ok(())
}
