use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{DetectionMode, EncodingStore, Gate, GateConfig, OnnxProvider, Recognition};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face enrollment and verification CLI")]
struct Cli {
    /// TOML config file (defaults to $FACEGATE_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Detection mode override: fast or accurate
    #[arg(short, long, global = true)]
    model: Option<DetectionMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the encoding store from the training corpus
    Enroll {
        /// Corpus root with one directory per identity (overrides config)
        #[arg(short, long)]
        training_root: Option<PathBuf>,
    },
    /// Label every face in a probe image
    Recognize {
        probe: PathBuf,
        /// Write the annotated image and report under results_root
        #[arg(short, long)]
        save: bool,
    },
    /// Check whether a probe image shows the claimed identity
    Verify {
        probe: PathBuf,
        /// Identity label the probe is expected to show
        #[arg(short = 'n', long)]
        claimed: String,
        /// Write the annotated image and report under results_root
        #[arg(short, long)]
        save: bool,
    },
    /// List enrolled identities and their reference counts
    Inspect,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = GateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(mode) = cli.model {
        config.model = mode;
    }

    match cli.command {
        Commands::Enroll { training_root } => {
            let gate = open_gate(config)?;
            let root = training_root.unwrap_or_else(|| gate.config().training_root.clone());
            let summary = gate.enroll_from(&root, gate.config().model)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Recognize { probe, save } => {
            let gate = open_gate(config)?;
            let recognition = gate
                .recognize(&probe, gate.config().model)
                .context("recognition unavailable")?;
            println!("{}", serde_json::to_string_pretty(&recognition.faces)?);
            if save {
                report_saved(&gate, &probe, &recognition)?;
            }
        }
        Commands::Verify { probe, claimed, save } => {
            let gate = open_gate(config)?;
            let mode = gate.config().model;
            if let Some(archived) = gate.record_attempt(&probe, &claimed)? {
                eprintln!("archived probe: {}", archived.display());
            }
            let recognition = gate.recognize(&probe, mode).context("verification unavailable")?;
            if save {
                report_saved(&gate, &probe, &recognition)?;
            }
            let verification = gate.conclude(&claimed, recognition);
            println!("{}", serde_json::to_string_pretty(&verification)?);
            if !verification.verified {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Inspect => {
            let store = EncodingStore::load(&config.encodings_path)?;
            println!(
                "{} ({} embeddings, model {})",
                config.encodings_path.display(),
                store.len(),
                store.model_version().unwrap_or("unknown")
            );
            for (label, count) in store.label_counts() {
                println!("  {label}: {count}");
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_gate(config: GateConfig) -> Result<Gate<OnnxProvider>> {
    let provider = OnnxProvider::from_config(&config).context("loading ONNX models")?;
    Ok(Gate::new(provider, config)?)
}

fn report_saved(gate: &Gate<OnnxProvider>, probe: &Path, recognition: &Recognition) -> Result<()> {
    let saved = gate.save_results(probe, recognition)?;
    eprintln!("annotated image: {}", saved.image.display());
    eprintln!("report:          {}", saved.report.display());
    Ok(())
}
