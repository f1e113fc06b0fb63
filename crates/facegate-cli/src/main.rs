use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{IdentityId, ImageInput};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

#[derive(Parser)]
#[command(name = "facegate", about = "Face enrollment and recognition CLI")]
struct Cli {
    /// Treat image files as base64 text (a data: URL prefix is allowed)
    #[arg(long, global = true)]
    base64: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a single photo
    Enroll {
        image: PathBuf,
        /// Human-readable label stored with the identity
        #[arg(short, long)]
        label: Option<String>,
        /// Seed for the synthetic-sample augmentations
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Identify the person in a photo
    Recognize {
        image: PathBuf,
        /// Minimum cosine similarity for a match (default: FACEGATE_SIMILARITY_THRESHOLD)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Add synthetic samples to an existing identity
    Extend {
        /// Identity code
        id: String,
        image: PathBuf,
        /// Number of synthetic samples to add
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// List enrolled identities
    List,
    /// Remove an identity and all of its embeddings
    Remove {
        /// Identity code
        id: String,
    },
    /// Show engine and gallery status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::from_env();
    let engine = engine::spawn_engine(&config).context("failed to start engine")?;

    let interrupt = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling synthetic samples");
            interrupt.cancel_synthesis();
        }
    });

    match cli.command {
        Commands::Enroll { image, label, seed } => {
            let input = read_image(&image, cli.base64)?;
            let report = engine.enroll(input, label, seed).await?;
            print_json(&report)?;
        }
        Commands::Recognize { image, threshold } => {
            let input = read_image(&image, cli.base64)?;
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let recognition = engine.recognize(input, threshold).await?;
            print_json(&recognition)?;
        }
        Commands::Extend {
            id,
            image,
            count,
            seed,
        } => {
            let input = read_image(&image, cli.base64)?;
            let report = engine
                .extend(identity_code(&id), input, count, seed)
                .await?;
            print_json(&report)?;
        }
        Commands::List => {
            print_json(&engine.list().await?)?;
        }
        Commands::Remove { id } => {
            let id = identity_code(&id);
            let removed = engine.remove(id.clone()).await?;
            print_json(&serde_json::json!({ "id": id, "removed": removed }))?;
        }
        Commands::Status => {
            print_json(&engine.status().await?)?;
        }
    }

    engine.shutdown().await?;
    Ok(())
}

fn read_image(path: &Path, base64: bool) -> Result<ImageInput> {
    if base64 {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(ImageInput::Base64(text))
    } else {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(ImageInput::Bytes(bytes))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Identity codes are stored upper-case.
fn identity_code(raw: &str) -> IdentityId {
    IdentityId::from(raw.trim().to_ascii_uppercase())
}
