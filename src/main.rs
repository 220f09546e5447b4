//! # pdf-signature-remover CLI
//!
//! Runs the delta-driven service, or sanitizes a single piece or file by hand.
//!
//! ## Usage
//!
//! ```bash
//! pdf-signature-remover --config ./config/remover.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serve` | Start the HTTP service (delta endpoint and direct requests) |
//! | `strip <piece-uri>` | Run the pipeline once for one piece |
//! | `strip-file <in> <out>` | Remove signature fields from a local PDF |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

use pdf_signature_remover::config;
use pdf_signature_remover::graph::Scope;
use pdf_signature_remover::pipeline::SignatureRemover;
use pdf_signature_remover::server;
use pdf_signature_remover::signatures::{self, PdfSignatureStripper, SignatureStripper, Stripped};

/// Strips signature fields from document pieces and keeps the signed
/// original as a separate, more confidential piece.
#[derive(Parser)]
#[command(name = "pdf-signature-remover", version)]
struct Cli {
    /// Path to configuration file (TOML). Missing files fall back to
    /// defaults plus environment overrides.
    #[arg(long, global = true, default_value = "./config/remover.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service.
    Serve,

    /// Sanitize one piece now, with sudo rights on the kanselarij graph.
    Strip {
        /// Piece URI.
        piece: String,
    },

    /// Remove signature fields from a local PDF file.
    ///
    /// Nothing is written when the input has no signature fields.
    StripFile {
        input: PathBuf,
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        // strip-file needs no services.
        Commands::StripFile { input, output } => strip_file(&input, &output)?,
        Commands::Serve => {
            let cfg = config::load_config(&cli.config)?;
            server::run_server(&cfg).await?;
        }
        Commands::Strip { piece } => {
            let cfg = config::load_config(&cli.config)?;
            let remover =
                SignatureRemover::from_config(&cfg, Scope::Sudo, &cfg.graph.kanselarij_graph)?;
            let outcome = remover.remove_signatures(&piece).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

fn strip_file(input: &Path, output: &Path) -> Result<()> {
    let pdf = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let removed: Vec<String> = signatures::form_fields(&pdf)?
        .into_iter()
        .filter(|f| f.kind.is_signature())
        .map(|f| f.name.unwrap_or_else(|| "<unnamed>".to_string()))
        .collect();

    match PdfSignatureStripper.strip(&pdf)? {
        Stripped::Sanitized(bytes) => {
            std::fs::write(output, bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Removed {} signature field(s) [{}] -> {}",
                removed.len(),
                removed.join(", "),
                output.display()
            );
        }
        Stripped::NoSignatures => {
            println!("No signature fields in {}; nothing written.", input.display());
        }
    }
    Ok(())
}
