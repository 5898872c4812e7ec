//! # ocrflow CLI
//!
//! Drive download, OCR and chunked model analysis for scanned document
//! collections, plus an HTTP server that runs those commands as jobs.
//!
//! ## Usage
//!
//! ```bash
//! ocrflow --config ./config/ocrflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ocrflow fetch <folder_id> <dest>` | Mirror a Google Drive folder locally |
//! | `ocrflow ocr <source>` | Extract text from images, PDFs and presentations |
//! | `ocrflow analyze <output_root>` | Analyze OCR text with a Gemini model |
//! | `ocrflow serve` | Start the job control HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! ocrflow fetch 1AbCdEf ./scans --service-account ./sa.json
//! ocrflow ocr ./scans --dpi 300 --min-length 20
//! ocrflow analyze ./scans/ocr_outputs --prompt "List the legal terms" --service-account ./sa.json
//! ocrflow serve --bind 0.0.0.0:8000
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ocrflow::analyze::{self, AnalysisOptions};
use ocrflow::config::{self, Config};
use ocrflow::drive::{self, FetchOptions};
use ocrflow::ocr::{self, Device, OcrOptions};
use ocrflow::server;

/// Drive download, OCR and Gemini analysis for scanned documents.
#[derive(Parser)]
#[command(name = "ocrflow", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ocrflow.toml` when present, built-in defaults otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a Google Drive folder with all its contents.
    ///
    /// Google Docs, Slides, Sheets and Drawings are exported as PDF.
    Fetch {
        /// Drive folder id.
        folder_id: String,

        /// Local directory the folder is mirrored into.
        destination: PathBuf,

        /// Service account JSON file.
        #[arg(long)]
        service_account: PathBuf,

        /// Re-download files that already exist.
        #[arg(long)]
        overwrite: bool,
    },

    /// Extract text from images, PDFs and presentations.
    Ocr {
        /// Directory scanned recursively for inputs.
        source: PathBuf,

        /// Output directory (default: `<source>/ocr_outputs`).
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Compute device: auto, cuda or cpu.
        #[arg(long, default_value = "auto", value_parser = ["auto", "cuda", "cpu"])]
        device: String,

        /// Rasterization resolution for PDF pages.
        #[arg(long)]
        dpi: Option<u32>,

        /// Do not write outputs shorter than this many characters.
        #[arg(long, default_value_t = 0)]
        min_length: usize,

        /// Overwrite existing outputs.
        #[arg(long)]
        force: bool,
    },

    /// Analyze OCR text files with a Gemini model on Vertex AI.
    Analyze {
        /// Directory holding the OCR `.txt` outputs.
        output_root: PathBuf,

        /// Instruction sent to the model with every chunk.
        #[arg(long, allow_hyphen_values = true)]
        prompt: String,

        /// Service account JSON file.
        #[arg(long)]
        service_account: PathBuf,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        region: Option<String>,

        /// Subdirectory of the output root that receives results.
        #[arg(long)]
        analysis_dir_name: Option<String>,

        /// Characters per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters shared by consecutive chunks.
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Output token budget (values below 2048 are raised to 2048).
        #[arg(long)]
        max_output_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_p: Option<f32>,

        #[arg(long)]
        top_k: Option<u32>,

        /// Re-analyze files that already have results.
        #[arg(long)]
        force: bool,
    },

    /// Start the job control HTTP server.
    Serve {
        /// Bind address, overriding `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg: Config = config::resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            folder_id,
            destination,
            service_account,
            overwrite,
        } => {
            let opts = FetchOptions {
                folder_id,
                destination,
                service_account,
                overwrite,
            };
            let stats = drive::run_fetch(&opts, &cfg.drive).await?;
            println!(
                "fetch ok: downloaded={} exported={} skipped={} unsupported={} failed={}",
                stats.downloaded, stats.exported, stats.skipped, stats.unsupported, stats.failed
            );
        }
        Commands::Ocr {
            source,
            output,
            device,
            dpi,
            min_length,
            force,
        } => {
            let opts = OcrOptions {
                source,
                output,
                device: device.parse::<Device>()?,
                dpi: dpi.unwrap_or(cfg.ocr.dpi),
                min_length,
                force,
            };
            let stats = tokio::task::spawn_blocking(move || ocr::run_ocr(&opts, &cfg.ocr)).await??;
            println!(
                "ocr ok: found={} written={} skipped={} failed={}",
                stats.found, stats.written, stats.skipped, stats.failed
            );
        }
        Commands::Analyze {
            output_root,
            prompt,
            service_account,
            model,
            region,
            analysis_dir_name,
            chunk_size,
            chunk_overlap,
            max_output_tokens,
            temperature,
            top_p,
            top_k,
            force,
        } => {
            let a = &mut cfg.analysis;
            if let Some(v) = model {
                a.model = v;
            }
            if let Some(v) = region {
                a.region = v;
            }
            if let Some(v) = analysis_dir_name {
                a.analysis_dir_name = v;
            }
            if let Some(v) = chunk_size {
                a.chunk_size = v;
            }
            if let Some(v) = chunk_overlap {
                a.chunk_overlap = v;
            }
            if let Some(v) = max_output_tokens {
                a.max_output_tokens = v;
            }
            if let Some(v) = temperature {
                a.temperature = v;
            }
            if let Some(v) = top_p {
                a.top_p = v;
            }
            if let Some(v) = top_k {
                a.top_k = v;
            }
            cfg.validate()?;

            let opts = AnalysisOptions {
                output_root,
                prompt,
                service_account,
                settings: cfg.analysis.clone(),
                force,
            };
            let stats = analyze::run_analysis(&opts).await?;
            println!(
                "analyze ok: found={} analyzed={} reused={} empty={} failed={}",
                stats.found, stats.analyzed, stats.reused, stats.empty, stats.failed
            );
        }
        Commands::Serve { bind } => {
            server::run_server(&cfg, cli.config.clone(), bind).await?;
        }
    }

    Ok(())
}
