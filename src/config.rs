use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::TextChunker;

/// Config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/ocrflow.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    pub model: String,
    pub region: String,
    pub analysis_dir_name: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub timeout_secs: u64,
    /// Base URL override for the model endpoint (tests, proxies).
    pub endpoint: Option<String>,
}

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash-002".to_string(),
            region: "us-central1".to_string(),
            analysis_dir_name: "analysis_outputs".to_string(),
            chunk_size: 6000,
            chunk_overlap: 300,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: 0.0,
            top_p: 0.9,
            top_k: 40,
            timeout_secs: 120,
            endpoint: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OcrConfig {
    pub engine_command: String,
    pub language: String,
    pub rasterizer_command: String,
    pub dpi: u32,
    pub output_dir_name: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine_command: "tesseract".to_string(),
            language: "tur".to_string(),
            rasterizer_command: "pdftoppm".to_string(),
            dpi: 220,
            output_dir_name: "ocr_outputs".to_string(),
        }
    }
}

pub const MIN_DPI: u32 = 72;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DriveConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.googleapis.com/drive/v3".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Model names offered by `GET /api/defaults`.
    pub models: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            models: vec![
                "gemini-1.5-flash-002".to_string(),
                "gemini-1.5-pro-002".to_string(),
                "gemini-2.0-flash".to_string(),
                "gemini-2.5-flash".to_string(),
                "gemini-2.5-pro".to_string(),
            ],
        }
    }
}

/// Resolve the configuration for a run.
///
/// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
/// read when present and built-in defaults are used otherwise.
pub fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config(&default_path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        TextChunker::new(a.chunk_size, a.chunk_overlap)
            .with_context(|| "Invalid [analysis] chunking settings")?;

        if !(0.0..=1.0).contains(&a.temperature) {
            bail!("analysis.temperature must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&a.top_p) {
            bail!("analysis.top_p must be in [0.0, 1.0]");
        }
        if a.top_k == 0 {
            bail!("analysis.top_k must be >= 1");
        }
        if a.analysis_dir_name.trim().is_empty() {
            bail!("analysis.analysis_dir_name must not be empty");
        }

        if self.ocr.dpi < MIN_DPI {
            bail!("ocr.dpi must be >= {}", MIN_DPI);
        }
        if self.ocr.engine_command.trim().is_empty() {
            bail!("ocr.engine_command must not be empty");
        }

        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }

        Ok(())
    }
}
