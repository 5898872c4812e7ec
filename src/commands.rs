//! Job request payloads and the command lines they map to.
//!
//! Each HTTP submission is validated and turned into an argument vector
//! that re-invokes this executable with the matching subcommand, so a job
//! behaves exactly like the same command typed at a shell.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::MIN_DPI;

/// Smallest accepted chunk size for analysis submissions.
pub const MIN_CHUNK_SIZE: i64 = 500;
/// Smallest accepted output-token budget for analysis submissions.
pub const MIN_OUTPUT_TOKENS: i64 = 256;

/// Program (and global flags) used to launch job commands.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: String,
    config: Option<PathBuf>,
}

impl Launcher {
    pub fn new(program: impl Into<String>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Launch jobs with the running binary, forwarding `--config` when set.
    pub fn current_exe(config: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe.display().to_string(), config.map(|p| absolutize(&p))))
    }

    fn base(&self, subcommand: &str) -> Vec<String> {
        let mut cmd = vec![self.program.clone()];
        if let Some(ref config) = self.config {
            cmd.push("--config".to_string());
            cmd.push(config.display().to_string());
        }
        cmd.push(subcommand.to_string());
        cmd
    }
}

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_dpi() -> i64 {
    220
}

fn default_model() -> String {
    "gemini-1.5-flash-002".to_string()
}

fn default_region() -> String {
    "us-central1".to_string()
}

fn default_analysis_dir() -> String {
    "analysis_outputs".to_string()
}

fn default_chunk_size() -> i64 {
    6000
}

fn default_overlap() -> i64 {
    300
}

fn default_output_tokens() -> i64 {
    2048
}

fn default_top_p() -> f64 {
    0.9
}

fn default_top_k() -> i64 {
    40
}

/// `POST /api/run-drive`
#[derive(Debug, Clone, Deserialize)]
pub struct DrivePayload {
    pub folder_id: String,
    pub destination: String,
    pub service_account: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl DrivePayload {
    pub fn command(&self, launcher: &Launcher) -> Result<Vec<String>> {
        if self.folder_id.trim().is_empty() {
            bail!("folder_id must not be empty");
        }
        let sa = existing_file(&self.service_account, "Service account file not found")?;
        let dest = absolutize(&expand_home(&self.destination));

        let mut cmd = launcher.base("fetch");
        cmd.push(self.folder_id.trim().to_string());
        cmd.push(dest.display().to_string());
        cmd.push("--service-account".to_string());
        cmd.push(sa.display().to_string());
        if self.overwrite {
            cmd.push("--overwrite".to_string());
        }
        if self.verbose {
            cmd.push("--verbose".to_string());
        }
        Ok(cmd)
    }
}

/// `POST /api/run-ocr`
#[derive(Debug, Clone, Deserialize)]
pub struct OcrPayload {
    pub source: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_dpi")]
    pub dpi: i64,
    #[serde(default)]
    pub min_length: i64,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl OcrPayload {
    pub fn command(&self, launcher: &Launcher) -> Result<Vec<String>> {
        if !matches!(self.device.as_str(), "auto" | "cuda" | "cpu") {
            bail!("device must be one of auto, cuda, cpu");
        }
        if self.dpi < MIN_DPI as i64 {
            bail!("dpi must be >= {}", MIN_DPI);
        }
        if self.min_length < 0 {
            bail!("min_length must be >= 0");
        }
        let source = existing_dir(&self.source, "Source directory not found")?;

        let mut cmd = launcher.base("ocr");
        cmd.push(source.display().to_string());
        if let Some(output) = self.output.as_deref().filter(|o| !o.trim().is_empty()) {
            cmd.push("--output".to_string());
            cmd.push(absolutize(&expand_home(output)).display().to_string());
        }
        cmd.push("--device".to_string());
        cmd.push(self.device.clone());
        cmd.push("--dpi".to_string());
        cmd.push(self.dpi.to_string());
        if self.min_length > 0 {
            cmd.push("--min-length".to_string());
            cmd.push(self.min_length.to_string());
        }
        if self.force {
            cmd.push("--force".to_string());
        }
        if self.verbose {
            cmd.push("--verbose".to_string());
        }
        Ok(cmd)
    }
}

/// `POST /api/run-analysis`
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisPayload {
    pub output_root: String,
    pub prompt: String,
    pub service_account: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_analysis_dir")]
    pub analysis_dir_name: String,
    #[serde(default = "default_chunk_size", alias = "chunk_size")]
    pub max_input_chars: i64,
    #[serde(default = "default_overlap")]
    pub chunk_overlap: i64,
    #[serde(default = "default_output_tokens")]
    pub max_output_tokens: i64,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl AnalysisPayload {
    pub fn command(&self, launcher: &Launcher) -> Result<Vec<String>> {
        if self.prompt.trim().is_empty() {
            bail!("prompt must not be empty");
        }
        if self.max_input_chars < MIN_CHUNK_SIZE {
            bail!("max_input_chars must be >= {}", MIN_CHUNK_SIZE);
        }
        if self.chunk_overlap < 0 {
            bail!("chunk_overlap must be >= 0");
        }
        if self.chunk_overlap >= self.max_input_chars {
            bail!("chunk_overlap must be smaller than max_input_chars");
        }
        if self.max_output_tokens < MIN_OUTPUT_TOKENS {
            bail!("max_output_tokens must be >= {}", MIN_OUTPUT_TOKENS);
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            bail!("temperature must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("top_p must be between 0 and 1");
        }
        if self.top_k < 1 {
            bail!("top_k must be >= 1");
        }
        if self.analysis_dir_name.trim().is_empty() {
            bail!("analysis_dir_name must not be empty");
        }
        let root = existing_dir(&self.output_root, "OCR output directory not found")?;
        let sa = existing_file(&self.service_account, "Service account file not found")?;

        let mut cmd = launcher.base("analyze");
        cmd.push(root.display().to_string());
        // Joined so a prompt starting with `-` is not read as a flag.
        cmd.push(format!("--prompt={}", self.prompt));
        for (flag, value) in [
            ("--service-account", sa.display().to_string()),
            ("--model", self.model.clone()),
            ("--region", self.region.clone()),
            ("--analysis-dir-name", self.analysis_dir_name.clone()),
            ("--chunk-size", self.max_input_chars.to_string()),
            ("--chunk-overlap", self.chunk_overlap.to_string()),
            ("--max-output-tokens", self.max_output_tokens.to_string()),
            ("--temperature", self.temperature.to_string()),
            ("--top-p", self.top_p.to_string()),
            ("--top-k", self.top_k.to_string()),
        ] {
            cmd.push(flag.to_string());
            cmd.push(value);
        }
        if self.force {
            cmd.push("--force".to_string());
        }
        if self.verbose {
            cmd.push("--verbose".to_string());
        }
        Ok(cmd)
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_home(raw: &str) -> PathBuf {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(raw)
}

/// Canonical path when it exists, otherwise joined onto the working directory.
fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn existing_dir(raw: &str, message: &str) -> Result<PathBuf> {
    let path = absolutize(&expand_home(raw));
    if !path.is_dir() {
        bail!("{}: {}", message, path.display());
    }
    Ok(path)
}

fn existing_file(raw: &str, message: &str) -> Result<PathBuf> {
    let path = absolutize(&expand_home(raw));
    if !path.is_file() {
        bail!("{}: {}", message, path.display());
    }
    Ok(path)
}
