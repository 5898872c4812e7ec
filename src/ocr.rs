//! The `ocr` command: text recognition over a folder of scans.
//!
//! Images are recognized directly, PDFs are rasterized page by page and each
//! page recognized, presentations have their slide text read from the
//! package. Every input gets a `.txt` at the mirrored path under the output
//! directory. Multi-page inputs carry a `--- Page N ---` marker before each
//! non-empty page.
//!
//! Recognition and rasterization are external programs behind the
//! [`OcrEngine`] and [`PageRasterizer`] traits; the defaults shell out to
//! `tesseract` and `pdftoppm`.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::config::{OcrConfig, MIN_DPI};
use crate::extract;
use crate::models::{Document, DocumentKind};
use crate::walker::{self, OCR_KINDS};

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Auto,
    Cuda,
    Cpu,
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Device::Auto),
            "cuda" => Ok(Device::Cuda),
            "cpu" => Ok(Device::Cpu),
            other => bail!("Unknown device '{}'. Expected auto, cuda or cpu", other),
        }
    }
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

/// Recognizes the text in one image file.
pub trait OcrEngine {
    fn recognize(&self, image: &Path) -> Result<String>;

    /// Whether the engine can run on a GPU.
    fn supports_gpu(&self) -> bool {
        false
    }
}

/// Renders each page of a PDF into an image inside `out_dir`.
pub trait PageRasterizer {
    /// Returns the page images in page order.
    fn rasterize(&self, pdf: &Path, dpi: u32, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// `tesseract <image> stdout -l <language>`
pub struct TesseractEngine {
    command: String,
    language: String,
}

impl TesseractEngine {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.engine_command.clone(),
            language: config.language.clone(),
        }
    }

    /// Fails when the engine binary cannot be started.
    pub fn probe(&self) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("--version")
            .output()
            .with_context(|| format!("OCR engine '{}' could not be started", self.command))?;
        if !output.status.success() {
            bail!("OCR engine '{}' is not usable", self.command);
        }
        Ok(())
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, image: &Path) -> Result<String> {
        let output = Command::new(&self.command)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()
            .with_context(|| format!("Failed to run '{}'", self.command))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(normalize_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `pdftoppm -r <dpi> -png <pdf> <out_dir>/page`
pub struct PdftoppmRasterizer {
    command: String,
}

impl PdftoppmRasterizer {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.rasterizer_command.clone(),
        }
    }
}

impl PageRasterizer for PdftoppmRasterizer {
    fn rasterize(&self, pdf: &Path, dpi: u32, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let output = Command::new(&self.command)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-png")
            .arg(pdf)
            .arg(out_dir.join("page"))
            .output()
            .with_context(|| format!("Failed to run '{}'", self.command))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        page_images(out_dir)
    }
}

/// Page images in `dir`, ordered by the page number suffix (`page-7.png`, `page-012.png`).
fn page_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<(u32, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.rsplit('-').next())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(u32::MAX);
        pages.push((number, path));
    }
    pages.sort();
    Ok(pages.into_iter().map(|(_, p)| p).collect())
}

/// Trimmed non-empty lines joined with `\n`.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Join per-page texts, skipping empty pages, with a marker before each page.
pub fn join_pages(pages: &[String]) -> String {
    let mut parts = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let text = page.trim();
        if text.is_empty() {
            continue;
        }
        parts.push(format!("--- Page {} ---", i + 1));
        parts.push(text.to_string());
    }
    parts.join("\n\n")
}

/// Inputs of one `ocr` run.
#[derive(Debug, Clone)]
pub struct OcrOptions {
    pub source: PathBuf,
    /// Defaults to `<source>/<ocr.output_dir_name>`.
    pub output: Option<PathBuf>,
    pub device: Device,
    pub dpi: u32,
    pub min_length: usize,
    pub force: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OcrStats {
    pub found: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Outcome for one input file.
#[derive(Debug, PartialEq, Eq)]
pub enum OcrOutcome {
    Written(PathBuf),
    Exists,
    TooShort(usize),
}

pub struct OcrRunner<'a> {
    pub engine: &'a dyn OcrEngine,
    pub rasterizer: &'a dyn PageRasterizer,
    pub output_dir: PathBuf,
    pub dpi: u32,
    pub min_length: usize,
    pub force: bool,
}

impl<'a> OcrRunner<'a> {
    pub fn output_path(&self, doc: &Document) -> PathBuf {
        self.output_dir.join(&doc.relative).with_extension("txt")
    }

    pub fn process_file(&self, doc: &Document) -> Result<OcrOutcome> {
        let out = self.output_path(doc);
        if out.exists() && !self.force {
            debug!("already exists, skipping: {}", out.display());
            return Ok(OcrOutcome::Exists);
        }

        info!("OCR: {}", doc.relative_display());
        let text = self.extract_text(doc)?;
        let length = text.trim().chars().count();
        if length < self.min_length {
            info!(
                "output too short, not written ({} chars): {}",
                length,
                doc.relative_display()
            );
            return Ok(OcrOutcome::TooShort(length));
        }

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&out, text).with_context(|| format!("Failed to write {}", out.display()))?;
        Ok(OcrOutcome::Written(out))
    }

    fn extract_text(&self, doc: &Document) -> Result<String> {
        match doc.kind {
            DocumentKind::Image => self.engine.recognize(&doc.path),
            DocumentKind::Pdf => {
                let pages_dir = tempfile::Builder::new().prefix("ocrflow-pages-").tempdir()?;
                let images = self.rasterizer.rasterize(&doc.path, self.dpi, pages_dir.path())?;
                let mut pages = Vec::with_capacity(images.len());
                for (i, image) in images.iter().enumerate() {
                    debug!("  page {}", i + 1);
                    pages.push(self.engine.recognize(image)?);
                }
                Ok(join_pages(&pages))
            }
            DocumentKind::Presentation => {
                let slides = extract::presentation_slides_from_file(&doc.path)?;
                Ok(join_pages(&slides))
            }
            DocumentKind::Text => bail!("not an OCR input: {}", doc.path.display()),
        }
    }

    /// Process every document. A file that errors is logged and counted in
    /// `failed`; the batch continues.
    pub fn run_batch(&self, documents: &[Document]) -> OcrStats {
        let mut stats = OcrStats {
            found: documents.len(),
            ..OcrStats::default()
        };
        for doc in documents {
            match self.process_file(doc) {
                Ok(OcrOutcome::Written(_)) => stats.written += 1,
                Ok(_) => stats.skipped += 1,
                Err(e) => {
                    error!("could not process {}: {:#}", doc.path.display(), e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

/// Resolve the device choice against what the engine can do.
pub fn select_device(choice: Device, engine: &dyn OcrEngine) -> Result<bool> {
    match choice {
        Device::Cpu => Ok(false),
        Device::Cuda if !engine.supports_gpu() => {
            bail!("GPU requested but the OCR engine has no GPU backend; use --device cpu or auto")
        }
        Device::Cuda => Ok(true),
        Device::Auto => Ok(engine.supports_gpu()),
    }
}

/// Entry point of `ocrflow ocr`.
pub fn run_ocr(opts: &OcrOptions, config: &OcrConfig) -> Result<OcrStats> {
    let source = &opts.source;
    if !source.is_dir() {
        bail!("Source directory not found: {}", source.display());
    }
    if opts.dpi < MIN_DPI {
        bail!("--dpi must be >= {}", MIN_DPI);
    }

    let output_dir = opts
        .output
        .clone()
        .unwrap_or_else(|| source.join(&config.output_dir_name));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let engine = TesseractEngine::new(config);
    let use_gpu = select_device(opts.device, &engine)?;

    let excludes: Vec<String> = walker::exclude_subtree(source, &output_dir).into_iter().collect();
    let documents = walker::discover(source, OCR_KINDS, &excludes)?;
    if documents.is_empty() {
        warn!("No supported documents found under {}", source.display());
        return Ok(OcrStats::default());
    }

    engine.probe()?;
    info!("OCR engine ready (GPU={})", use_gpu);
    info!("processing {} files...", documents.len());

    let rasterizer = PdftoppmRasterizer::new(config);
    let runner = OcrRunner {
        engine: &engine,
        rasterizer: &rasterizer,
        output_dir: output_dir.clone(),
        dpi: opts.dpi,
        min_length: opts.min_length,
        force: opts.force,
    };
    let stats = runner.run_batch(&documents);

    info!(
        "done: {} written, {} skipped, {} failed",
        stats.written, stats.skipped, stats.failed
    );
    info!("outputs: {}", output_dir.display());
    Ok(stats)
}
