//! Core data models used throughout ocrflow.
//!
//! These types represent the documents, chunks, and analysis results that
//! flow through the OCR and analysis pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// File-type classification derived from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Image,
    Pdf,
    Presentation,
    Text,
}

impl DocumentKind {
    /// Classify a file by its extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "bmp" | "tif" | "tiff" | "webp" => Some(Self::Image),
            "pdf" => Some(Self::Pdf),
            "pptx" => Some(Self::Presentation),
            "txt" => Some(Self::Text),
            _ => None,
        }
    }
}

/// A discovered input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the scan root.
    pub relative: PathBuf,
    pub kind: DocumentKind,
}

impl Document {
    /// Relative path rendered with `/` separators, used in reports and logs.
    pub fn relative_display(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A window of a document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position within the document.
    pub index: usize,
    /// Start offset in characters (inclusive).
    pub start: usize,
    /// End offset in characters (exclusive).
    pub end: usize,
    pub text: String,
}

/// Model output for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub raw_response: String,
    pub parsed_json: Option<Value>,
}

/// Derived per-file summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_terms: Option<Vec<String>>,
}

/// All chunk results for one document plus the derived summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub chunks: Vec<ChunkResult>,
    pub summary: AnalysisSummary,
}

/// The per-file analysis document written as `<stem>.analysis.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub input_file: String,
    pub relative_path: String,
    pub model: String,
    pub region: String,
    pub project_id: Option<String>,
    pub prompt: String,
    pub created_at: String,
    pub results: FileAnalysis,
}

impl AnalysisRecord {
    pub fn unique_terms(&self) -> Option<&[String]> {
        self.results.summary.unique_terms.as_deref()
    }
}

/// One file's row in the combined report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTerms {
    pub relative_path: String,
    /// `None` when the file produced no recognized terms.
    pub terms: Option<Vec<String>>,
}

/// Cross-file view over a batch of analyses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedReport {
    pub global_terms: Vec<String>,
    pub files: Vec<FileTerms>,
}
