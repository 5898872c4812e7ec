//! The `analyze` command: chunked model analysis of OCR text outputs.
//!
//! For every `.txt` file under the output root (excluding the analysis
//! directory itself), the text is split with [`TextChunker`], each chunk is
//! sent to the [`ModelClient`] in order, responses are parsed with
//! [`parse_response`] and folded into a per-file [`AnalysisRecord`]. The
//! record is written as JSON plus a readable text rendering at a mirrored
//! path, and a Markdown report combines every file of the batch.
//!
//! A failed model call does not abort the file: the error text is stored as
//! that chunk's response and processing moves on. A failed file does not
//! abort the batch.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::aggregate::{aggregate_chunks, combine};
use crate::chunk::TextChunker;
use crate::config::{AnalysisConfig, DEFAULT_MAX_OUTPUT_TOKENS};
use crate::credentials::{Credentials, CLOUD_PLATFORM_SCOPE};
use crate::model_client::{GenerationSettings, ModelClient, VertexClient};
use crate::models::{AnalysisRecord, ChunkResult, CombinedReport, Document};
use crate::parse::parse_response;
use crate::walker::{self, TEXT_KINDS};

/// File name of the batch report inside the analysis directory.
pub const COMBINED_REPORT_NAME: &str = "combined_report.md";

/// Prefix of the response stored for a chunk whose model call failed.
pub const MODEL_ERROR_PREFIX: &str = "[MODEL ERROR]";

/// Inputs of one `analyze` run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub output_root: PathBuf,
    pub prompt: String,
    pub service_account: PathBuf,
    pub settings: AnalysisConfig,
    /// Re-analyze files whose `.analysis.json` already exists.
    pub force: bool,
}

/// Counts reported at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnalysisStats {
    pub found: usize,
    pub analyzed: usize,
    pub reused: usize,
    pub empty: usize,
    pub failed: usize,
}

/// Where one input's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub json: PathBuf,
    pub txt: PathBuf,
}

/// `{analysis_dir}/{relative_dir}/{stem}.analysis.{json,txt}`
pub fn mirror_output_paths(analysis_dir: &Path, relative: &Path) -> OutputPaths {
    let dir = match relative.parent() {
        Some(parent) => analysis_dir.join(parent),
        None => analysis_dir.to_path_buf(),
    };
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    OutputPaths {
        json: dir.join(format!("{}.analysis.json", stem)),
        txt: dir.join(format!("{}.analysis.txt", stem)),
    }
}

/// Result of handling one input file.
#[derive(Debug)]
pub enum FileOutcome {
    Analyzed(AnalysisRecord),
    Reused(AnalysisRecord),
    Empty,
}

/// Per-run state shared by every file of the batch.
pub struct Analyzer<'a> {
    pub client: &'a dyn ModelClient,
    pub chunker: TextChunker,
    pub prompt: String,
    pub analysis_dir: PathBuf,
    pub region: String,
    pub project_id: Option<String>,
    pub force: bool,
}

impl<'a> Analyzer<'a> {
    pub async fn process_file(&self, doc: &Document, index: usize, total: usize) -> Result<FileOutcome> {
        let rel = doc.relative_display();
        info!("[{}/{}] processing {}", index, total, rel);

        let paths = mirror_output_paths(&self.analysis_dir, &doc.relative);
        if !self.force && paths.json.exists() {
            match load_record(&paths.json) {
                Ok(record) => {
                    info!("  already analyzed, reusing {}", paths.json.display());
                    return Ok(FileOutcome::Reused(record));
                }
                Err(e) => warn!("  existing analysis unreadable, redoing: {:#}", e),
            }
        }

        let text = read_text(&doc.path)?;
        let chunks = self.chunker.chunk(&text);
        info!("  chunks: {}", chunks.len());
        if chunks.is_empty() {
            warn!("  skipped, no text: {}", rel);
            return Ok(FileOutcome::Empty);
        }

        let mut results = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let raw_response = match self.client.generate(&self.prompt, &chunk.text).await {
                Ok(text) => text,
                Err(e) => {
                    error!("    chunk {} failed: {:#}", chunk.index, e);
                    format!("{}: {:#}", MODEL_ERROR_PREFIX, e)
                }
            };
            debug!("    chunk {} -> {} chars", chunk.index, raw_response.len());
            let parsed_json = parse_response(&raw_response);
            results.push(ChunkResult {
                chunk_index: chunk.index,
                raw_response,
                parsed_json,
            });
        }

        let record = AnalysisRecord {
            input_file: doc.path.display().to_string(),
            relative_path: rel,
            model: self.client.model_name().to_string(),
            region: self.region.clone(),
            project_id: self.project_id.clone(),
            prompt: self.prompt.clone(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            results: aggregate_chunks(results),
        };

        write_record(&paths, &record)?;
        info!("  ok -> {}", paths.json.display());

        Ok(FileOutcome::Analyzed(record))
    }

    /// Process every document in order; per-file failures are counted, not propagated.
    pub async fn run_batch(&self, documents: &[Document]) -> Result<(AnalysisStats, Vec<AnalysisRecord>)> {
        let mut stats = AnalysisStats {
            found: documents.len(),
            ..AnalysisStats::default()
        };
        let mut records = Vec::new();

        for (i, doc) in documents.iter().enumerate() {
            match self.process_file(doc, i + 1, documents.len()).await {
                Ok(FileOutcome::Analyzed(record)) => {
                    stats.analyzed += 1;
                    records.push(record);
                }
                Ok(FileOutcome::Reused(record)) => {
                    stats.reused += 1;
                    records.push(record);
                }
                Ok(FileOutcome::Empty) => stats.empty += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!("failed to process {}: {:#}", doc.path.display(), e);
                }
            }
        }

        Ok((stats, records))
    }
}

/// Entry point of `ocrflow analyze`.
pub async fn run_analysis(opts: &AnalysisOptions) -> Result<AnalysisStats> {
    let root = &opts.output_root;
    if !root.is_dir() {
        bail!("OCR output directory not found: {}", root.display());
    }
    if !opts.service_account.exists() {
        bail!("Service account file not found: {}", opts.service_account.display());
    }

    let settings = &opts.settings;
    let chunker = TextChunker::new(settings.chunk_size, settings.chunk_overlap)
        .with_context(|| "Invalid chunk settings")?;

    let analysis_dir = root.join(&settings.analysis_dir_name);
    let excludes: Vec<String> = walker::exclude_subtree(root, &analysis_dir).into_iter().collect();
    let documents = walker::discover(root, TEXT_KINDS, &excludes)?;
    if documents.is_empty() {
        warn!("No .txt files to analyze under {}", root.display());
        return Ok(AnalysisStats::default());
    }

    let credentials = Credentials::load(&opts.service_account, CLOUD_PLATFORM_SCOPE)
        .with_context(|| "Model client could not be initialized")?;
    credentials
        .bearer()
        .await
        .with_context(|| "Model client could not be initialized")?;
    let generation = GenerationSettings {
        max_output_tokens: settings.max_output_tokens.max(DEFAULT_MAX_OUTPUT_TOKENS),
        temperature: settings.temperature,
        top_p: settings.top_p,
        top_k: settings.top_k,
    };
    let client = VertexClient::new(settings, &credentials, generation)
        .with_context(|| "Model client could not be initialized")?;

    info!(
        "analysis started: files={} model={} region={}",
        documents.len(),
        settings.model,
        settings.region
    );

    let analyzer = Analyzer {
        client: &client,
        chunker,
        prompt: opts.prompt.clone(),
        analysis_dir: analysis_dir.clone(),
        region: settings.region.clone(),
        project_id: credentials.project_id.clone(),
        force: opts.force,
    };

    let (stats, records) = analyzer.run_batch(&documents).await?;
    if records.is_empty() {
        bail!("No file could be analyzed ({} failed, {} empty)", stats.failed, stats.empty);
    }

    let report_path = analysis_dir.join(COMBINED_REPORT_NAME);
    write_combined_report(&report_path, &settings.model, &settings.region, &opts.prompt, &records)?;

    info!(
        "analysis finished: analyzed={} reused={} failed={} dir={}",
        stats.analyzed,
        stats.reused,
        stats.failed,
        analysis_dir.display()
    );
    info!("combined report: {}", report_path.display());

    Ok(stats)
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

fn load_record(path: &Path) -> Result<AnalysisRecord> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_record(paths: &OutputPaths, record: &AnalysisRecord) -> Result<()> {
    if let Some(dir) = paths.json.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(&paths.json, serde_json::to_string_pretty(record)?)
        .with_context(|| format!("Failed to write {}", paths.json.display()))?;
    std::fs::write(&paths.txt, render_record_text(record))
        .with_context(|| format!("Failed to write {}", paths.txt.display()))?;
    Ok(())
}

/// Human-readable rendering of one file's analysis.
pub fn render_record_text(record: &AnalysisRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Source: {}", record.relative_path);
    let _ = writeln!(out, "# Model: {} | Region: {}", record.model, record.region);
    let _ = writeln!(out, "# Prompt: {}", record.prompt);

    if let Some(terms) = record.unique_terms().filter(|t| !t.is_empty()) {
        out.push_str("\n## Combined Terms\n");
        for term in terms {
            let _ = writeln!(out, "- {}", term);
        }
    }

    out.push_str("\n## Responses by Chunk\n");
    for chunk in &record.results.chunks {
        let _ = writeln!(out, "\n--- Chunk {} ---", chunk.chunk_index);
        match &chunk.parsed_json {
            Some(parsed) => {
                out.push_str(&serde_json::to_string_pretty(parsed).unwrap_or_default());
                out.push('\n');
            }
            None => {
                out.push_str(&chunk.raw_response);
                out.push('\n');
            }
        }
    }
    out
}

/// Markdown rendering of a [`CombinedReport`].
pub fn render_combined_report(
    report: &CombinedReport,
    model: &str,
    region: &str,
    prompt: &str,
) -> String {
    let mut out = String::new();
    out.push_str("# Gemini Analysis Report\n");
    let _ = writeln!(out, "Model: {}", model);
    let _ = writeln!(out, "Region: {}", region);
    let _ = writeln!(out, "Prompt: {}", prompt);
    let _ = writeln!(out, "Total files: {}\n", report.files.len());

    if !report.global_terms.is_empty() {
        out.push_str("## Combined Terms\n");
        for term in &report.global_terms {
            let _ = writeln!(out, "- {}", term);
        }
        out.push('\n');
    }

    for file in &report.files {
        let _ = writeln!(out, "## {}", file.relative_path);
        match &file.terms {
            Some(terms) => {
                let _ = writeln!(out, "- Terms: {}", terms.join(", "));
            }
            None => out.push_str("- No terms found\n"),
        }
        out.push('\n');
    }
    out
}

pub fn write_combined_report(
    path: &Path,
    model: &str,
    region: &str,
    prompt: &str,
    records: &[AnalysisRecord],
) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let report = combine(records);
    std::fs::write(path, render_combined_report(&report, model, region, prompt))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentKind;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Answers from a queue; `Err` entries simulate failed calls.
    struct ScriptedClient {
        answers: Mutex<Vec<Result<String, String>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(answers: Vec<Result<&str, &str>>) -> Self {
            let mut answers: Vec<Result<String, String>> = answers
                .into_iter()
                .map(|a| a.map(String::from).map_err(String::from))
                .collect();
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str, chunk: &str) -> Result<String> {
            self.seen.lock().unwrap().push(chunk.to_string());
            match self.answers.lock().unwrap().pop() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok("no answer".to_string()),
            }
        }
    }

    fn doc(root: &Path, rel: &str, body: &str) -> Document {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        Document {
            path,
            relative: PathBuf::from(rel),
            kind: DocumentKind::Text,
        }
    }

    fn analyzer<'a>(client: &'a dyn ModelClient, root: &Path, size: usize, overlap: usize) -> Analyzer<'a> {
        Analyzer {
            client,
            chunker: TextChunker::new(size, overlap).unwrap(),
            prompt: "list the terms".to_string(),
            analysis_dir: root.join("analysis_outputs"),
            region: "us-central1".to_string(),
            project_id: Some("proj".to_string()),
            force: false,
        }
    }

    #[test]
    fn mirrors_relative_directories() {
        let paths = mirror_output_paths(Path::new("/out/analysis"), Path::new("a/b/scan.txt"));
        assert_eq!(paths.json, PathBuf::from("/out/analysis/a/b/scan.analysis.json"));
        assert_eq!(paths.txt, PathBuf::from("/out/analysis/a/b/scan.analysis.txt"));

        let top = mirror_output_paths(Path::new("/out/analysis"), Path::new("top.txt"));
        assert_eq!(top.json, PathBuf::from("/out/analysis/top.analysis.json"));
    }

    #[tokio::test]
    async fn two_chunks_terms_are_unioned_and_written() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let text: String = "x".repeat(6200);
        let d = doc(root, "sub/file.txt", &text);

        let client = ScriptedClient::new(vec![
            Ok(r#"{"terms": ["a","b"]}"#),
            Ok("```json\n{\"terms\": [\"b\",\"c\"]}\n```"),
        ]);
        let a = analyzer(&client, root, 6000, 300);

        let outcome = a.process_file(&d, 1, 1).await.unwrap();
        let FileOutcome::Analyzed(record) = outcome else {
            panic!("expected analyzed outcome");
        };
        assert_eq!(record.unique_terms().unwrap(), ["a", "b", "c"]);
        assert_eq!(record.results.chunks.len(), 2);
        assert_eq!(record.results.chunks[1].chunk_index, 2);

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 6000);
        assert_eq!(seen[1].len(), 500);

        let json_path = root.join("analysis_outputs/sub/file.analysis.json");
        let stored: AnalysisRecord =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(stored, record);
        let txt = fs::read_to_string(root.join("analysis_outputs/sub/file.analysis.txt")).unwrap();
        assert!(txt.contains("## Combined Terms\n- a\n- b\n- c\n"));
        assert!(txt.contains("--- Chunk 2 ---"));
    }

    #[tokio::test]
    async fn failed_chunk_embeds_error_and_continues() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let d = doc(root, "f.txt", "abcdefghij");

        let client = ScriptedClient::new(vec![Err("quota exceeded"), Ok(r#"{"keywords": ["k"]}"#)]);
        let a = analyzer(&client, root, 6, 1);

        let FileOutcome::Analyzed(record) = a.process_file(&d, 1, 1).await.unwrap() else {
            panic!("expected analyzed outcome");
        };
        let first = &record.results.chunks[0];
        assert!(first.raw_response.starts_with(MODEL_ERROR_PREFIX));
        assert!(first.raw_response.contains("quota exceeded"));
        assert_eq!(first.parsed_json, None);
        assert_eq!(record.unique_terms().unwrap(), ["k"]);
    }

    #[tokio::test]
    async fn empty_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let d = doc(root, "empty.txt", "");
        let client = ScriptedClient::new(vec![]);
        let a = analyzer(&client, root, 10, 2);

        assert!(matches!(a.process_file(&d, 1, 1).await.unwrap(), FileOutcome::Empty));
        assert!(!root.join("analysis_outputs/empty.analysis.json").exists());
    }

    #[tokio::test]
    async fn existing_analysis_is_reused_unless_forced() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let d = doc(root, "f.txt", "short text");

        let client = ScriptedClient::new(vec![Ok(r#"{"terms": ["first"]}"#), Ok(r#"{"terms": ["second"]}"#)]);
        let mut a = analyzer(&client, root, 100, 10);

        assert!(matches!(a.process_file(&d, 1, 1).await.unwrap(), FileOutcome::Analyzed(_)));
        let FileOutcome::Reused(record) = a.process_file(&d, 1, 1).await.unwrap() else {
            panic!("expected reuse");
        };
        assert_eq!(record.unique_terms().unwrap(), ["first"]);
        assert_eq!(client.seen.lock().unwrap().len(), 1);

        a.force = true;
        let FileOutcome::Analyzed(record) = a.process_file(&d, 1, 1).await.unwrap() else {
            panic!("expected re-analysis");
        };
        assert_eq!(record.unique_terms().unwrap(), ["second"]);
    }

    #[tokio::test]
    async fn batch_report_lists_no_terms_marker() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let docs = vec![doc(root, "one.txt", "first file"), doc(root, "two.txt", "second file")];

        let client = ScriptedClient::new(vec![Ok(r#"{"terms": ["x"]}"#), Ok("nothing structured here")]);
        let a = analyzer(&client, root, 100, 10);
        let (stats, records) = a.run_batch(&docs).await.unwrap();
        assert_eq!(stats.analyzed, 2);
        assert_eq!(stats.failed, 0);

        let report_path = root.join("analysis_outputs").join(COMBINED_REPORT_NAME);
        write_combined_report(&report_path, "scripted", "us-central1", "list the terms", &records).unwrap();
        let report = fs::read_to_string(&report_path).unwrap();

        assert!(report.contains("Total files: 2"));
        assert!(report.contains("## Combined Terms\n- x\n"));
        assert!(report.contains("## one.txt\n- Terms: x\n"));
        assert!(report.contains("## two.txt\n- No terms found\n"));
        let one = report.find("## one.txt").unwrap();
        let two = report.find("## two.txt").unwrap();
        assert!(one < two);
    }

    #[test]
    fn combined_report_without_terms_has_no_global_section() {
        let report = CombinedReport {
            global_terms: vec![],
            files: vec![crate::models::FileTerms {
                relative_path: "a.txt".to_string(),
                terms: None,
            }],
        };
        let md = render_combined_report(&report, "m", "r", "p");
        assert!(!md.contains("## Combined Terms"));
        assert!(md.contains("## a.txt\n- No terms found\n"));
    }
}
