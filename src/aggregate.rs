//! Per-file and cross-file aggregation of parsed model payloads.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::models::{
    AnalysisRecord, AnalysisSummary, ChunkResult, CombinedReport, FileAnalysis, FileTerms,
};

/// Payload keys whose string lists are collected as extracted terms.
pub const TERM_KEYS: [&str; 4] = ["terms", "terimler", "keywords", "anahtar_kelimeler"];

/// Fold one document's chunk results into a [`FileAnalysis`].
///
/// Terms are trimmed, blank entries dropped, and the union is sorted. When
/// no chunk yields a term the summary carries no term list at all.
pub fn aggregate_chunks(chunks: Vec<ChunkResult>) -> FileAnalysis {
    let mut union = BTreeSet::new();
    for chunk in &chunks {
        if let Some(Value::Object(payload)) = &chunk.parsed_json {
            for key in TERM_KEYS {
                if let Some(Value::Array(items)) = payload.get(key) {
                    union.extend(
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string),
                    );
                }
            }
        }
    }

    let unique_terms = if union.is_empty() {
        None
    } else {
        Some(union.into_iter().collect())
    };

    FileAnalysis {
        chunks,
        summary: AnalysisSummary { unique_terms },
    }
}

/// Build the batch-wide report, ordered by relative path.
pub fn combine(records: &[AnalysisRecord]) -> CombinedReport {
    let mut global = BTreeSet::new();
    let mut files: Vec<FileTerms> = records
        .iter()
        .map(|record| {
            let terms = record
                .unique_terms()
                .filter(|terms| !terms.is_empty())
                .map(<[String]>::to_vec);
            if let Some(terms) = &terms {
                global.extend(terms.iter().cloned());
            }
            FileTerms {
                relative_path: record.relative_path.clone(),
                terms,
            }
        })
        .collect();

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    CombinedReport {
        global_terms: global.into_iter().collect(),
        files,
    }
}
