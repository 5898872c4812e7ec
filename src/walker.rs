//! Recursive discovery of input files.
//!
//! Walks a root directory, keeps regular files whose extension maps to one
//! of the requested [`DocumentKind`]s, drops anything matching the exclude
//! globs (matched against the root-relative path), and returns the result
//! sorted by relative path so every run sees the same order.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::models::{Document, DocumentKind};

/// Extensions accepted by the OCR command.
pub const OCR_KINDS: &[DocumentKind] = &[
    DocumentKind::Image,
    DocumentKind::Pdf,
    DocumentKind::Presentation,
];

/// Extensions accepted by the analysis command.
pub const TEXT_KINDS: &[DocumentKind] = &[DocumentKind::Text];

pub fn discover(root: &Path, kinds: &[DocumentKind], exclude_globs: &[String]) -> Result<Vec<Document>> {
    if !root.is_dir() {
        bail!("Scan root does not exist: {}", root.display());
    }

    let exclude_set = build_globset(exclude_globs)?;
    let mut documents = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(kind) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(DocumentKind::from_extension)
        else {
            continue;
        };
        if !kinds.contains(&kind) {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        if exclude_set.is_match(&relative) {
            continue;
        }

        documents.push(Document {
            path: path.to_path_buf(),
            relative,
            kind,
        });
    }

    documents.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(documents)
}

/// Exclude pattern covering everything beneath `dir`, when `dir` lies inside `root`.
pub fn exclude_subtree(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let rel = rel.to_string_lossy().replace('\\', "/");
    Some(format!("{}/**", rel.trim_end_matches('/')))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
