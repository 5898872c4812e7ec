//! Google Drive folder downloader (`ocrflow fetch`).
//!
//! Mirrors a Drive folder tree into a local directory through the Drive v3
//! REST API. Regular files are downloaded as-is; Google-native documents,
//! presentations, spreadsheets and drawings are exported as PDF; other
//! native types (forms, sites, ...) have no byte representation and are
//! skipped with a warning.
//!
//! # Pagination
//!
//! Folder listings request `pageSize=1000` and follow `nextPageToken`
//! until the listing is exhausted.
//!
//! # Failure handling
//!
//! A failure to list the root folder aborts the run. Any later failure
//! (a subfolder listing, a single download) is logged, counted, and the walk
//! continues.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::DriveConfig;
use crate::credentials::{Credentials, DRIVE_SCOPE};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps";
const PAGE_SIZE: &str = "1000";

/// Export format for a Google-native MIME type: `(export_mime, extension)`.
pub fn export_target(mime_type: &str) -> Option<(&'static str, &'static str)> {
    match mime_type {
        "application/vnd.google-apps.document"
        | "application/vnd.google-apps.presentation"
        | "application/vnd.google-apps.spreadsheet"
        | "application/vnd.google-apps.drawing" => Some(("application/pdf", "pdf")),
        _ => None,
    }
}

/// Replace runs of characters that are invalid in file names with `_`.
///
/// Names made only of dots (`.`, `..`) become `_` so a remote entry can
/// never point outside its parent directory.
pub fn sanitize_filename(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let re = INVALID.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\r\n]+"#).expect("valid regex"));
    let cleaned = re.replace_all(name, "_");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else if cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Quote `value` as a Drive query string literal.
fn query_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Thin Drive v3 client.
pub struct DriveClient {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
}

impl DriveClient {
    pub fn new(config: &DriveConfig, credentials: &Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: config.endpoint.trim_end_matches('/').to_string(),
            credentials: credentials.clone(),
        })
    }

    /// Every non-trashed child of `folder_id`, across all pages.
    pub async fn list_children(&self, folder_id: &str) -> Result<Vec<DriveItem>> {
        let url = format!("{}/files", self.base);
        let query = format!("{} in parents and trashed = false", query_literal(folder_id));
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.clone()),
                ("fields", "nextPageToken, files(id, name, mimeType)".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            if let Some(ref token) = page_token {
                params.push(("pageToken", token.clone()));
            }

            let response = self
                .http
                .get(&url)
                .header("Authorization", self.credentials.bearer().await?)
                .query(&params)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("Drive list error {}: {}", status, body);
            }

            let page: FileList = response.json().await.context("Invalid Drive listing")?;
            items.extend(page.files);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(items)
    }

    pub async fn download(&self, file_id: &str, target: &Path) -> Result<()> {
        let url = format!("{}/files/{}", self.base, file_id);
        self.fetch_to(&url, &[("alt", "media")], target).await
    }

    pub async fn export(&self, file_id: &str, export_mime: &str, target: &Path) -> Result<()> {
        let url = format!("{}/files/{}/export", self.base, file_id);
        self.fetch_to(&url, &[("mimeType", export_mime)], target).await
    }

    async fn fetch_to(&self, url: &str, params: &[(&str, &str)], target: &Path) -> Result<()> {
        let response = self
            .http
            .get(url)
            .header("Authorization", self.credentials.bearer().await?)
            .query(params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Drive download error {}: {}", status, body);
        }
        let bytes = response.bytes().await?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(target, &bytes)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        Ok(())
    }
}

/// Inputs of one `fetch` run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub folder_id: String,
    pub destination: PathBuf,
    pub service_account: PathBuf,
    pub overwrite: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub downloaded: usize,
    pub exported: usize,
    pub skipped: usize,
    pub unsupported: usize,
    pub failed: usize,
}

/// Walk `folder_id` and mirror it into `destination`.
pub async fn fetch_folder(
    client: &DriveClient,
    folder_id: &str,
    destination: &Path,
    overwrite: bool,
) -> Result<FetchStats> {
    let mut stats = FetchStats::default();
    let mut pending: Vec<(String, PathBuf)> = vec![(folder_id.to_string(), destination.to_path_buf())];
    let mut visited: HashSet<String> = HashSet::new();

    while let Some((current_id, current_dest)) = pending.pop() {
        if !visited.insert(current_id.clone()) {
            continue;
        }
        std::fs::create_dir_all(&current_dest)
            .with_context(|| format!("Failed to create {}", current_dest.display()))?;

        let children = match client.list_children(&current_id).await {
            Ok(children) => children,
            Err(e) if current_id == folder_id => {
                return Err(e.context(format!("Could not list Drive folder {}", folder_id)));
            }
            Err(e) => {
                error!("could not list folder {} ({}): {:#}", current_id, current_dest.display(), e);
                stats.failed += 1;
                continue;
            }
        };
        debug!("{} entries in {}", children.len(), current_dest.display());

        for item in children {
            let name = sanitize_filename(item.name.as_deref().unwrap_or("unnamed"));
            let mut target = current_dest.join(&name);

            if item.mime_type == FOLDER_MIME {
                pending.push((item.id, target));
                continue;
            }

            let export = if item.mime_type.starts_with(NATIVE_MIME_PREFIX) {
                match export_target(&item.mime_type) {
                    Some((export_mime, ext)) => {
                        let has_ext = target
                            .extension()
                            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                            .unwrap_or(false);
                        if !has_ext {
                            target = target.with_extension(ext);
                        }
                        Some(export_mime)
                    }
                    None => {
                        warn!("unsupported Google file type skipped: {} ({})", name, item.mime_type);
                        stats.unsupported += 1;
                        continue;
                    }
                }
            } else {
                None
            };

            if !overwrite && target.exists() {
                info!("already exists, skipping: {}", target.display());
                stats.skipped += 1;
                continue;
            }

            let result = match export {
                Some(export_mime) => {
                    info!("exporting Drive file: {} -> {}", name, target.display());
                    client.export(&item.id, export_mime, &target).await
                }
                None => {
                    info!("downloading Drive file: {} -> {}", name, target.display());
                    client.download(&item.id, &target).await
                }
            };

            match result {
                Ok(()) if export.is_some() => stats.exported += 1,
                Ok(()) => stats.downloaded += 1,
                Err(e) => {
                    error!("could not download {}: {:#}", target.display(), e);
                    stats.failed += 1;
                }
            }
        }
    }

    Ok(stats)
}

/// Entry point of `ocrflow fetch`.
pub async fn run_fetch(opts: &FetchOptions, config: &DriveConfig) -> Result<FetchStats> {
    if !opts.service_account.exists() {
        bail!("Service account file not found: {}", opts.service_account.display());
    }
    let credentials = Credentials::load(&opts.service_account, DRIVE_SCOPE)?;
    credentials
        .bearer()
        .await
        .context("Drive credentials could not be authorized")?;
    let client = DriveClient::new(config, &credentials)?;

    std::fs::create_dir_all(&opts.destination)
        .with_context(|| format!("Failed to create {}", opts.destination.display()))?;
    info!(
        "downloading Drive folder: {} -> {}",
        opts.folder_id,
        opts.destination.display()
    );

    let stats = fetch_folder(&client, &opts.folder_id, &opts.destination, opts.overwrite).await?;
    info!(
        "download finished: {} downloaded, {} exported, {} skipped, {} failed",
        stats.downloaded, stats.exported, stats.skipped, stats.failed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, tmp: &TempDir) -> DriveClient {
        let sa = tmp.path().join("sa.json");
        fs::write(&sa, r#"{"project_id":"p","access_token":"drive-token"}"#).unwrap();
        let creds = Credentials::load(&sa, DRIVE_SCOPE).unwrap();
        let config = DriveConfig {
            endpoint: server.uri(),
            ..DriveConfig::default()
        };
        DriveClient::new(&config, &creds).unwrap()
    }

    fn listing(folder: &str) -> String {
        format!("'{}' in parents and trashed = false", folder)
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_filename("a/b:c"), "a_b_c");
        assert_eq!(sanitize_filename("x<>|y"), "x_y");
        assert_eq!(sanitize_filename("  report.pdf "), "report.pdf");
        assert_eq!(sanitize_filename("  "), "unnamed");
        assert_eq!(sanitize_filename("???"), "_");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(" ... "), "_");
        assert_eq!(sanitize_filename("..notes"), "..notes");
    }

    #[test]
    fn quotes_query_literals() {
        assert_eq!(query_literal("abc"), "'abc'");
        assert_eq!(query_literal("a'b"), r"'a\'b'");
        assert_eq!(query_literal(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn export_map_covers_native_types() {
        assert_eq!(
            export_target("application/vnd.google-apps.spreadsheet"),
            Some(("application/pdf", "pdf"))
        );
        assert_eq!(export_target("application/vnd.google-apps.form"), None);
        assert_eq!(export_target("application/pdf"), None);
    }

    #[tokio::test]
    async fn mirrors_tree_with_exports_and_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(header("Authorization", "Bearer drive-token"))
            .and(query_param("q", listing("root")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"id": "sub", "name": "Scans", "mimeType": FOLDER_MIME},
                    {"id": "doc1", "name": "Notes", "mimeType": "application/vnd.google-apps.document"},
                    {"id": "form1", "name": "Survey", "mimeType": "application/vnd.google-apps.form"},
                    {"id": "f1", "name": "a:b.png", "mimeType": "image/png"}
                ]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", listing("sub")))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "f3", "name": "page2.jpg", "mimeType": "image/jpeg"}]
            })))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", listing("sub")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "f2", "name": "page1.jpg", "mimeType": "image/jpeg"}],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/files/doc1/export"))
            .and(query_param("mimeType", "application/pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-notes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        for (id, body) in [("f1", "png-bytes"), ("f2", "jpg-1"), ("f3", "jpg-2")] {
            Mock::given(method("GET"))
                .and(path(format!("/files/{}", id)))
                .and(query_param("alt", "media"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body.as_bytes().to_vec()))
                .mount(&server)
                .await;
        }

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        let stats = fetch_folder(&client(&server, &tmp), "root", &dest, false)
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.exported, 1);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(fs::read_to_string(dest.join("a_b.png")).unwrap(), "png-bytes");
        assert_eq!(fs::read_to_string(dest.join("Notes.pdf")).unwrap(), "%PDF-notes");
        assert_eq!(fs::read_to_string(dest.join("Scans/page1.jpg")).unwrap(), "jpg-1");
        assert_eq!(fs::read_to_string(dest.join("Scans/page2.jpg")).unwrap(), "jpg-2");
        assert!(!dest.join("Survey").exists());
    }

    #[tokio::test]
    async fn dot_names_stay_inside_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", listing("root")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "up", "name": "..", "mimeType": FOLDER_MIME}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", listing("up")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "evil", "name": "evil.txt", "mimeType": "text/plain"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/evil"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        let stats = fetch_folder(&client(&server, &tmp), "root", &dest, false)
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 1);
        assert_eq!(fs::read_to_string(dest.join("_/evil.txt")).unwrap(), "payload");
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn quoted_folder_id_is_escaped_in_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", r"'it\'s' in parents and trashed = false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let items = client(&server, &tmp).list_children("it's").await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn existing_files_skipped_and_failures_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [
                    {"id": "keep", "name": "kept.txt", "mimeType": "text/plain"},
                    {"id": "bad", "name": "bad.txt", "mimeType": "text/plain"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/bad"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/keep"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("kept.txt"), "old").unwrap();

        let drive = client(&server, &tmp);
        let stats = fetch_folder(&drive, "root", &dest, false).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(fs::read_to_string(dest.join("kept.txt")).unwrap(), "old");

        let stats = fetch_folder(&drive, "root", &dest, true).await.unwrap();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(fs::read_to_string(dest.join("kept.txt")).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn root_listing_failure_aborts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such folder"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let err = fetch_folder(&client(&server, &tmp), "missing", &tmp.path().join("d"), false)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("404"));
    }
}
