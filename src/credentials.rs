//! Service-account credential loading.
//!
//! Both Google APIs used here (Drive and Vertex AI) authenticate with an
//! OAuth bearer token. The credential reference passed on the command line
//! is a service-account JSON key file; it supplies the `project_id` used to
//! address Vertex AI and the key used to obtain tokens.
//!
//! # Token resolution
//!
//! 1. An `access_token` field in the file, if present.
//! 2. The `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable (for example the
//!    output of `gcloud auth print-access-token`).
//! 3. The service-account flow: an RS256-signed JWT assertion built from
//!    `client_email` and `private_key` is exchanged at the file's
//!    `token_uri`. Minted tokens are cached and renewed shortly before they
//!    expire.

use anyhow::{bail, Context, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Environment variable consulted when the credential file has no token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Read-only Drive access.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
/// Vertex AI access.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const RENEW_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct ServiceAccountFile {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    client_email: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Clone)]
enum TokenSource {
    Fixed(String),
    ServiceAccount {
        client_email: String,
        key: Arc<EncodingKey>,
        token_uri: String,
        scope: String,
        http: reqwest::Client,
        cache: Arc<Mutex<Option<CachedToken>>>,
    },
}

/// Resolved credentials for one run.
#[derive(Clone)]
pub struct Credentials {
    pub path: PathBuf,
    pub project_id: Option<String>,
    pub client_email: Option<String>,
    source: TokenSource,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            TokenSource::Fixed(_) => "fixed token",
            TokenSource::ServiceAccount { .. } => "service account key",
        };
        f.debug_struct("Credentials")
            .field("path", &self.path)
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("source", &source)
            .finish()
    }
}

impl Credentials {
    /// Load a service-account file; tokens minted from its key carry `scope`.
    pub fn load(path: &Path, scope: &str) -> Result<Self> {
        if !path.exists() {
            bail!("Service account file not found: {}", path.display());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account file: {}", path.display()))?;
        let file: ServiceAccountFile = serde_json::from_str(&content)
            .with_context(|| format!("Service account JSON could not be parsed: {}", path.display()))?;

        let fixed = file
            .access_token
            .clone()
            .or_else(|| std::env::var(ACCESS_TOKEN_ENV).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let source = match (fixed, &file.client_email, &file.private_key) {
            (Some(token), _, _) => TokenSource::Fixed(token),
            (None, Some(email), Some(pem)) => {
                let key = EncodingKey::from_rsa_pem(pem.as_bytes()).with_context(|| {
                    format!("Invalid private_key in service account file: {}", path.display())
                })?;
                TokenSource::ServiceAccount {
                    client_email: email.clone(),
                    key: Arc::new(key),
                    token_uri: file
                        .token_uri
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                    scope: scope.to_string(),
                    http: reqwest::Client::builder()
                        .timeout(Duration::from_secs(30))
                        .build()?,
                    cache: Arc::new(Mutex::new(None)),
                }
            }
            _ => bail!(
                "No access token: {} has no client_email/private_key; set {} or add access_token",
                path.display(),
                ACCESS_TOKEN_ENV
            ),
        };

        Ok(Self {
            path: path.to_path_buf(),
            project_id: file.project_id.filter(|p| !p.trim().is_empty()),
            client_email: file.client_email,
            source,
        })
    }

    /// `Authorization` header value, minting a token when needed.
    pub async fn bearer(&self) -> Result<String> {
        match &self.source {
            TokenSource::Fixed(token) => Ok(format!("Bearer {}", token)),
            TokenSource::ServiceAccount {
                client_email,
                key,
                token_uri,
                scope,
                http,
                cache,
            } => {
                let mut cached = cache.lock().await;
                if let Some(ref current) = *cached {
                    if current.expires_at > Instant::now() + RENEW_MARGIN {
                        return Ok(format!("Bearer {}", current.token));
                    }
                }

                let now = chrono::Utc::now().timestamp();
                let claims = Claims {
                    iss: client_email,
                    scope,
                    aud: token_uri,
                    iat: now,
                    exp: now + ASSERTION_LIFETIME_SECS,
                };
                let assertion = encode(&Header::new(Algorithm::RS256), &claims, key)
                    .context("Failed to sign token request")?;

                let response = http
                    .post(token_uri.as_str())
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await
                    .with_context(|| format!("Token request to {} failed", token_uri))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    bail!("Token endpoint error {}: {}", status, body);
                }
                let minted: TokenResponse = response.json().await.context("Invalid token response")?;

                let lifetime = Duration::from_secs(minted.expires_in.unwrap_or(3600));
                *cached = Some(CachedToken {
                    token: minted.access_token.clone(),
                    expires_at: Instant::now() + lifetime,
                });
                Ok(format!("Bearer {}", minted.access_token))
            }
        }
    }

    /// The project id, required for Vertex AI calls.
    pub fn require_project_id(&self) -> Result<&str> {
        self.project_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("project_id missing from service account file: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../tests/fixtures/service_account_key.pem");

    fn key_file(tmp: &TempDir, token_uri: &str) -> PathBuf {
        let path = tmp.path().join("key.json");
        let body = json!({
            "type": "service_account",
            "project_id": "demo-proj",
            "client_email": "runner@demo-proj.iam.gserviceaccount.com",
            "private_key": TEST_KEY,
            "token_uri": token_uri,
        });
        fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_project_and_inline_token() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sa.json");
        fs::write(
            &path,
            r#"{"type":"service_account","project_id":"demo-proj","client_email":"x@y","access_token":"tok"}"#,
        )
        .unwrap();

        let creds = Credentials::load(&path, DRIVE_SCOPE).unwrap();
        assert_eq!(creds.require_project_id().unwrap(), "demo-proj");
        assert_eq!(creds.bearer().await.unwrap(), "Bearer tok");
    }

    #[tokio::test]
    async fn key_file_mints_and_caches_token() {
        if std::env::var(ACCESS_TOKEN_ENV).is_ok() {
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("jwt-bearer"))
            .and(body_string_contains("assertion="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "minted-token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let path = key_file(&tmp, &format!("{}/token", server.uri()));
        let creds = Credentials::load(&path, CLOUD_PLATFORM_SCOPE).unwrap();

        assert_eq!(creds.bearer().await.unwrap(), "Bearer minted-token");
        // Second call is served from the cache.
        assert_eq!(creds.bearer().await.unwrap(), "Bearer minted-token");
    }

    #[tokio::test]
    async fn token_endpoint_rejection_is_error() {
        if std::env::var(ACCESS_TOKEN_ENV).is_ok() {
            return;
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let path = key_file(&tmp, &format!("{}/token", server.uri()));
        let creds = Credentials::load(&path, DRIVE_SCOPE).unwrap();

        let err = creds.bearer().await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn bad_private_key_is_error() {
        if std::env::var(ACCESS_TOKEN_ENV).is_ok() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sa.json");
        fs::write(
            &path,
            r#"{"client_email":"a@b","private_key":"not a pem"}"#,
        )
        .unwrap();
        let err = Credentials::load(&path, DRIVE_SCOPE).unwrap_err();
        assert!(err.to_string().contains("Invalid private_key"));
    }

    #[test]
    fn missing_project_id_is_reported_on_demand() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sa.json");
        fs::write(&path, r#"{"access_token":"tok"}"#).unwrap();

        let creds = Credentials::load(&path, DRIVE_SCOPE).unwrap();
        assert!(creds.require_project_id().is_err());
    }

    #[test]
    fn missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = Credentials::load(&tmp.path().join("none.json"), DRIVE_SCOPE).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn malformed_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sa.json");
        fs::write(&path, "not json").unwrap();
        assert!(Credentials::load(&path, DRIVE_SCOPE).is_err());
    }
}
