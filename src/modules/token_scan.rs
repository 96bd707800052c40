use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A credential file discovered in a local cache directory. These are
/// read-only inputs; importing one copies the tokens into the store.
#[derive(Debug, Clone, Serialize)]
pub struct ScannedToken {
    pub path: String,
    pub auth_method: Option<String>,
    pub expires_at: Option<String>,
    pub has_refresh_token: bool,
    pub region: Option<String>,
}

/// Shape of `~/.aws/sso/cache/*.json` entries that carry Kiro credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredentialFile {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: Option<String>,
    pub auth_method: Option<String>,
    pub profile_arn: Option<String>,
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn read_credential_file(path: &Path) -> Option<CachedCredentialFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Scan the configured cache directories for importable credential files.
/// Files without an access token are skipped silently; the SSO cache holds
/// client-registration records in the same directory.
pub fn scan(paths: &[String]) -> Vec<ScannedToken> {
    let mut found = Vec::new();

    for configured in paths {
        let dir = expand_home(configured);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            tracing::debug!("Scan path not readable, skipping: {}", dir.display());
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(parsed) = read_credential_file(&path) else {
                continue;
            };
            if parsed.access_token.as_deref().unwrap_or("").is_empty() {
                continue;
            }
            found.push(ScannedToken {
                path: path.display().to_string(),
                auth_method: parsed.auth_method.clone(),
                expires_at: parsed.expires_at.clone(),
                has_refresh_token: parsed.refresh_token.is_some(),
                region: parsed.region.clone(),
            });
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Parse an ISO 8601 expiry into unix seconds; a malformed or absent stamp
/// reads as already expired so the refresher picks the account up first.
pub fn parse_expiry(expires_at: Option<&str>) -> i64 {
    expires_at
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}
