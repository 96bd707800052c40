use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

pub const KIRO_START_URL: &str = "https://view.awsapps.com/start";
pub const KIRO_SCOPES: [&str; 5] = [
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
    "codewhisperer:transformations",
    "codewhisperer:taskassist",
];

fn oidc_base(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com", region)
}

fn desktop_auth_base(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev", region)
}

/// Token material returned by either refresh endpoint. The two surfaces use
/// different casing conventions, hence the aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    #[serde(rename = "accessToken", alias = "access_token")]
    pub access_token: String,
    #[serde(rename = "refreshToken", alias = "refresh_token", default)]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn", alias = "expires_in", default)]
    pub expires_in: Option<i64>,
    #[serde(rename = "profileArn", alias = "profile_arn", default)]
    pub profile_arn: Option<String>,
}

/// Refresh a device-code (IAM Identity Center) credential via the regional
/// OIDC token endpoint.
pub async fn refresh_device_code_token(
    http: &reqwest::Client,
    region: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> AppResult<RefreshedTokens> {
    let resp = http
        .post(format!("{}/token", oidc_base(region)))
        .json(&json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "grantType": "refresh_token",
            "refreshToken": refresh_token,
        }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!(
            "device-code refresh failed ({}): {}",
            status, body
        )));
    }
    let tokens: RefreshedTokens = resp
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("device-code refresh decode failed: {}", e)))?;
    if tokens.access_token.is_empty() {
        return Err(AppError::Auth(
            "device-code refresh returned empty access token".to_string(),
        ));
    }
    Ok(tokens)
}

/// Refresh a social-login credential via the Kiro desktop auth service.
pub async fn refresh_social_token(
    http: &reqwest::Client,
    region: &str,
    refresh_token: &str,
) -> AppResult<RefreshedTokens> {
    let resp = http
        .post(format!("{}/refreshToken", desktop_auth_base(region)))
        .json(&json!({ "refreshToken": refresh_token }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!(
            "social refresh failed ({}): {}",
            status, body
        )));
    }
    let tokens: RefreshedTokens = resp
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("social refresh decode failed: {}", e)))?;
    if tokens.access_token.is_empty() {
        return Err(AppError::Auth(
            "social refresh returned empty access token".to_string(),
        ));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Device code login flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeviceFlowState {
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: u64,
    pub expires_at: i64,
    pub region: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceFlowStarted {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: i64,
    pub interval: u64,
}

#[derive(Debug, Clone)]
pub enum DevicePollOutcome {
    Pending,
    SlowDown,
    Completed(RefreshedTokens),
}

/// Register an ephemeral OIDC client, then request a device authorization.
pub async fn start_device_flow(
    http: &reqwest::Client,
    region: &str,
) -> AppResult<(DeviceFlowState, DeviceFlowStarted)> {
    let base = oidc_base(region);

    let reg = http
        .post(format!("{}/client/register", base))
        .json(&json!({
            "clientName": "Kiro Relay",
            "clientType": "public",
            "scopes": KIRO_SCOPES,
            "grantTypes": ["urn:ietf:params:oauth:grant-type:device_code", "refresh_token"],
            "issuerUrl": KIRO_START_URL,
        }))
        .send()
        .await?;
    if !reg.status().is_success() {
        let body = reg.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!("client registration failed: {}", body)));
    }
    let reg: serde_json::Value = reg.json().await?;
    let client_id = reg["clientId"].as_str().unwrap_or_default().to_string();
    let client_secret = reg["clientSecret"].as_str().unwrap_or_default().to_string();
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(AppError::Auth(
            "registration response missing client credentials".to_string(),
        ));
    }

    let auth = http
        .post(format!("{}/device_authorization", base))
        .json(&json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "startUrl": KIRO_START_URL,
        }))
        .send()
        .await?;
    if !auth.status().is_success() {
        let body = auth.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!("device authorization failed: {}", body)));
    }
    let auth: serde_json::Value = auth.json().await?;

    let device_code = auth["deviceCode"].as_str().unwrap_or_default().to_string();
    let user_code = auth["userCode"].as_str().unwrap_or_default().to_string();
    let verification_uri = auth["verificationUriComplete"]
        .as_str()
        .or_else(|| auth["verificationUri"].as_str())
        .unwrap_or_default()
        .to_string();
    if device_code.is_empty() || user_code.is_empty() || verification_uri.is_empty() {
        return Err(AppError::Auth(
            "device authorization response missing required fields".to_string(),
        ));
    }
    let interval = auth["interval"].as_u64().unwrap_or(5);
    let expires_in = auth["expiresIn"].as_i64().unwrap_or(600);

    let state = DeviceFlowState {
        client_id,
        client_secret,
        device_code,
        user_code: user_code.clone(),
        verification_uri: verification_uri.clone(),
        interval,
        expires_at: chrono::Utc::now().timestamp() + expires_in,
        region: region.to_string(),
    };
    let started = DeviceFlowStarted {
        user_code,
        verification_uri,
        expires_in,
        interval,
    };
    Ok((state, started))
}

pub async fn poll_device_flow(
    http: &reqwest::Client,
    state: &DeviceFlowState,
) -> AppResult<DevicePollOutcome> {
    let resp = http
        .post(format!("{}/token", oidc_base(&state.region)))
        .json(&json!({
            "clientId": state.client_id,
            "clientSecret": state.client_secret,
            "grantType": "urn:ietf:params:oauth:grant-type:device_code",
            "deviceCode": state.device_code,
        }))
        .send()
        .await?;

    if resp.status().is_success() {
        let tokens: RefreshedTokens = resp
            .json()
            .await
            .map_err(|e| AppError::Auth(format!("token decode failed: {}", e)))?;
        return Ok(DevicePollOutcome::Completed(tokens));
    }

    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    match body["error"].as_str().unwrap_or_default() {
        "authorization_pending" => Ok(DevicePollOutcome::Pending),
        "slow_down" => Ok(DevicePollOutcome::SlowDown),
        "expired_token" => Err(AppError::Auth("authorization expired".to_string())),
        "access_denied" => Err(AppError::Auth("authorization denied by user".to_string())),
        other => Err(AppError::Auth(format!("token request failed: {}", other))),
    }
}

// ---------------------------------------------------------------------------
// Social login flow (Google / GitHub) with PKCE
// ---------------------------------------------------------------------------

pub const SOCIAL_REDIRECT_URI: &str = "http://127.0.0.1:19823/kiro-social-callback";

#[derive(Debug, Clone)]
pub struct SocialAuthState {
    pub provider: String,
    pub code_verifier: String,
    pub oauth_state: String,
    pub expires_at: i64,
    pub region: String,
}

fn random_urlsafe(bytes: usize) -> String {
    let raw: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

pub fn start_social_auth(provider: &str, region: &str) -> AppResult<(SocialAuthState, String)> {
    let provider = match provider.to_ascii_lowercase().as_str() {
        "google" => "Google",
        "github" => "Github",
        other => {
            return Err(AppError::Auth(format!("unsupported login provider: {}", other)));
        }
    };

    let code_verifier = random_urlsafe(64);
    let challenge = code_challenge(&code_verifier);
    let oauth_state = random_urlsafe(32);

    let login_url = format!(
        "{}/login?idp={}&redirect_uri={}&code_challenge={}&code_challenge_method=S256&state={}",
        desktop_auth_base(region),
        provider,
        urlencode(SOCIAL_REDIRECT_URI),
        challenge,
        oauth_state,
    );

    let state = SocialAuthState {
        provider: provider.to_string(),
        code_verifier,
        oauth_state,
        expires_at: chrono::Utc::now().timestamp() + 600,
        region: region.to_string(),
    };
    Ok((state, login_url))
}

pub async fn exchange_social_code(
    http: &reqwest::Client,
    state: &SocialAuthState,
    code: &str,
    oauth_state: &str,
) -> AppResult<RefreshedTokens> {
    if oauth_state != state.oauth_state {
        return Err(AppError::Auth("oauth state mismatch".to_string()));
    }
    if chrono::Utc::now().timestamp() > state.expires_at {
        return Err(AppError::Auth("login expired, restart the flow".to_string()));
    }

    let resp = http
        .post(format!("{}/oauth/token", desktop_auth_base(&state.region)))
        .json(&json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": SOCIAL_REDIRECT_URI,
            "code_verifier": state.code_verifier,
        }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!("token exchange failed ({}): {}", status, body)));
    }
    resp.json()
        .await
        .map_err(|e| AppError::Auth(format!("token exchange decode failed: {}", e)))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn social_start_builds_pkce_login_url() {
        let (state, url) = start_social_auth("google", "us-east-1").expect("start");
        assert_eq!(state.provider, "Google");
        assert!(url.contains("idp=Google"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&state.oauth_state));
        // The verifier itself must never appear in the URL.
        assert!(!url.contains(&state.code_verifier));
    }

    #[test]
    fn social_start_rejects_unknown_provider() {
        assert!(start_social_auth("facebook", "us-east-1").is_err());
    }

    #[test]
    fn refresh_response_accepts_both_casings() {
        let camel: RefreshedTokens =
            serde_json::from_str(r#"{"accessToken":"a","refreshToken":"r","expiresIn":3600}"#)
                .expect("camel");
        assert_eq!(camel.access_token, "a");
        assert_eq!(camel.expires_in, Some(3600));

        let snake: RefreshedTokens =
            serde_json::from_str(r#"{"access_token":"a","refresh_token":"r","expires_in":60}"#)
                .expect("snake");
        assert_eq!(snake.refresh_token.as_deref(), Some("r"));
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(
            urlencode("http://127.0.0.1:19823/cb"),
            "http%3A%2F%2F127.0.0.1%3A19823%2Fcb"
        );
    }
}
