//! Management surface under `/api`. JSON in, JSON out; account mutations
//! reload nothing because the store is the live source of truth.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::account::{
    Account, AuthKind, CredentialEnvelope, HealthState, PersistedAccount, Provenance,
};
use crate::modules::{auth, token_scan};
use crate::proxy::state::AppState;

#[derive(serde::Serialize)]
pub struct ErrorResponse {
    error: String,
}

fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn not_found() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "not found".to_string(),
        }),
    )
}

/// Accounts are reported without raw token material.
fn account_view(account: &Account, quota: Option<&crate::models::account::QuotaSnapshot>) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "id": account.id,
        "label": account.label,
        "provenance": account.provenance,
        "auth_kind": account.credentials.auth_kind,
        "enabled": account.enabled,
        "health": account.effective_health(now),
        "cooldown_until": account.cooldown_until,
        "unhealthy_reason": account.unhealthy_reason,
        "region": account.region,
        "expires_at": account.credentials.expires_at,
        "has_refresh_token": account.credentials.refresh_token.is_some(),
        "last_used_at": account.last_used_at,
        "request_count": account.request_count,
        "error_count": account.error_count,
        "in_flight": account.in_flight,
        "quota": quota,
    })
}

// ---------------------------------------------------------------------------
// Status / stats / logs
// ---------------------------------------------------------------------------

pub async fn get_status(State(state): State<AppState>) -> Response {
    let now = chrono::Utc::now().timestamp();
    let accounts = state.core.store.list();
    let mut by_health = std::collections::HashMap::from([
        ("active", 0u32),
        ("cooldown", 0u32),
        ("unhealthy", 0u32),
        ("disabled", 0u32),
    ]);
    for account in &accounts {
        let key = match account.effective_health(now) {
            HealthState::Active => "active",
            HealthState::Cooldown => "cooldown",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Disabled => "disabled",
        };
        *by_health.get_mut(key).unwrap() += 1;
    }

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": now - state.runtime.started_at,
        "port": state.config.port,
        "accounts_total": accounts.len(),
        "accounts_by_health": by_health,
        "sessions": state.core.selector.session_count(),
        "inflight": state.runtime.inflight.load(std::sync::atomic::Ordering::Relaxed),
        "last_persist_error": state.core.store.last_persist_error(),
    }))
    .into_response()
}

pub async fn get_stats(State(state): State<AppState>) -> Response {
    Json(state.core.monitor.stats()).into_response()
}

pub async fn get_stats_detailed(State(state): State<AppState>) -> Response {
    let accounts: Vec<Value> = state
        .core
        .store
        .list()
        .iter()
        .map(|a| account_view(a, state.core.store.quota(&a.id).as_ref()))
        .collect();
    Json(json!({
        "stats": state.core.monitor.stats(),
        "accounts": accounts,
    }))
    .into_response()
}

pub async fn get_quota(State(state): State<AppState>) -> Response {
    let quotas: Vec<Value> = state
        .core
        .store
        .list()
        .iter()
        .filter_map(|a| {
            state.core.store.quota(&a.id).map(|q| {
                json!({
                    "account_id": a.id,
                    "label": a.label,
                    "remaining": q.remaining,
                    "reset_at": q.reset_at,
                    "observed_at": q.observed_at,
                })
            })
        })
        .collect();
    Json(json!({ "quotas": quotas })).into_response()
}

#[derive(Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    Json(state.core.monitor.list(query.limit)).into_response()
}

// ---------------------------------------------------------------------------
// Accounts CRUD
// ---------------------------------------------------------------------------

pub async fn list_accounts(State(state): State<AppState>) -> Response {
    let accounts: Vec<Value> = state
        .core
        .store
        .list()
        .iter()
        .map(|a| account_view(a, state.core.store.quota(&a.id).as_ref()))
        .collect();
    Json(json!({ "accounts": accounts })).into_response()
}

#[derive(Deserialize)]
pub struct AddAccountRequest {
    #[serde(default)]
    pub label: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

pub async fn add_account(
    State(state): State<AppState>,
    Json(payload): Json<AddAccountRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if payload.access_token.is_empty() {
        return Err(bad_request("access_token must not be empty"));
    }
    if payload.auth_kind == AuthKind::Social && payload.refresh_token.is_none() {
        return Err(bad_request("social accounts require a refresh_token"));
    }

    let provenance = payload.provenance.unwrap_or(match payload.auth_kind {
        AuthKind::Idc => Provenance::AwsDeviceCode,
        AuthKind::Social => Provenance::SocialGoogle,
    });
    let label = payload
        .label
        .unwrap_or_else(|| format!("account-{}", &uuid::Uuid::new_v4().to_string()[..8]));

    let mut account = Account::new(
        label,
        provenance,
        CredentialEnvelope {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at: payload.expires_at.unwrap_or(0),
            auth_kind: payload.auth_kind,
        },
        payload
            .region
            .unwrap_or_else(|| crate::constants::DEFAULT_REGION.to_string()),
    );
    account.profile_arn = payload.profile_arn;
    account.client_id = payload.client_id;
    account.client_secret = payload.client_secret;

    let id = state.core.store.add(account);
    let stored = state.core.store.get(&id).ok_or_else(|| internal_error("account vanished"))?;
    Ok(Json(account_view(&stored, None)).into_response())
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if state.core.store.remove(&account_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found())
    }
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub async fn toggle_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(payload): Json<ToggleRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if state.core.store.set_enabled(&account_id, payload.enabled) {
        Ok(StatusCode::OK)
    } else {
        Err(not_found())
    }
}

pub async fn refresh_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    state
        .core
        .refresher
        .refresh_account(&account_id, true)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let account = state.core.store.get(&account_id).ok_or_else(not_found)?;
    Ok(Json(account_view(&account, None)).into_response())
}

/// Clear cooldown/unhealthy state after an operator fixed the cause.
pub async fn restore_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if state.core.store.get(&account_id).is_none() {
        return Err(not_found());
    }
    state.core.store.mark_active(&account_id);
    Ok(StatusCode::OK)
}

pub async fn account_usage(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let account = state.core.store.get(&account_id).ok_or_else(not_found)?;
    Ok(Json(json!({
        "id": account.id,
        "label": account.label,
        "request_count": account.request_count,
        "error_count": account.error_count,
        "last_used_at": account.last_used_at,
        "in_flight": account.in_flight,
        "quota": state.core.store.quota(&account_id),
    }))
    .into_response())
}

pub async fn refresh_all_accounts(State(state): State<AppState>) -> Response {
    let (ok, failed) = state.core.refresher.sweep(true).await;
    Json(json!({ "refreshed": ok, "failed": failed })).into_response()
}

// ---------------------------------------------------------------------------
// Token scanning
// ---------------------------------------------------------------------------

pub async fn token_scan(State(state): State<AppState>) -> Response {
    let paths = state.config.scan_paths.read().await.clone();
    let found = tokio::task::spawn_blocking(move || token_scan::scan(&paths)).await;
    match found {
        Ok(tokens) => Json(json!({ "tokens": tokens })).into_response(),
        Err(e) => internal_error(e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
pub struct AddFromScanRequest {
    pub path: String,
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn token_add_from_scan(
    State(state): State<AppState>,
    Json(payload): Json<AddFromScanRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let parsed = token_scan::read_credential_file(std::path::Path::new(&payload.path))
        .ok_or_else(|| bad_request(format!("cannot read credential file {}", payload.path)))?;
    let access_token = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| bad_request("credential file has no access token"))?;

    let auth_kind = match parsed.auth_method.as_deref() {
        Some("social") => AuthKind::Social,
        _ => AuthKind::Idc,
    };
    let mut account = Account::new(
        payload.label.unwrap_or_else(|| {
            std::path::Path::new(&payload.path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("scanned")
                .to_string()
        }),
        Provenance::ScannedLocalCache,
        CredentialEnvelope {
            access_token,
            refresh_token: parsed.refresh_token,
            expires_at: token_scan::parse_expiry(parsed.expires_at.as_deref()),
            auth_kind,
        },
        parsed
            .region
            .unwrap_or_else(|| crate::constants::DEFAULT_REGION.to_string()),
    );
    account.profile_arn = parsed.profile_arn;
    account.client_id = parsed.client_id;
    account.client_secret = parsed.client_secret;

    let id = state.core.store.add(account);
    let stored = state.core.store.get(&id).ok_or_else(|| internal_error("account vanished"))?;
    Ok(Json(account_view(&stored, None)).into_response())
}

pub async fn token_refresh_check(State(state): State<AppState>) -> Response {
    let now = chrono::Utc::now().timestamp();
    let report: Vec<Value> = state
        .core
        .store
        .list()
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "label": a.label,
                "expires_at": a.credentials.expires_at,
                "expires_in_secs": a.credentials.expires_at - now,
                "due": crate::proxy::accounts::refresher::is_due(a, now),
                "enabled": a.enabled,
            })
        })
        .collect();
    Json(json!({ "accounts": report })).into_response()
}

// ---------------------------------------------------------------------------
// Login flows
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct LoginStartRequest {
    #[serde(default)]
    pub region: Option<String>,
}

pub async fn login_start(
    State(state): State<AppState>,
    payload: Option<Json<LoginStartRequest>>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let region = payload
        .and_then(|Json(p)| p.region)
        .unwrap_or_else(|| crate::constants::DEFAULT_REGION.to_string());

    let (flow_state, started) = auth::start_device_flow(&state.runtime.login_http, &region)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    *state.runtime.device_flow.lock().await = Some(flow_state);
    Ok(Json(json!(started)).into_response())
}

pub async fn login_poll(
    State(state): State<AppState>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let flow_state = {
        let guard = state.runtime.device_flow.lock().await;
        guard.clone()
    };
    let Some(flow_state) = flow_state else {
        return Err(bad_request("no login in progress"));
    };
    if chrono::Utc::now().timestamp() > flow_state.expires_at {
        *state.runtime.device_flow.lock().await = None;
        return Err(bad_request("authorization expired, restart login"));
    }

    match auth::poll_device_flow(&state.runtime.login_http, &flow_state).await {
        Ok(auth::DevicePollOutcome::Pending) => {
            Ok(Json(json!({ "completed": false, "status": "pending" })).into_response())
        }
        Ok(auth::DevicePollOutcome::SlowDown) => {
            Ok(Json(json!({ "completed": false, "status": "slow_down" })).into_response())
        }
        Ok(auth::DevicePollOutcome::Completed(tokens)) => {
            *state.runtime.device_flow.lock().await = None;

            let mut account = Account::new(
                format!("kiro-{}", &flow_state.user_code.to_lowercase()),
                Provenance::AwsDeviceCode,
                CredentialEnvelope {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    expires_at: chrono::Utc::now().timestamp() + tokens.expires_in.unwrap_or(3600),
                    auth_kind: AuthKind::Idc,
                },
                flow_state.region.clone(),
            );
            account.client_id = Some(flow_state.client_id.clone());
            account.client_secret = Some(flow_state.client_secret.clone());
            account.profile_arn = tokens.profile_arn;

            let id = state.core.store.add(account);
            Ok(Json(json!({ "completed": true, "account_id": id })).into_response())
        }
        Err(e) => {
            *state.runtime.device_flow.lock().await = None;
            Err(bad_request(e.to_string()))
        }
    }
}

pub async fn login_cancel(State(state): State<AppState>) -> Response {
    let had_flow = state.runtime.device_flow.lock().await.take().is_some();
    Json(json!({ "cancelled": had_flow })).into_response()
}

#[derive(Deserialize)]
pub struct SocialStartRequest {
    pub provider: String,
    #[serde(default)]
    pub region: Option<String>,
}

pub async fn social_start(
    State(state): State<AppState>,
    Json(payload): Json<SocialStartRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let region = payload
        .region
        .unwrap_or_else(|| crate::constants::DEFAULT_REGION.to_string());
    let (flow_state, login_url) =
        auth::start_social_auth(&payload.provider, &region).map_err(|e| bad_request(e.to_string()))?;
    let provider = flow_state.provider.clone();
    let oauth_state = flow_state.oauth_state.clone();
    *state.runtime.social_flow.lock().await = Some(flow_state);
    Ok(Json(json!({
        "login_url": login_url,
        "state": oauth_state,
        "provider": provider,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct SocialExchangeRequest {
    pub code: String,
    pub state: String,
}

pub async fn social_exchange(
    State(state): State<AppState>,
    Json(payload): Json<SocialExchangeRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let flow_state = {
        let guard = state.runtime.social_flow.lock().await;
        guard.clone()
    };
    let Some(flow_state) = flow_state else {
        return Err(bad_request("no social login in progress"));
    };

    let tokens = auth::exchange_social_code(
        &state.runtime.login_http,
        &flow_state,
        &payload.code,
        &payload.state,
    )
    .await
    .map_err(|e| bad_request(e.to_string()))?;
    *state.runtime.social_flow.lock().await = None;

    let provenance = if flow_state.provider == "Github" {
        Provenance::SocialGithub
    } else {
        Provenance::SocialGoogle
    };
    let account = Account::new(
        format!("{}-{}", flow_state.provider.to_lowercase(), &uuid::Uuid::new_v4().to_string()[..8]),
        provenance,
        CredentialEnvelope {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: chrono::Utc::now().timestamp() + tokens.expires_in.unwrap_or(3600),
            auth_kind: AuthKind::Social,
        },
        flow_state.region.clone(),
    );

    let id = state.core.store.add(account);
    Ok(Json(json!({ "completed": true, "account_id": id })).into_response())
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

pub async fn list_flows(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    Json(json!({ "flows": state.core.monitor.list(query.limit) })).into_response()
}

pub async fn get_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let flow = state.core.monitor.get(&flow_id).ok_or_else(not_found)?;
    Ok(Json(flow).into_response())
}

#[derive(Deserialize)]
pub struct BookmarkRequest {
    #[serde(default = "default_true")]
    pub bookmarked: bool,
}

fn default_true() -> bool {
    true
}

pub async fn bookmark_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    payload: Option<Json<BookmarkRequest>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let bookmarked = payload.map(|Json(p)| p.bookmarked).unwrap_or(true);
    if state.core.monitor.set_bookmarked(&flow_id, bookmarked) {
        Ok(StatusCode::OK)
    } else {
        Err(not_found())
    }
}

pub async fn clear_flows(State(state): State<AppState>) -> StatusCode {
    state.core.monitor.clear();
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Config export / import
// ---------------------------------------------------------------------------

pub async fn config_export(State(state): State<AppState>) -> Response {
    let governor = *state.config.governor.read().await;
    let scan_paths = state.config.scan_paths.read().await.clone();
    Json(json!({
        "schema_version": crate::constants::CONFIG_SCHEMA_VERSION,
        "accounts": state.core.store.export_snapshot(),
        "governor": governor,
        "scan_paths": scan_paths,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct ConfigImportRequest {
    #[serde(default)]
    pub accounts: Vec<PersistedAccount>,
    #[serde(default)]
    pub governor: Option<crate::models::config::GovernorConfig>,
    #[serde(default)]
    pub scan_paths: Option<Vec<String>>,
}

pub async fn config_import(
    State(state): State<AppState>,
    Json(payload): Json<ConfigImportRequest>,
) -> Response {
    let imported = state.core.store.import_snapshot(payload.accounts);
    if let Some(governor) = payload.governor {
        *state.config.governor.write().await = governor;
    }
    if let Some(paths) = payload.scan_paths {
        *state.config.scan_paths.write().await = paths;
    }
    Json(json!({ "imported_accounts": imported })).into_response()
}
