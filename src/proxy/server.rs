use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::proxy::handlers;
use crate::proxy::state::AppState;

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_router(state: AppState) -> Router {
    // Client-protocol surface. The API-key header is accepted but never
    // validated.
    let protocol_routes = Router::new()
        .route("/health", get(health_check))
        // OpenAI
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        // Anthropic
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude::handle_count_tokens),
        )
        // Gemini ({model}:generateContent arrives as one segment)
        .route(
            "/v1/models/:model_action",
            post(handlers::gemini::handle_generate),
        );

    let admin_routes = Router::new()
        .route("/status", get(handlers::admin::get_status))
        .route("/stats", get(handlers::admin::get_stats))
        .route("/stats/detailed", get(handlers::admin::get_stats_detailed))
        .route("/quota", get(handlers::admin::get_quota))
        .route("/logs", get(handlers::admin::get_logs))
        .route(
            "/accounts",
            get(handlers::admin::list_accounts).post(handlers::admin::add_account),
        )
        .route(
            "/accounts/refresh-all",
            post(handlers::admin::refresh_all_accounts),
        )
        .route("/accounts/:accountId", delete(handlers::admin::delete_account))
        .route(
            "/accounts/:accountId/toggle",
            post(handlers::admin::toggle_account),
        )
        .route(
            "/accounts/:accountId/refresh",
            post(handlers::admin::refresh_account),
        )
        .route(
            "/accounts/:accountId/restore",
            post(handlers::admin::restore_account),
        )
        .route(
            "/accounts/:accountId/usage",
            get(handlers::admin::account_usage),
        )
        .route("/token/scan", post(handlers::admin::token_scan))
        .route(
            "/token/add-from-scan",
            post(handlers::admin::token_add_from_scan),
        )
        .route(
            "/token/refresh-check",
            get(handlers::admin::token_refresh_check),
        )
        .route("/kiro/login/start", post(handlers::admin::login_start))
        .route("/kiro/login/poll", post(handlers::admin::login_poll))
        .route("/kiro/login/cancel", post(handlers::admin::login_cancel))
        .route("/kiro/social/start", post(handlers::admin::social_start))
        .route(
            "/kiro/social/exchange",
            post(handlers::admin::social_exchange),
        )
        .route("/flows", get(handlers::admin::list_flows))
        .route("/flows/clear", post(handlers::admin::clear_flows))
        .route("/flows/:flowId", get(handlers::admin::get_flow))
        .route(
            "/flows/:flowId/bookmark",
            post(handlers::admin::bookmark_flow),
        )
        .route("/config/export", get(handlers::admin::config_export))
        .route("/config/import", post(handlers::admin::config_import));

    Router::new()
        .merge(protocol_routes)
        .nest("/api", admin_routes)
        .layer(cors_layer())
        .layer(axum::extract::DefaultBodyLimit::max(100 * 1024 * 1024))
        .with_state(state)
}

/// Spawn the long-lived background loops. All stop on the shared
/// cancellation token at shutdown.
pub fn spawn_background_tasks(state: &AppState) {
    let refresher = state.core.refresher.clone();
    let cancel = state.runtime.cancel.clone();
    tokio::spawn(refresher.run(cancel));

    let selector = state.core.selector.clone();
    let cancel = state.runtime.cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            crate::constants::SESSION_PRUNE_INTERVAL_SECS,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => { selector.prune_sessions(); }
            }
        }
    });

    let monitor = state.core.monitor.clone();
    let cancel = state.runtime.cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            crate::constants::FLOW_EVICT_INTERVAL_SECS,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    monitor.evict_older_than(crate::constants::FLOW_MAX_AGE_SECS);
                }
            }
        }
    });
}

/// Bind and serve until ctrl-c. Bind failure propagates so the process can
/// exit non-zero.
pub async fn serve(state: AppState, host: &str, port: u16) -> AppResult<()> {
    let app = build_router(state.clone());
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Config(format!("failed to bind {}: {}", addr, e)))?;

    info!("Gateway listening on http://{}", addr);
    spawn_background_tasks(&state);

    // An initial sweep brings near-expiry accounts back before traffic hits.
    let refresher = state.core.refresher.clone();
    tokio::spawn(async move {
        let (ok, failed) = refresher.sweep(false).await;
        if ok + failed > 0 {
            info!("Startup refresh sweep: {} ok, {} failed", ok, failed);
        }
    });

    let cancel = state.runtime.cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            cancel.cancel();
        })
        .await;

    if let Err(e) = result {
        error!("Server error: {}", e);
        return Err(AppError::Unknown(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::{Account, AuthKind, CredentialEnvelope, Provenance};
    use crate::proxy::upstream::UpstreamClient;
    use axum::routing::post;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn start_mock_kiro(body: &'static str) -> String {
        let app = Router::new().route(
            "/generateAssistantResponse",
            post(move || async move { body }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        format!("http://{}", addr)
    }

    async fn start_gateway(state: AppState) -> String {
        let app = build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gw");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve gw");
        });
        format!("http://{}", addr)
    }

    fn seed_account(state: &AppState) {
        state.core.store.add(Account::new(
            "test".into(),
            Provenance::SocialGoogle,
            CredentialEnvelope {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_at: i64::MAX,
                auth_kind: AuthKind::Social,
            },
            "us-east-1".into(),
        ));
    }

    #[tokio::test]
    async fn openai_surface_end_to_end_non_stream() {
        let kiro = start_mock_kiro(
            "{\"content\":\"pong\"}\n{\"usage\":{\"inputTokenCount\":3,\"outputTokenCount\":1}}\n",
        )
        .await;
        let state = AppState::build_for_test(UpstreamClient::new_for_test(&kiro));
        seed_account(&state);
        let gateway = start_gateway(state).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", gateway))
            .header("authorization", "Bearer anything-goes")
            .json(&json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "ping"}]
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("x-mapped-model").unwrap(),
            "claude-sonnet-4"
        );

        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["choices"][0]["message"]["content"], "pong");
        assert_eq!(body["usage"]["prompt_tokens"], 3);
    }

    #[tokio::test]
    async fn anthropic_surface_end_to_end_stream() {
        let kiro = start_mock_kiro("{\"content\":\"hi there\"}\n").await;
        let state = AppState::build_for_test(UpstreamClient::new_for_test(&kiro));
        seed_account(&state);
        let gateway = start_gateway(state).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/messages", gateway))
            .json(&json!({
                "model": "sonnet",
                "stream": true,
                "max_tokens": 100,
                "messages": [{"role": "user", "content": "say hi to the nice people"}]
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        assert!(resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = resp.text().await.expect("body");
        assert!(body.contains("event: message_start"));
        assert!(body.contains("\"text\":\"hi there\""));
        assert!(body.contains("event: message_stop"));
    }

    #[tokio::test]
    async fn gemini_surface_end_to_end_non_stream() {
        let kiro = start_mock_kiro("{\"content\":\"bonjour\"}\n").await;
        let state = AppState::build_for_test(UpstreamClient::new_for_test(&kiro));
        seed_account(&state);
        let gateway = start_gateway(state).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                "{}/v1/models/gemini-1.5-pro:generateContent",
                gateway
            ))
            .json(&json!({
                "contents": [{"role": "user", "parts": [{"text": "salut salut salut"}]}]
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("x-mapped-model").unwrap(),
            "claude-sonnet-4.5"
        );

        let body: Value = resp.json().await.expect("json");
        assert_eq!(
            body["candidates"][0]["content"]["parts"][0]["text"],
            "bonjour"
        );
    }

    #[tokio::test]
    async fn models_listing_and_admin_status() {
        let state = AppState::build_for_test(UpstreamClient::new_for_test("http://127.0.0.1:1"));
        seed_account(&state);
        let gateway = start_gateway(state).await;

        let client = reqwest::Client::new();
        let models: Value = client
            .get(format!("{}/v1/models", gateway))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(models["object"], "list");
        assert!(models["data"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m["id"] == "gpt-4o"));

        let status: Value = client
            .get(format!("{}/api/status", gateway))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["accounts_total"], 1);
        assert_eq!(status["accounts_by_health"]["active"], 1);
    }

    #[tokio::test]
    async fn error_surfaces_in_native_protocol_shape() {
        // No accounts seeded: every surface reports in its own error schema.
        let state = AppState::build_for_test(UpstreamClient::new_for_test("http://127.0.0.1:1"));
        let gateway = start_gateway(state).await;
        let client = reqwest::Client::new();

        let openai = client
            .post(format!("{}/v1/chat/completions", gateway))
            .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "x"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(openai.status(), 503);
        let body: Value = openai.json().await.unwrap();
        assert_eq!(body["error"]["code"], "no_account_available");

        let anthropic = client
            .post(format!("{}/v1/messages", gateway))
            .json(&json!({"model": "sonnet", "messages": [{"role": "user", "content": "x"}]}))
            .send()
            .await
            .unwrap();
        let body: Value = anthropic.json().await.unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "overloaded_error");

        let gemini = client
            .post(format!("{}/v1/models/auto:generateContent", gateway))
            .json(&json!({"contents": [{"parts": [{"text": "x"}]}]}))
            .send()
            .await
            .unwrap();
        let body: Value = gemini.json().await.unwrap();
        assert_eq!(body["error"]["status"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn count_tokens_endpoint_estimates() {
        let state = AppState::build_for_test(UpstreamClient::new_for_test("http://127.0.0.1:1"));
        let gateway = start_gateway(state).await;
        let client = reqwest::Client::new();

        let body: Value = client
            .post(format!("{}/v1/messages/count_tokens", gateway))
            .json(&json!({
                "model": "sonnet",
                "messages": [{"role": "user", "content": "x".repeat(400)}]
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["input_tokens"].as_u64().unwrap() >= 100);
    }
}
