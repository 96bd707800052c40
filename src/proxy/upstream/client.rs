use reqwest::Client;
use serde_json::Value;
use tokio::time::Duration;

use crate::models::account::QuotaSnapshot;

const QUOTA_REMAINING_HEADER: &str = "x-amzn-kiro-remaining-quota";
const QUOTA_RESET_HEADER: &str = "x-amzn-kiro-quota-reset";

pub struct UpstreamClient {
    client: Client,
    // Test hook: when set, all calls go to this base instead of the regional
    // Kiro host.
    base_override: Option<String>,
}

impl UpstreamClient {
    pub fn new(upstream_proxy: Option<&str>) -> Self {
        Self::with_base(upstream_proxy, None)
    }

    fn with_base(upstream_proxy: Option<&str>, base_override: Option<String>) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(crate::constants::USER_AGENT.as_str());

        if let Some(url) = upstream_proxy {
            if !url.is_empty() {
                if let Ok(proxy) = reqwest::Proxy::all(url) {
                    builder = builder.proxy(proxy);
                    tracing::info!("Upstream client using proxy: {}", url);
                }
            }
        }

        Self {
            client: builder.build().expect("Failed to create upstream HTTP client"),
            base_override,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(base_url: &str) -> Self {
        Self::with_base(None, Some(base_url.to_string()))
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    fn api_base(&self, region: &str) -> String {
        match &self.base_override {
            Some(base) => base.clone(),
            None => format!("https://q.{}.amazonaws.com", region),
        }
    }

    fn build_url(&self, region: &str, profile_arn: Option<&str>) -> String {
        let base = self.api_base(region);
        match profile_arn {
            Some(arn) => format!(
                "{}/generateAssistantResponse?origin={}&profileArn={}",
                base,
                crate::proxy::mappers::kiro::API_ORIGIN,
                arn
            ),
            None => format!(
                "{}/generateAssistantResponse?origin={}",
                base,
                crate::proxy::mappers::kiro::API_ORIGIN
            ),
        }
    }

    /// Issue the upstream call. The response always arrives as an event
    /// stream; the caller decides whether to relay or accumulate it.
    /// Transport failures come back as `Err`; HTTP errors as `Ok` with a
    /// non-success status for the orchestrator to classify.
    pub async fn generate_assistant_response(
        &self,
        region: &str,
        profile_arn: Option<&str>,
        access_token: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, String> {
        let url = self.build_url(region, profile_arn);
        self.client
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("HTTP request failed: {}", e))
    }

    /// Harvest quota figures from response headers. Most responses carry
    /// none; that is not an error.
    pub fn parse_quota_headers(headers: &reqwest::header::HeaderMap) -> Option<QuotaSnapshot> {
        let remaining = headers
            .get(QUOTA_REMAINING_HEADER)?
            .to_str()
            .ok()?
            .parse::<i64>()
            .ok()?;
        let reset_at = headers
            .get(QUOTA_RESET_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Some(QuotaSnapshot {
            remaining,
            reset_at,
            observed_at: chrono::Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone, Default)]
    struct CaptureState {
        headers: Arc<AsyncMutex<Vec<(String, String)>>>,
        body: Arc<AsyncMutex<Option<Value>>>,
        uri: Arc<AsyncMutex<String>>,
    }

    async fn capture_handler(
        State(state): State<CaptureState>,
        uri: axum::http::Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let mut out = Vec::new();
        for (name, value) in &headers {
            out.push((
                name.as_str().to_string(),
                value.to_str().unwrap_or("<non-utf8>").to_string(),
            ));
        }
        *state.headers.lock().await = out;
        *state.body.lock().await = Some(body);
        *state.uri.lock().await = uri.to_string();
        Json(json!({"ok": true}))
    }

    async fn start_mock_upstream() -> (String, CaptureState, tokio::task::JoinHandle<()>) {
        let state = CaptureState::default();
        let app = Router::new()
            .route("/generateAssistantResponse", post(capture_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        (format!("http://{}", addr), state, server)
    }

    #[test]
    fn url_includes_origin_and_optional_profile_arn() {
        let client = UpstreamClient::new(None);
        assert_eq!(
            client.build_url("us-east-1", None),
            "https://q.us-east-1.amazonaws.com/generateAssistantResponse?origin=AI_EDITOR"
        );
        assert_eq!(
            client.build_url("eu-west-1", Some("arn:x")),
            "https://q.eu-west-1.amazonaws.com/generateAssistantResponse?origin=AI_EDITOR&profileArn=arn:x"
        );
    }

    #[tokio::test]
    async fn call_carries_bearer_token_and_payload() {
        let (base, state, server) = start_mock_upstream().await;
        let client = UpstreamClient::new_for_test(&base);

        let payload = json!({"conversationState": {"conversationId": "c1"}});
        let resp = client
            .generate_assistant_response("us-east-1", Some("arn:y"), "tok-123", &payload)
            .await
            .expect("call should succeed");
        assert!(resp.status().is_success());

        let headers = state.headers.lock().await.clone();
        let find = |name: &str| -> Option<String> {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(find("authorization"), Some("Bearer tok-123".to_string()));
        assert_eq!(find("content-type"), Some("application/json".to_string()));
        assert!(find("user-agent").unwrap().starts_with("kiro-relay/"));

        let body = state.body.lock().await.clone().unwrap();
        assert_eq!(body["conversationState"]["conversationId"], "c1");
        let uri = state.uri.lock().await.clone();
        assert!(uri.contains("origin=AI_EDITOR"));
        assert!(uri.contains("profileArn=arn:y"));

        server.abort();
    }

    #[test]
    fn quota_headers_parse_when_present() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(UpstreamClient::parse_quota_headers(&headers).is_none());

        headers.insert(QUOTA_REMAINING_HEADER, "42".parse().unwrap());
        headers.insert(QUOTA_RESET_HEADER, "2026-01-01T00:00:00Z".parse().unwrap());
        let snap = UpstreamClient::parse_quota_headers(&headers).unwrap();
        assert_eq!(snap.remaining, 42);
        assert_eq!(snap.reset_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }
}
