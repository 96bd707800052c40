//! The per-request state machine: normalize, govern, select, call, classify,
//! rotate. Handlers translate protocols; everything between translate-in and
//! translate-out happens here.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::{timeout, Duration};

use crate::proxy::accounts::store::CredentialStore;
use crate::proxy::mappers::governor;
use crate::proxy::mappers::kiro;
use crate::proxy::mappers::normalizer;
use crate::proxy::mappers::GatewayRequest;
use crate::proxy::monitor::FlowHandle;
use crate::proxy::state::AppState;
use crate::proxy::upstream::errors::{self, UpstreamErrorKind};
use crate::proxy::upstream::stream::ByteStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    NoAccountAvailable,
    AuthenticationFailed,
    RateLimitedAllAccounts,
    ContentLengthExceeded,
    UpstreamUnavailable(String),
    BadRequest(String),
    UnsupportedFeature(String),
    Internal(String),
}

impl GatewayError {
    pub fn kind_str(&self) -> &'static str {
        match self {
            GatewayError::NoAccountAvailable => "no_account_available",
            GatewayError::AuthenticationFailed => "authentication_failed",
            GatewayError::RateLimitedAllAccounts => "rate_limited_all_accounts",
            GatewayError::ContentLengthExceeded => "content_length_exceeded",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::UnsupportedFeature(_) => "unsupported_feature",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::NoAccountAvailable => 503,
            GatewayError::AuthenticationFailed => 502,
            GatewayError::RateLimitedAllAccounts => 429,
            GatewayError::ContentLengthExceeded => 400,
            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::BadRequest(_) => 400,
            GatewayError::UnsupportedFeature(_) => 400,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            GatewayError::NoAccountAvailable => "No upstream account is available".to_string(),
            GatewayError::AuthenticationFailed => {
                "Upstream authentication failed for all attempted accounts".to_string()
            }
            GatewayError::RateLimitedAllAccounts => {
                "All upstream accounts are rate limited, retry later".to_string()
            }
            GatewayError::ContentLengthExceeded => {
                "Conversation exceeds the upstream content length limit".to_string()
            }
            GatewayError::UpstreamUnavailable(detail) => {
                format!("Upstream unavailable: {}", detail)
            }
            GatewayError::BadRequest(detail) => detail.clone(),
            GatewayError::UnsupportedFeature(detail) => {
                format!("Unsupported feature: {}", detail)
            }
            GatewayError::Internal(detail) => format!("Internal error: {}", detail),
        }
    }
}

/// Balances the account in-flight gauge and the global gauge on every exit
/// path, including a client dropping a half-read stream.
pub struct InFlightGuard {
    store: Arc<CredentialStore>,
    account_id: String,
    global: Arc<crate::proxy::state::RuntimeState>,
}

impl InFlightGuard {
    fn new(state: &AppState, account_id: &str) -> Self {
        state.runtime.inflight.fetch_add(1, Ordering::Relaxed);
        Self {
            store: state.core.store.clone(),
            account_id: account_id.to_string(),
            global: state.runtime.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.store.end_flight(&self.account_id);
        self.global.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A committed upstream call: status was success and the first data chunk
/// has arrived. From here the account cannot change; translators relay the
/// stream and the guard travels with it.
impl std::fmt::Debug for UpstreamSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSuccess")
            .field("account_id", &self.account_id)
            .field("account_label", &self.account_label)
            .field("first_chunk", &self.first_chunk)
            .finish_non_exhaustive()
    }
}

pub struct UpstreamSuccess {
    pub account_id: String,
    pub account_label: String,
    pub first_chunk: Bytes,
    pub rest: ByteStream,
    pub guard: InFlightGuard,
}

pub async fn execute(
    state: &AppState,
    request: &mut GatewayRequest,
    flow: &mut FlowHandle,
) -> Result<UpstreamSuccess, GatewayError> {
    let deadline = Duration::from_secs(state.config.request_deadline_secs);
    match timeout(deadline, execute_inner(state, request, flow)).await {
        Ok(result) => result,
        Err(_) => {
            flow.note("request deadline exceeded");
            Err(GatewayError::UpstreamUnavailable(
                "request deadline exceeded".to_string(),
            ))
        }
    }
}

async fn execute_inner(
    state: &AppState,
    request: &mut GatewayRequest,
    flow: &mut FlowHandle,
) -> Result<UpstreamSuccess, GatewayError> {
    let max_inflight = state.config.max_inflight;
    if max_inflight > 0 && state.runtime.inflight.load(Ordering::Relaxed) >= max_inflight as i64 {
        return Err(GatewayError::UpstreamUnavailable(
            "gateway at in-flight capacity".to_string(),
        ));
    }

    // NORMALIZE: repair the conversation and merge any extracted system
    // content behind the translator-provided prefix.
    let (extracted_system, normalized) = normalizer::normalize(&request.messages);
    request.messages = normalized;
    if !extracted_system.is_empty() {
        request.system = if request.system.is_empty() {
            extracted_system
        } else {
            format!("{}\n\n{}", request.system, extracted_system)
        };
    }

    // GOVERN (pre): size-based truncation, optionally backed by a summary of
    // the dropped prefix.
    let governor_config = *state.config.governor.read().await;
    let outcome = governor::apply_pre(&mut request.messages, &governor_config);
    if outcome.truncated {
        flow.note(format!(
            "history truncated ({} messages dropped)",
            outcome.dropped.len()
        ));
        if governor_config.smart_summary {
            if let Some(summary) =
                summarize_dropped(state, &request.session_id, &outcome.dropped).await
            {
                let note = governor::summary_note(&summary);
                request.system = if request.system.is_empty() {
                    note
                } else {
                    format!("{}\n\n{}", request.system, note)
                };
                flow.note("summary prefix attached");
            }
        }
    }

    let active = state.core.store.active_count();
    let max_attempts = crate::constants::MAX_SELECTION_ATTEMPTS.min(active).max(1);
    let conversation_id = uuid::Uuid::new_v4().to_string();

    let mut excluded: HashSet<String> = HashSet::new();
    let mut saw_rate_limited = false;
    let mut saw_auth_failure = false;
    let mut length_retry_done = false;
    let mut last_error = String::new();
    let mut attempt = 0usize;

    while attempt < max_attempts {
        let Some(account) = state
            .core
            .selector
            .select(Some(&request.session_id), &excluded)
        else {
            break;
        };
        attempt += 1;
        flow.set_account(&account.id);
        let guard = InFlightGuard::new(state, &account.id);

        let payload = kiro::build_payload(
            request,
            &request.messages,
            &conversation_id,
            account.profile_arn.as_deref(),
        );
        flow.set_bytes_in(payload.to_string().len() as u64);

        tracing::info!(
            "Attempt {}/{} via account {} (model {})",
            attempt,
            max_attempts,
            account.label,
            request.model
        );

        let response = match state
            .core
            .upstream
            .generate_assistant_response(
                &account.region,
                account.profile_arn.as_deref(),
                &account.access_token,
                &payload,
            )
            .await
        {
            Ok(r) => r,
            Err(transport) => {
                tracing::warn!("Transport error on {}: {}", account.label, transport);
                last_error = transport;
                state.core.store.record_error(&account.id);
                excluded.insert(account.id);
                continue;
            }
        };

        if let Some(snapshot) =
            crate::proxy::upstream::UpstreamClient::parse_quota_headers(response.headers())
        {
            state.core.store.record_quota(&account.id, snapshot);
        }

        let status = response.status();
        if status.is_success() {
            // Commit only after the first data chunk: a stream that dies
            // before any byte can still rotate to another account.
            let mut byte_stream: ByteStream = Box::pin(response.bytes_stream());
            match peek_first_chunk(&mut byte_stream).await {
                Ok(first_chunk) => {
                    flow.mark_first_byte();
                    return Ok(UpstreamSuccess {
                        account_id: account.id,
                        account_label: account.label,
                        first_chunk,
                        rest: byte_stream,
                        guard,
                    });
                }
                Err(reason) => {
                    tracing::warn!("Stream failed before first byte on {}: {}", account.label, reason);
                    last_error = reason;
                    state.core.store.record_error(&account.id);
                    excluded.insert(account.id);
                    continue;
                }
            }
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let kind = errors::classify(status_code, &body);
        last_error = format!("HTTP {}: {}", status_code, truncate_for_log(&body));
        tracing::warn!(
            "Upstream error on {}: {} ({})",
            account.label,
            status_code,
            kind.as_str()
        );

        match kind {
            UpstreamErrorKind::RateLimited => {
                state
                    .core
                    .store
                    .mark_cooldown(&account.id, crate::constants::COOLDOWN_SECS);
                saw_rate_limited = true;
                excluded.insert(account.id);
            }
            UpstreamErrorKind::AuthFailed => {
                state
                    .core
                    .store
                    .mark_unhealthy(&account.id, &format!("upstream {}", status_code));
                state.core.refresher.trigger(&account.id);
                saw_auth_failure = true;
                excluded.insert(account.id);
            }
            UpstreamErrorKind::LengthExceeded => {
                if governor_config.error_retry && !length_retry_done {
                    length_retry_done = true;
                    let target = governor::error_retry_target(1);
                    let dropped = governor::truncate_to(&mut request.messages, target);
                    flow.note(format!(
                        "length error retry: dropped {} message(s)",
                        dropped.len()
                    ));
                    if dropped.is_empty() {
                        // Nothing left to shed; a retry would only repeat the
                        // same failure.
                        return Err(GatewayError::ContentLengthExceeded);
                    }
                    // The governed retry does not consume a selection attempt
                    // and stays on the same account.
                    attempt -= 1;
                    continue;
                }
                return Err(GatewayError::ContentLengthExceeded);
            }
            UpstreamErrorKind::ServerError | UpstreamErrorKind::TransportError => {
                state.core.store.record_error(&account.id);
                excluded.insert(account.id);
            }
            UpstreamErrorKind::ClientError => {
                return Err(GatewayError::BadRequest(format!(
                    "upstream rejected request: {}",
                    truncate_for_log(&body)
                )));
            }
        }
    }

    if attempt == 0 {
        // Never selected anything: the pool is empty, cooling down, or fully
        // excluded before the first pick.
        return Err(if state.core.store.earliest_cooldown_wait().is_some() {
            GatewayError::RateLimitedAllAccounts
        } else {
            GatewayError::NoAccountAvailable
        });
    }
    if saw_rate_limited {
        return Err(GatewayError::RateLimitedAllAccounts);
    }
    if saw_auth_failure {
        return Err(GatewayError::AuthenticationFailed);
    }
    Err(GatewayError::UpstreamUnavailable(last_error))
}

/// Poll the stream until the first non-empty chunk. Heartbeat-style empty
/// chunks are skipped; end-of-stream or a timeout before data is a failure.
async fn peek_first_chunk(stream: &mut ByteStream) -> Result<Bytes, String> {
    let deadline = Duration::from_secs(crate::constants::FIRST_CHUNK_TIMEOUT_SECS);
    loop {
        match timeout(deadline, stream.next()).await {
            Ok(Some(Ok(bytes))) => {
                if bytes.is_empty() {
                    continue;
                }
                return Ok(bytes);
            }
            Ok(Some(Err(e))) => return Err(format!("stream error before first byte: {}", e)),
            Ok(None) => return Err("empty response stream".to_string()),
            Err(_) => return Err("timeout waiting for first byte".to_string()),
        }
    }
}

/// Summarize a dropped prefix through the cheap model. Best effort: any
/// failure falls back to plain truncation.
async fn summarize_dropped(
    state: &AppState,
    session_key: &str,
    dropped: &[normalizer::ChatMessage],
) -> Option<String> {
    let hash = governor::prefix_hash(dropped);
    if let Some(cached) = state.core.summary_cache.get(session_key, hash) {
        tracing::debug!("Summary cache hit for {}", session_key);
        return Some(cached);
    }

    let account = state.core.selector.select(None, &HashSet::new())?;
    let _guard = InFlightGuard::new(state, &account.id);

    let prompt = format!(
        "{}\n\nConversation:\n{}",
        governor::SUMMARY_PROMPT,
        governor::format_for_summary(dropped)
    );
    let summary_request = GatewayRequest {
        protocol: crate::proxy::mappers::Protocol::Anthropic,
        model_requested: crate::constants::SUMMARY_MODEL.to_string(),
        model: crate::constants::SUMMARY_MODEL.to_string(),
        system: String::new(),
        messages: vec![normalizer::ChatMessage::text(normalizer::Role::User, prompt)],
        tools: Vec::new(),
        web_search: false,
        stream: false,
        session_id: session_key.to_string(),
        notes: Vec::new(),
    };
    let payload = kiro::build_payload(
        &summary_request,
        &summary_request.messages,
        &uuid::Uuid::new_v4().to_string(),
        account.profile_arn.as_deref(),
    );

    let response = state
        .core
        .upstream
        .generate_assistant_response(
            &account.region,
            account.profile_arn.as_deref(),
            &account.access_token,
            &payload,
        )
        .await
        .ok()?;
    if !response.status().is_success() {
        tracing::warn!("Summary call failed with {}", response.status());
        return None;
    }

    let body = response.text().await.ok()?;
    let mut accumulator = kiro::ResponseAccumulator::new();
    let mut buffer = crate::proxy::upstream::stream::EventBuffer::new();
    for event in buffer.feed(body.as_bytes()) {
        accumulator.process(&event);
    }
    for event in buffer.finish() {
        accumulator.process(&event);
    }
    let completion = accumulator.finish();
    if completion.text.trim().is_empty() {
        return None;
    }

    state
        .core
        .summary_cache
        .put(session_key, hash, completion.text.clone());
    Some(completion.text)
}

fn truncate_for_log(body: &str) -> String {
    if body.chars().count() > 300 {
        body.chars().take(300).collect::<String>() + "…"
    } else {
        body.to_string()
    }
}
