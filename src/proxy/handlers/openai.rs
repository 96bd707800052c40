use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use crate::proxy::handlers::{errors, GuardedStream};
use crate::proxy::mappers::kiro::ResponseAccumulator;
use crate::proxy::mappers::openai::{self, models::OpenAiRequest};
use crate::proxy::mappers::Protocol;
use crate::proxy::orchestrator::{self, GatewayError};
use crate::proxy::state::AppState;
use crate::proxy::upstream::stream::event_stream;

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: OpenAiRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return errors::openai_error(&GatewayError::BadRequest(format!(
                "invalid request body: {}",
                e
            )));
        }
    };

    let mut flow = state.core.monitor.begin(Protocol::OpenAi, &request.model);
    let mut gateway_request = match openai::translate_in(&request) {
        Ok(g) => g,
        Err(reason) => {
            let err = GatewayError::BadRequest(reason);
            flow.set_error(err.kind_str());
            state.core.monitor.finish(flow, err.http_status());
            return errors::openai_error(&err);
        }
    };
    flow.set_model_actual(&gateway_request.model);
    for note in &gateway_request.notes {
        flow.note(note.clone());
    }

    info!(
        "OpenAI request | model {} -> {} | stream {} | messages {} | tools {}",
        gateway_request.model_requested,
        gateway_request.model,
        gateway_request.stream,
        gateway_request.messages.len(),
        gateway_request.tools.len()
    );

    let success = match orchestrator::execute(&state, &mut gateway_request, &mut flow).await {
        Ok(s) => s,
        Err(err) => {
            flow.set_error(err.kind_str());
            state.core.monitor.finish(flow, err.http_status());
            return errors::openai_error(&err);
        }
    };

    let orchestrator::UpstreamSuccess {
        account_id,
        first_chunk,
        rest,
        guard,
        ..
    } = success;
    let events = event_stream(first_chunk, rest);

    if gateway_request.stream {
        let sse = openai::streaming::into_sse(events, gateway_request.model_requested.clone());
        state.core.monitor.finish(flow, 200);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("X-Accel-Buffering", "no")
            .header("X-Account-Id", account_id)
            .header("X-Mapped-Model", gateway_request.model)
            .body(Body::from_stream(GuardedStream::new(sse, guard)))
            .unwrap();
    }

    let mut events = events;
    let mut accumulator = ResponseAccumulator::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(e) => accumulator.process(&e),
            Err(reason) => {
                drop(guard);
                let err = GatewayError::UpstreamUnavailable(reason);
                flow.set_error(err.kind_str());
                state.core.monitor.finish(flow, err.http_status());
                return errors::openai_error(&err);
            }
        }
    }
    drop(guard);

    let completion = accumulator.finish();
    let response = openai::build_response(&completion, &gateway_request.model_requested);
    flow.add_bytes_out(response.to_string().len() as u64);
    state.core.monitor.finish(flow, 200);

    (
        StatusCode::OK,
        [
            ("X-Account-Id", account_id.as_str()),
            ("X-Mapped-Model", gateway_request.model.as_str()),
        ],
        Json(response),
    )
        .into_response()
}

pub async fn handle_list_models() -> Response {
    Json(openai::models_list()).into_response()
}
