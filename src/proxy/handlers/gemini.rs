use axum::body::Body;
use axum::extract::{Json, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use crate::proxy::handlers::{errors, GuardedStream};
use crate::proxy::mappers::gemini::{self, models::GeminiRequest};
use crate::proxy::mappers::kiro::ResponseAccumulator;
use crate::proxy::mappers::Protocol;
use crate::proxy::orchestrator::{self, GatewayError};
use crate::proxy::state::AppState;
use crate::proxy::upstream::stream::event_stream;

/// `/v1/models/{model}:generateContent` arrives as one path segment; split
/// the model name from the action behind the colon.
fn split_model_action(segment: &str) -> Result<(&str, &str), GatewayError> {
    match segment.split_once(':') {
        Some((model, action)) if !model.is_empty() => Ok((model, action)),
        _ => Err(GatewayError::BadRequest(format!(
            "expected 'model:action' in path, got '{}'",
            segment
        ))),
    }
}

pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let (model, action) = match split_model_action(&model_action) {
        Ok(pair) => pair,
        Err(err) => return errors::gemini_error(&err),
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return errors::gemini_error(&GatewayError::BadRequest(format!(
                "unsupported action '{}'",
                other
            )));
        }
    };

    let request: GeminiRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return errors::gemini_error(&GatewayError::BadRequest(format!(
                "invalid request body: {}",
                e
            )));
        }
    };

    let mut flow = state.core.monitor.begin(Protocol::Gemini, model);
    let mut gateway_request = match gemini::translate_in(&request, model, stream) {
        Ok(g) => g,
        Err(reason) => {
            let err = GatewayError::BadRequest(reason);
            flow.set_error(err.kind_str());
            state.core.monitor.finish(flow, err.http_status());
            return errors::gemini_error(&err);
        }
    };
    flow.set_model_actual(&gateway_request.model);
    for note in &gateway_request.notes {
        flow.note(note.clone());
    }

    info!(
        "Gemini request | model {} -> {} | stream {} | contents {}",
        gateway_request.model_requested,
        gateway_request.model,
        stream,
        gateway_request.messages.len()
    );

    let success = match orchestrator::execute(&state, &mut gateway_request, &mut flow).await {
        Ok(s) => s,
        Err(err) => {
            flow.set_error(err.kind_str());
            state.core.monitor.finish(flow, err.http_status());
            return errors::gemini_error(&err);
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

    if stream {
        let body_stream = gemini::streaming::into_json_array_stream(
            events,
            gateway_request.model_requested.clone(),
        );
        state.core.monitor.finish(flow, 200);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Account-Id", account_id)
            .header("X-Mapped-Model", gateway_request.model)
            .body(Body::from_stream(GuardedStream::new(body_stream, guard)))
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
                return errors::gemini_error(&err);
            }
        }
    }
    drop(guard);

    let completion = accumulator.finish();
    let response = gemini::build_response(&completion, &gateway_request.model_requested);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_action_splitting() {
        assert_eq!(
            split_model_action("gemini-1.5-pro:generateContent").unwrap(),
            ("gemini-1.5-pro", "generateContent")
        );
        assert_eq!(
            split_model_action("auto:streamGenerateContent").unwrap(),
            ("auto", "streamGenerateContent")
        );
        assert!(split_model_action("no-action-here").is_err());
        assert!(split_model_action(":generateContent").is_err());
    }
}
