//! Kiro event stream → OpenAI `chat.completion.chunk` SSE frames.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::proxy::upstream::stream::KiroStreamEvent;

fn frame(data: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

fn chunk_envelope(stream_id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": stream_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }]
    })
}

/// Relay the upstream event stream as OpenAI chunk frames, ending with a
/// finish chunk, a usage chunk and `data: [DONE]`. Event order is preserved;
/// a mid-stream failure becomes a terminal error frame.
pub fn into_sse(
    mut events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>>,
    model: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>> {
    let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    let out = async_stream::stream! {
        let mut role_sent = false;
        let mut tool_index: i64 = -1;
        let mut used_tool = false;
        let mut usage: Option<Value> = None;

        while let Some(event) = events.next().await {
            match event {
                Ok(KiroStreamEvent::Content(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    let mut delta = json!({ "content": text });
                    if !role_sent {
                        delta["role"] = json!("assistant");
                        role_sent = true;
                    }
                    yield Ok(frame(&chunk_envelope(&stream_id, created, &model, delta, None)));
                }
                Ok(KiroStreamEvent::ToolStart { name, tool_use_id, input }) => {
                    used_tool = true;
                    tool_index += 1;
                    let id = if tool_use_id.is_empty() {
                        format!("call_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        tool_use_id
                    };
                    let mut delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input }
                        }]
                    });
                    if !role_sent {
                        delta["role"] = json!("assistant");
                        role_sent = true;
                    }
                    yield Ok(frame(&chunk_envelope(&stream_id, created, &model, delta, None)));
                }
                Ok(KiroStreamEvent::ToolInput(partial)) => {
                    if tool_index < 0 {
                        continue;
                    }
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "function": { "arguments": partial }
                        }]
                    });
                    yield Ok(frame(&chunk_envelope(&stream_id, created, &model, delta, None)));
                }
                Ok(KiroStreamEvent::ToolStop) | Ok(KiroStreamEvent::ContextUsage(_)) => {}
                Ok(KiroStreamEvent::Usage(u)) => {
                    let prompt = u.get("inputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                    let completion = u.get("outputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                    usage = Some(json!({
                        "prompt_tokens": prompt,
                        "completion_tokens": completion,
                        "total_tokens": prompt + completion,
                    }));
                }
                Err(message) => {
                    tracing::warn!("Stream relay error: {}", message);
                    yield Ok(frame(&json!({
                        "error": { "message": message, "type": "upstream_error" }
                    })));
                    yield Ok(Bytes::from("data: [DONE]\n\n"));
                    return;
                }
            }
        }

        let finish = if used_tool { "tool_calls" } else { "stop" };
        let mut final_chunk = chunk_envelope(&stream_id, created, &model, json!({}), Some(finish));
        if let Some(usage) = usage {
            final_chunk["usage"] = usage;
        }
        yield Ok(frame(&final_chunk));
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Box::pin(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    async fn collect(events: Vec<Result<KiroStreamEvent, String>>) -> String {
        let events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>> =
            Box::pin(stream::iter(events));
        let frames: Vec<_> = into_sse(events, "gpt-4o".into()).collect().await;
        frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect()
    }

    fn data_payloads(raw: &str) -> Vec<Value> {
        raw.split("\n\n")
            .filter_map(|f| f.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn text_deltas_concatenate_in_order() {
        let raw = collect(vec![
            Ok(KiroStreamEvent::Content("Hel".into())),
            Ok(KiroStreamEvent::Content("lo".into())),
        ])
        .await;

        let payloads = data_payloads(&raw);
        let text: String = payloads
            .iter()
            .filter_map(|p| p["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hello");
        // Role only on the first delta; the closing chunk carries finish_reason.
        assert_eq!(payloads[0]["choices"][0]["delta"]["role"], "assistant");
        assert!(payloads[1]["choices"][0]["delta"]["role"].is_null());
        assert_eq!(
            payloads.last().unwrap()["choices"][0]["finish_reason"],
            "stop"
        );
        assert!(raw.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn tool_stream_sets_tool_calls_finish() {
        let raw = collect(vec![
            Ok(KiroStreamEvent::ToolStart {
                name: "lookup".into(),
                tool_use_id: "t1".into(),
                input: "{\"q\":".into(),
            }),
            Ok(KiroStreamEvent::ToolInput("\"x\"}".into())),
            Ok(KiroStreamEvent::ToolStop),
            Ok(KiroStreamEvent::Usage(json!({
                "inputTokenCount": 7, "outputTokenCount": 3
            }))),
        ])
        .await;

        let payloads = data_payloads(&raw);
        assert_eq!(
            payloads[0]["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "lookup"
        );
        let args: String = payloads
            .iter()
            .filter_map(|p| {
                p["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"].as_str()
            })
            .collect();
        assert_eq!(args, "{\"q\":\"x\"}");

        let last = payloads.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(last["usage"]["total_tokens"], 10);
    }

    #[tokio::test]
    async fn mid_stream_error_emits_terminal_error_frame() {
        let raw = collect(vec![
            Ok(KiroStreamEvent::Content("partial".into())),
            Err("connection reset".into()),
        ])
        .await;
        let payloads = data_payloads(&raw);
        assert_eq!(
            payloads.last().unwrap()["error"]["message"],
            "connection reset"
        );
        assert!(raw.trim_end().ends_with("data: [DONE]"));
    }
}
