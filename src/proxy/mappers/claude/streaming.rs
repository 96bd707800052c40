//! Kiro event stream → Anthropic typed SSE events.
//!
//! Event sequence mirrors the native Messages API: `message_start`, one
//! `content_block_start`/`delta`/`stop` group per block, `message_delta`
//! with the stop reason, `message_stop`.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::proxy::upstream::stream::KiroStreamEvent;

fn event_frame(event_type: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, data))
}

pub fn into_sse(
    mut events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>>,
    model: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>> {
    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());

    let out = async_stream::stream! {
        yield Ok(event_frame("message_start", &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 }
            }
        })));

        let mut block_index: usize = 0;
        let mut text_block_open = false;
        let mut tool_block_open = false;
        let mut used_tool = false;
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;

        while let Some(event) = events.next().await {
            match event {
                Ok(KiroStreamEvent::Content(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    if tool_block_open {
                        yield Ok(event_frame("content_block_stop", &json!({
                            "type": "content_block_stop", "index": block_index
                        })));
                        tool_block_open = false;
                        block_index += 1;
                    }
                    if !text_block_open {
                        yield Ok(event_frame("content_block_start", &json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": { "type": "text", "text": "" }
                        })));
                        text_block_open = true;
                    }
                    yield Ok(event_frame("content_block_delta", &json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": { "type": "text_delta", "text": text }
                    })));
                }
                Ok(KiroStreamEvent::ToolStart { name, tool_use_id, input }) => {
                    used_tool = true;
                    if text_block_open || tool_block_open {
                        yield Ok(event_frame("content_block_stop", &json!({
                            "type": "content_block_stop", "index": block_index
                        })));
                        text_block_open = false;
                        tool_block_open = false;
                        block_index += 1;
                    }
                    let id = if tool_use_id.is_empty() {
                        format!("toolu_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        tool_use_id
                    };
                    yield Ok(event_frame("content_block_start", &json!({
                        "type": "content_block_start",
                        "index": block_index,
                        "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
                    })));
                    tool_block_open = true;
                    if !input.is_empty() {
                        yield Ok(event_frame("content_block_delta", &json!({
                            "type": "content_block_delta",
                            "index": block_index,
                            "delta": { "type": "input_json_delta", "partial_json": input }
                        })));
                    }
                }
                Ok(KiroStreamEvent::ToolInput(partial)) => {
                    if !tool_block_open {
                        continue;
                    }
                    yield Ok(event_frame("content_block_delta", &json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": { "type": "input_json_delta", "partial_json": partial }
                    })));
                }
                Ok(KiroStreamEvent::ToolStop) => {
                    if tool_block_open {
                        yield Ok(event_frame("content_block_stop", &json!({
                            "type": "content_block_stop", "index": block_index
                        })));
                        tool_block_open = false;
                        block_index += 1;
                    }
                }
                Ok(KiroStreamEvent::Usage(u)) => {
                    input_tokens = u.get("inputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                    output_tokens = u.get("outputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                }
                Ok(KiroStreamEvent::ContextUsage(_)) => {}
                Err(message) => {
                    tracing::warn!("Stream relay error: {}", message);
                    yield Ok(event_frame("error", &json!({
                        "type": "error",
                        "error": { "type": "overloaded_error", "message": message }
                    })));
                    return;
                }
            }
        }

        if text_block_open || tool_block_open {
            yield Ok(event_frame("content_block_stop", &json!({
                "type": "content_block_stop", "index": block_index
            })));
        }
        yield Ok(event_frame("message_delta", &json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": if used_tool { "tool_use" } else { "end_turn" },
                "stop_sequence": null
            },
            "usage": { "input_tokens": input_tokens, "output_tokens": output_tokens }
        })));
        yield Ok(event_frame("message_stop", &json!({ "type": "message_stop" })));
    };

    Box::pin(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    async fn collect(events: Vec<Result<KiroStreamEvent, String>>) -> Vec<(String, Value)> {
        let events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>> =
            Box::pin(stream::iter(events));
        let frames: Vec<_> = into_sse(events, "claude-sonnet-4".into()).collect().await;
        frames
            .into_iter()
            .map(|f| {
                let raw = String::from_utf8(f.unwrap().to_vec()).unwrap();
                let mut lines = raw.lines();
                let event = lines
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string();
                let data = serde_json::from_str(
                    lines.next().unwrap().strip_prefix("data: ").unwrap(),
                )
                .unwrap();
                (event, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn text_stream_has_canonical_event_sequence() {
        let frames = collect(vec![
            Ok(KiroStreamEvent::Content("Hel".into())),
            Ok(KiroStreamEvent::Content("lo".into())),
            Ok(KiroStreamEvent::Usage(json!({
                "inputTokenCount": 5, "outputTokenCount": 2
            }))),
        ])
        .await;

        let names: Vec<&str> = frames.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let text: String = frames
            .iter()
            .filter(|(e, _)| e == "content_block_delta")
            .filter_map(|(_, d)| d["delta"]["text"].as_str())
            .collect();
        assert_eq!(text, "Hello");

        let message_delta = &frames[5].1;
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(message_delta["usage"]["input_tokens"], 5);
    }

    #[tokio::test]
    async fn text_then_tool_opens_separate_blocks() {
        let frames = collect(vec![
            Ok(KiroStreamEvent::Content("thinking out loud".into())),
            Ok(KiroStreamEvent::ToolStart {
                name: "lookup".into(),
                tool_use_id: "t1".into(),
                input: "{\"q\":1}".into(),
            }),
            Ok(KiroStreamEvent::ToolStop),
        ])
        .await;

        let names: Vec<&str> = frames.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",  // text, index 0
                "content_block_delta",
                "content_block_stop",
                "content_block_start",  // tool_use, index 1
                "content_block_delta",  // input_json_delta
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let tool_start = &frames[4].1;
        assert_eq!(tool_start["index"], 1);
        assert_eq!(tool_start["content_block"]["type"], "tool_use");
        assert_eq!(tool_start["content_block"]["name"], "lookup");
        assert_eq!(frames[7].1["delta"]["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn mid_stream_error_is_terminal_without_message_stop() {
        let frames = collect(vec![
            Ok(KiroStreamEvent::Content("partial".into())),
            Err("upstream reset".into()),
        ])
        .await;
        let (last_event, last_data) = frames.last().unwrap();
        assert_eq!(last_event, "error");
        assert_eq!(last_data["error"]["message"], "upstream reset");
        assert!(!frames.iter().any(|(e, _)| e == "message_stop"));
    }
}
