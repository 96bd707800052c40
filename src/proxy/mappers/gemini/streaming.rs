//! Kiro event stream → streamed JSON array of `generateContent` partials.
//!
//! The Gemini streaming surface frames chunks as one JSON array written
//! incrementally: `[` partial `,` partial `…` `]`.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::proxy::upstream::stream::KiroStreamEvent;

fn partial(model: &str, parts: Vec<Value>, finish: Option<&str>, usage: Option<&Value>) -> Value {
    let mut candidate = json!({
        "content": { "parts": parts, "role": "model" },
        "index": 0,
    });
    if let Some(reason) = finish {
        candidate["finishReason"] = json!(reason);
    }
    let mut out = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    if let Some(usage) = usage {
        out["usageMetadata"] = usage.clone();
    }
    out
}

pub fn into_json_array_stream(
    mut events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>>,
    model: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>> {
    let out = async_stream::stream! {
        let mut first = true;
        let mut usage: Option<Value> = None;

        // Array framing: "[" before the first element, "," before the rest.
        let frame = |first: &mut bool, value: &Value| {
            let prefix = if *first { "[" } else { "," };
            *first = false;
            Bytes::from(format!("{}{}\n", prefix, value))
        };

        while let Some(event) = events.next().await {
            match event {
                Ok(KiroStreamEvent::Content(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    let chunk = partial(&model, vec![json!({"text": text})], None, None);
                    yield Ok(frame(&mut first, &chunk));
                }
                Ok(KiroStreamEvent::ToolStart { name, input, .. }) => {
                    let args: Value =
                        serde_json::from_str(&input).unwrap_or(Value::Object(Default::default()));
                    let chunk = partial(
                        &model,
                        vec![json!({"functionCall": {"name": name, "args": args}})],
                        None,
                        None,
                    );
                    yield Ok(frame(&mut first, &chunk));
                }
                // Partial tool input has no Gemini framing of its own; the
                // whole call is emitted at ToolStart, which carries the full
                // input in the common single-event case.
                Ok(KiroStreamEvent::ToolInput(_)) | Ok(KiroStreamEvent::ToolStop) => {}
                Ok(KiroStreamEvent::ContextUsage(_)) => {}
                Ok(KiroStreamEvent::Usage(u)) => {
                    let prompt = u.get("inputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                    let candidates = u.get("outputTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
                    usage = Some(json!({
                        "promptTokenCount": prompt,
                        "candidatesTokenCount": candidates,
                        "totalTokenCount": prompt + candidates,
                    }));
                }
                Err(message) => {
                    tracing::warn!("Stream relay error: {}", message);
                    let error_chunk = json!({
                        "error": { "code": 502, "message": message, "status": "UNAVAILABLE" }
                    });
                    yield Ok(frame(&mut first, &error_chunk));
                    yield Ok(Bytes::from("]\n"));
                    return;
                }
            }
        }

        let closing = partial(&model, Vec::new(), Some("STOP"), usage.as_ref());
        yield Ok(frame(&mut first, &closing));
        yield Ok(Bytes::from("]\n"));
    };

    Box::pin(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    async fn collect(events: Vec<Result<KiroStreamEvent, String>>) -> (String, Vec<Value>) {
        let events: Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>> =
            Box::pin(stream::iter(events));
        let frames: Vec<_> = into_json_array_stream(events, "gemini-1.5-pro".into())
            .collect()
            .await;
        let raw: String = frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect();
        let parsed: Vec<Value> = serde_json::from_str(&raw).expect("whole stream is a JSON array");
        (raw, parsed)
    }

    #[tokio::test]
    async fn stream_is_one_well_formed_json_array() {
        let (raw, parsed) = collect(vec![
            Ok(KiroStreamEvent::Content("Hel".into())),
            Ok(KiroStreamEvent::Content("lo".into())),
            Ok(KiroStreamEvent::Usage(json!({
                "inputTokenCount": 4, "outputTokenCount": 2
            }))),
        ])
        .await;

        assert!(raw.starts_with('['));
        assert_eq!(parsed.len(), 3);

        let text: String = parsed
            .iter()
            .filter_map(|p| p["candidates"][0]["content"]["parts"][0]["text"].as_str())
            .collect();
        assert_eq!(text, "Hello");

        let last = parsed.last().unwrap();
        assert_eq!(last["candidates"][0]["finishReason"], "STOP");
        assert_eq!(last["usageMetadata"]["totalTokenCount"], 6);
    }

    #[tokio::test]
    async fn function_calls_are_framed_as_parts() {
        let (_, parsed) = collect(vec![Ok(KiroStreamEvent::ToolStart {
            name: "lookup".into(),
            tool_use_id: "t1".into(),
            input: "{\"q\":1}".into(),
        })])
        .await;
        assert_eq!(
            parsed[0]["candidates"][0]["content"]["parts"][0]["functionCall"]["name"],
            "lookup"
        );
        assert_eq!(
            parsed[0]["candidates"][0]["content"]["parts"][0]["functionCall"]["args"]["q"],
            1
        );
    }

    #[tokio::test]
    async fn mid_stream_error_closes_the_array() {
        let (raw, parsed) = collect(vec![
            Ok(KiroStreamEvent::Content("part".into())),
            Err("gone".into()),
        ])
        .await;
        assert!(raw.trim_end().ends_with(']'));
        assert_eq!(parsed.last().unwrap()["error"]["status"], "UNAVAILABLE");
    }
}
