//! Kiro event-stream parsing.
//!
//! The upstream emits newline-delimited JSON objects, identified by their
//! top-level keys (`content`, `name`, `input`, `stop`, `usage`,
//! `contextUsagePercentage`) rather than SSE event names.

use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use std::pin::Pin;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum KiroStreamEvent {
    /// Assistant text chunk.
    Content(String),
    /// Tool call opening, possibly carrying the first input fragment.
    ToolStart {
        name: String,
        tool_use_id: String,
        input: String,
    },
    /// Tool input continuation.
    ToolInput(String),
    /// Tool call closed.
    ToolStop,
    /// Token accounting.
    Usage(serde_json::Value),
    /// Context window consumption.
    ContextUsage(f64),
}

/// Parse one line of the stream. Keys are inspected in priority order so key
/// reordering inside the JSON object does not matter.
pub fn parse_event_line(line: &str) -> Option<KiroStreamEvent> {
    if line.starts_with('[') {
        return parse_bracket_tool_call(line);
    }

    let data: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            trace!("Unparseable stream line: {}", &line[..line.len().min(100)]);
            return None;
        }
    };
    let obj = data.as_object()?;

    if let Some(content) = obj.get("content").and_then(|v| v.as_str()) {
        return Some(KiroStreamEvent::Content(content.to_string()));
    }
    if obj.contains_key("name") {
        let name = obj.get("name")?.as_str()?.to_string();
        let tool_use_id = obj
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let input = match obj.get("input") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return Some(KiroStreamEvent::ToolStart {
            name,
            tool_use_id,
            input,
        });
    }
    if let Some(input) = obj.get("input").and_then(|v| v.as_str()) {
        return Some(KiroStreamEvent::ToolInput(input.to_string()));
    }
    if obj.contains_key("stop") {
        return Some(KiroStreamEvent::ToolStop);
    }
    if let Some(usage) = obj.get("usage") {
        return Some(KiroStreamEvent::Usage(usage.clone()));
    }
    if let Some(pct) = obj.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
        return Some(KiroStreamEvent::ContextUsage(pct));
    }

    trace!("Unrecognized stream line: {}", &line[..line.len().min(100)]);
    None
}

/// Some responses carry a whole tool call as a one-element JSON array inline
/// in the content stream.
fn parse_bracket_tool_call(line: &str) -> Option<KiroStreamEvent> {
    let data: serde_json::Value = serde_json::from_str(line).ok()?;
    let first = data.as_array()?.first()?;
    let name = first.get("name")?.as_str()?.to_string();
    let tool_use_id = first
        .get("toolUseId")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let input = first.get("input").map(|v| v.to_string()).unwrap_or_default();
    Some(KiroStreamEvent::ToolStart {
        name,
        tool_use_id,
        input,
    })
}

/// Incremental line buffer: feed raw chunks, drain complete events.
#[derive(Default)]
pub struct EventBuffer {
    buffer: String,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<KiroStreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event) = parse_event_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Drain whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Vec<KiroStreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let line = rest.trim();
        if line.is_empty() {
            return Vec::new();
        }
        parse_event_line(line).into_iter().collect()
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Turn a raw upstream byte stream (with its already-peeked first chunk)
/// into a stream of parsed events. Transport errors surface as `Err` items
/// so translators can emit a terminal error frame.
pub fn event_stream(
    first_chunk: Bytes,
    mut rest: ByteStream,
) -> Pin<Box<dyn Stream<Item = Result<KiroStreamEvent, String>> + Send>> {
    let stream = async_stream::stream! {
        let mut buffer = EventBuffer::new();
        for event in buffer.feed(&first_chunk) {
            yield Ok(event);
        }
        while let Some(chunk) = rest.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in buffer.feed(&bytes) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(format!("upstream stream error: {}", e));
                    return;
                }
            }
        }
        for event in buffer.finish() {
            yield Ok(event);
        }
    };
    Box::pin(stream)
}
