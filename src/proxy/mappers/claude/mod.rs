pub mod models;
pub mod streaming;

use serde_json::{json, Value};

use crate::proxy::mappers::kiro::{KiroCompletion, StopKind};
use crate::proxy::mappers::normalizer::{ChatMessage, ContentPart, Role};
use crate::proxy::mappers::{apply_tool_limits, model_mapping, GatewayRequest, Protocol, ToolDefinition};
use crate::proxy::session;
use models::{ClaudeRequest, ContentBlock, MessageContent};

fn tool_result_text(content: &Option<Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn blocks_to_parts(blocks: &[ContentBlock]) -> Vec<ContentPart> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => Some(ContentPart::Image {
                media_type: source.media_type.clone(),
                data: source.data.clone(),
            }),
            ContentBlock::ToolUse { id, name, input } => Some(ContentPart::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ContentPart::ToolResult {
                tool_call_id: tool_use_id.clone(),
                content: tool_result_text(content),
                is_error: is_error.unwrap_or(false),
            }),
            // No upstream slot for thinking; dropping it keeps the turn valid.
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => None,
        })
        .collect()
}

pub fn translate_in(request: &ClaudeRequest) -> Result<GatewayRequest, String> {
    if request.messages.is_empty() {
        return Err("'messages' must not be empty".to_string());
    }

    let mut notes = Vec::new();
    let (model, mapping_note) = model_mapping::map_model(&request.model);
    if let Some(note) = mapping_note {
        notes.push(note);
    }

    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => return Err(format!("unknown message role '{}'", other)),
        };
        let parts = match &msg.content {
            MessageContent::String(s) => {
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentPart::Text { text: s.clone() }]
                }
            }
            MessageContent::Array(blocks) => blocks_to_parts(blocks),
        };
        messages.push(ChatMessage { role, parts });
    }

    let mut tools: Vec<ToolDefinition> = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|t| ToolDefinition {
            name: t.name.clone(),
            description: t.description.clone().unwrap_or_default(),
            input_schema: if t.input_schema.is_null() {
                json!({"type": "object"})
            } else {
                t.input_schema.clone()
            },
        })
        .collect();
    let web_search = apply_tool_limits(&mut tools, &mut notes);

    let mut system = request
        .system
        .as_ref()
        .map(|s| s.joined_text())
        .unwrap_or_default();

    let forced = matches!(
        request
            .tool_choice
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str()),
        Some("any") | Some("tool")
    );
    if forced {
        if tools.is_empty() && !web_search {
            notes.push("tool_choice requires tools but none were provided".to_string());
        } else {
            let instruction = super::openai::TOOL_CHOICE_INSTRUCTION;
            system = if system.is_empty() {
                instruction.to_string()
            } else {
                format!("{}\n\n{}", system, instruction)
            };
        }
    }

    let explicit_key = request
        .metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref());
    let session_id = session::session_key(explicit_key, &messages);

    Ok(GatewayRequest {
        protocol: Protocol::Anthropic,
        model_requested: request.model.clone(),
        model,
        system,
        messages,
        tools,
        web_search,
        stream: request.stream,
        session_id,
        notes,
    })
}

/// Shape a complete upstream result as an Anthropic message.
pub fn build_response(completion: &KiroCompletion, model_requested: &str) -> Value {
    let mut content: Vec<Value> = Vec::new();
    if !completion.text.is_empty() {
        content.push(json!({"type": "text", "text": completion.text}));
    }
    for tool in &completion.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tool.id,
            "name": tool.name,
            "input": tool.input,
        }));
    }

    let stop_reason = match completion.stop {
        StopKind::ToolUse => "tool_use",
        StopKind::EndTurn => "end_turn",
    };

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model_requested,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": completion.input_tokens,
            "output_tokens": completion.output_tokens,
        }
    })
}

/// `count_tokens` without a tokenizer: the same character heuristic the
/// governor budgets with.
pub fn count_tokens(request: &ClaudeRequest) -> Value {
    let translated = translate_in(request);
    let tokens = match &translated {
        Ok(gw) => {
            let mut total = crate::proxy::mappers::governor::estimate_tokens(&gw.messages);
            total += (gw.system.chars().count() / 4) as u32;
            total
        }
        Err(_) => 0,
    };
    json!({ "input_tokens": tokens })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(body: Value) -> ClaudeRequest {
        serde_json::from_value(body).expect("valid request")
    }

    #[test]
    fn system_and_metadata_flow_through() {
        let req = decode(json!({
            "model": "sonnet",
            "system": "stay focused",
            "metadata": {"user_id": "agent-7"},
            "messages": [{"role": "user", "content": "hello hello hello"}]
        }));
        let gw = translate_in(&req).expect("translate");
        assert_eq!(gw.model, "claude-sonnet-4");
        assert_eq!(gw.system, "stay focused");
        assert_eq!(gw.session_id, "agent-7");
    }

    #[test]
    fn blocks_translate_to_parts() {
        let req = decode(json!({
            "model": "sonnet",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "tool_use", "id": "t1", "name": "lookup", "input": {"q": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "found"}]}
                ]}
            ]
        }));
        let gw = translate_in(&req).expect("translate");

        assert!(matches!(&gw.messages[0].parts[1], ContentPart::Image { media_type, .. } if media_type == "image/png"));
        // Thinking dropped, tool_use kept.
        assert_eq!(gw.messages[1].parts.len(), 1);
        assert!(matches!(&gw.messages[1].parts[0], ContentPart::ToolUse { id, .. } if id == "t1"));
        assert!(matches!(
            &gw.messages[2].parts[0],
            ContentPart::ToolResult { tool_call_id, content, .. } if tool_call_id == "t1" && content == "found"
        ));
    }

    #[test]
    fn tool_choice_any_injects_instruction_after_system() {
        let req = decode(json!({
            "model": "sonnet",
            "system": "sys",
            "tool_choice": {"type": "any"},
            "tools": [{"name": "t", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "go"}]
        }));
        let gw = translate_in(&req).expect("translate");
        assert!(gw.system.starts_with("sys"));
        assert!(gw.system.contains(super::super::openai::TOOL_CHOICE_INSTRUCTION));
    }

    #[test]
    fn web_search_tool_is_recognized_as_native() {
        let req = decode(json!({
            "model": "sonnet",
            "tools": [{"name": "web_search", "input_schema": {}}],
            "messages": [{"role": "user", "content": "search something"}]
        }));
        let gw = translate_in(&req).expect("translate");
        assert!(gw.web_search);
        assert!(gw.tools.is_empty());
    }

    #[test]
    fn response_shape() {
        let completion = KiroCompletion {
            text: "answer".into(),
            tool_uses: vec![crate::proxy::mappers::kiro::CompletedToolUse {
                id: "t1".into(),
                name: "lookup".into(),
                input: json!({}),
            }],
            input_tokens: 11,
            output_tokens: 7,
            stop: StopKind::ToolUse,
        };
        let out = build_response(&completion, "claude-sonnet-4.5");
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["type"], "text");
        assert_eq!(out["content"][1]["type"], "tool_use");
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["usage"]["input_tokens"], 11);
    }

    #[test]
    fn count_tokens_scales_with_content() {
        let small = decode(json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let big = decode(json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "x".repeat(4000)}]
        }));
        let small_count = count_tokens(&small)["input_tokens"].as_u64().unwrap();
        let big_count = count_tokens(&big)["input_tokens"].as_u64().unwrap();
        assert!(big_count > small_count);
        assert!(big_count >= 900);
    }
}
