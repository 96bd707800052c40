pub mod models;
pub mod streaming;

use serde_json::{json, Value};

use crate::proxy::mappers::kiro::{KiroCompletion, StopKind};
use crate::proxy::mappers::normalizer::{ChatMessage, ContentPart, Role};
use crate::proxy::mappers::{apply_tool_limits, model_mapping, GatewayRequest, Protocol, ToolDefinition};
use crate::proxy::session;
use models::{OpenAiContent, OpenAiContentBlock, OpenAiRequest};

pub const TOOL_CHOICE_INSTRUCTION: &str =
    "You must answer by calling one of the provided tools; do not answer in plain text.";

fn content_to_parts(content: &OpenAiContent) -> Vec<ContentPart> {
    match content {
        OpenAiContent::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::Text { text: s.clone() }]
            }
        }
        OpenAiContent::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                OpenAiContentBlock::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                OpenAiContentBlock::ImageUrl { image_url } => {
                    parse_data_url(&image_url.url).map(|(media_type, data)| ContentPart::Image {
                        media_type,
                        data,
                    })
                }
            })
            .collect(),
    }
}

/// Only `data:` URLs can be forwarded; the upstream takes inline bytes.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
    Some((media_type.to_string(), data.to_string()))
}

/// Decode an OpenAI chat-completion request into the protocol-neutral form.
pub fn translate_in(request: &OpenAiRequest) -> Result<GatewayRequest, String> {
    if request.messages.is_empty() {
        return Err("'messages' must not be empty".to_string());
    }

    let mut notes = Vec::new();
    let (model, mapping_note) = model_mapping::map_model(&request.model);
    if let Some(note) = mapping_note {
        notes.push(note);
    }
    if request.n.unwrap_or(1) > 1 {
        notes.push("n > 1 unsupported, a single choice is returned".to_string());
    }

    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let parts = msg
                    .content
                    .as_ref()
                    .map(content_to_parts)
                    .unwrap_or_default();
                messages.push(ChatMessage {
                    role: Role::System,
                    parts,
                });
            }
            "user" => {
                let parts = msg
                    .content
                    .as_ref()
                    .map(content_to_parts)
                    .unwrap_or_default();
                messages.push(ChatMessage {
                    role: Role::User,
                    parts,
                });
            }
            "assistant" => {
                let mut parts = msg
                    .content
                    .as_ref()
                    .map(content_to_parts)
                    .unwrap_or_default();
                if let Some(tool_calls) = &msg.tool_calls {
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Object(serde_json::Map::new()));
                        parts.push(ContentPart::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    parts,
                });
            }
            "tool" => {
                let content = msg
                    .content
                    .as_ref()
                    .map(|c| match c {
                        OpenAiContent::String(s) => s.clone(),
                        OpenAiContent::Array(_) => c.joined_text(),
                    })
                    .unwrap_or_default();
                messages.push(ChatMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content,
                        is_error: false,
                    }],
                });
            }
            other => {
                return Err(format!("unknown message role '{}'", other));
            }
        }
    }

    let mut tools: Vec<ToolDefinition> = Vec::new();
    if let Some(raw_tools) = &request.tools {
        for raw in raw_tools {
            let function = raw.get("function").unwrap_or(raw);
            let Some(name) = function.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            tools.push(ToolDefinition {
                name: name.to_string(),
                description: function
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                input_schema: function
                    .get("parameters")
                    .cloned()
                    .unwrap_or(json!({"type": "object"})),
            });
        }
    }
    let web_search = apply_tool_limits(&mut tools, &mut notes);

    let mut system = String::new();
    let forced = matches!(
        request.tool_choice.as_ref().and_then(|v| v.as_str()),
        Some("required") | Some("any")
    );
    if forced {
        if tools.is_empty() && !web_search {
            notes.push("tool_choice requires tools but none were provided".to_string());
        } else {
            system = TOOL_CHOICE_INSTRUCTION.to_string();
        }
    }

    let session_id = session::session_key(None, &messages);

    Ok(GatewayRequest {
        protocol: Protocol::OpenAi,
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

/// Shape a complete upstream result as an OpenAI chat completion.
pub fn build_response(completion: &KiroCompletion, model_requested: &str) -> Value {
    let finish_reason = match completion.stop {
        StopKind::ToolUse => "tool_calls",
        StopKind::EndTurn => "stop",
    };

    let mut message = json!({
        "role": "assistant",
        "content": if completion.text.is_empty() { Value::Null } else { Value::String(completion.text.clone()) },
    });
    if !completion.tool_uses.is_empty() {
        let calls: Vec<Value> = completion
            .tool_uses
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "arguments": t.input.to_string(),
                    }
                })
            })
            .collect();
        message["tool_calls"] = Value::Array(calls);
    }

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model_requested,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": completion.input_tokens,
            "completion_tokens": completion.output_tokens,
            "total_tokens": completion.input_tokens + completion.output_tokens,
        }
    })
}

pub fn models_list() -> Value {
    let data: Vec<Value> = model_mapping::advertised_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1706745600,
                "owned_by": "kiro",
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}
