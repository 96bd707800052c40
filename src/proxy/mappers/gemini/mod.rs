pub mod models;
pub mod streaming;

use serde_json::{json, Value};

use crate::proxy::mappers::kiro::{KiroCompletion, StopKind};
use crate::proxy::mappers::normalizer::{ChatMessage, ContentPart, Role};
use crate::proxy::mappers::{apply_tool_limits, model_mapping, GatewayRequest, Protocol, ToolDefinition};
use crate::proxy::session;
use models::{GeminiContent, GeminiRequest};

fn content_to_parts(content: &GeminiContent) -> Vec<ContentPart> {
    let mut parts = Vec::with_capacity(content.parts.len());
    for part in &content.parts {
        if let Some(text) = &part.text {
            if !text.is_empty() {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }
        if let Some(inline) = &part.inline_data {
            parts.push(ContentPart::Image {
                media_type: inline.mime_type.clone(),
                data: inline.data.clone(),
            });
        }
        if let Some(call) = &part.function_call {
            // Gemini pairs calls and responses by function name; the name
            // doubles as the tool-call id on both sides.
            parts.push(ContentPart::ToolUse {
                id: call.name.clone(),
                name: call.name.clone(),
                input: call.args.clone(),
            });
        }
        if let Some(response) = &part.function_response {
            parts.push(ContentPart::ToolResult {
                tool_call_id: response.name.clone(),
                content: response.response.to_string(),
                is_error: false,
            });
        }
    }
    parts
}

pub fn translate_in(
    request: &GeminiRequest,
    model_path: &str,
    stream: bool,
) -> Result<GatewayRequest, String> {
    if request.contents.is_empty() {
        return Err("'contents' must not be empty".to_string());
    }

    let mut notes = Vec::new();
    let (model, mapping_note) = model_mapping::map_model(model_path);
    if let Some(note) = mapping_note {
        notes.push(note);
    }

    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.contents.len());
    for content in &request.contents {
        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            // Gemini omits the role on single-turn requests.
            Some("user") | None => Role::User,
            Some(other) => return Err(format!("unknown content role '{}'", other)),
        };
        messages.push(ChatMessage {
            role,
            parts: content_to_parts(content),
        });
    }

    let mut tools: Vec<ToolDefinition> = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .flat_map(|group| &group.function_declarations)
        .map(|decl| ToolDefinition {
            name: decl.name.clone(),
            description: decl.description.clone().unwrap_or_default(),
            input_schema: decl
                .parameters
                .clone()
                .unwrap_or(json!({"type": "object"})),
        })
        .collect();
    let web_search = apply_tool_limits(&mut tools, &mut notes);

    let mut system = request
        .system_instruction
        .as_ref()
        .map(|si| {
            si.parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let forced = matches!(
        request
            .tool_config
            .as_ref()
            .and_then(|c| c.get("function_calling_config").or_else(|| c.get("functionCallingConfig")))
            .and_then(|c| c.get("mode"))
            .and_then(|m| m.as_str()),
        Some("ANY")
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

    let session_id = session::session_key(None, &messages);

    Ok(GatewayRequest {
        protocol: Protocol::Gemini,
        model_requested: model_path.to_string(),
        model,
        system,
        messages,
        tools,
        web_search,
        stream,
        session_id,
        notes,
    })
}

/// Shape a complete upstream result as a `generateContent` response.
pub fn build_response(completion: &KiroCompletion, model_requested: &str) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    if !completion.text.is_empty() {
        parts.push(json!({"text": completion.text}));
    }
    for tool in &completion.tool_uses {
        parts.push(json!({
            "functionCall": { "name": tool.name, "args": tool.input }
        }));
    }

    let finish_reason = match completion.stop {
        StopKind::EndTurn | StopKind::ToolUse => "STOP",
    };

    json!({
        "candidates": [{
            "content": { "parts": parts, "role": "model" },
            "finishReason": finish_reason,
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": completion.input_tokens,
            "candidatesTokenCount": completion.output_tokens,
            "totalTokenCount": completion.input_tokens + completion.output_tokens,
        },
        "modelVersion": model_requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(body: Value) -> GeminiRequest {
        serde_json::from_value(body).expect("valid request")
    }

    #[test]
    fn minimal_request_translates() {
        let req = decode(json!({
            "contents": [{"role": "user", "parts": [{"text": "ping"}]}]
        }));
        let gw = translate_in(&req, "gemini-1.5-pro", false).expect("translate");
        assert_eq!(gw.model, "claude-sonnet-4.5");
        assert_eq!(gw.model_requested, "gemini-1.5-pro");
        assert_eq!(gw.messages[0].joined_text(), "ping");
    }

    #[test]
    fn model_role_maps_to_assistant_and_function_parts_pair_by_name() {
        let req = decode(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "weather in Oslo"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "get_weather", "response": {"temp": 4}}}]}
            ]
        }));
        let gw = translate_in(&req, "auto", false).expect("translate");

        assert_eq!(gw.messages[1].role, Role::Assistant);
        assert!(matches!(
            &gw.messages[1].parts[0],
            ContentPart::ToolUse { id, name, .. } if id == "get_weather" && name == "get_weather"
        ));
        assert!(matches!(
            &gw.messages[2].parts[0],
            ContentPart::ToolResult { tool_call_id, .. } if tool_call_id == "get_weather"
        ));
    }

    #[test]
    fn system_instruction_and_tools_translate() {
        let req = decode(json!({
            "contents": [{"role": "user", "parts": [{"text": "go"}]}],
            "systemInstruction": {"parts": [{"text": "be precise"}]},
            "tools": [{"functionDeclarations": [
                {"name": "f1", "description": "first", "parameters": {"type": "object"}}
            ]}]
        }));
        let gw = translate_in(&req, "gemini-1.5-pro", true).expect("translate");
        assert_eq!(gw.system, "be precise");
        assert_eq!(gw.tools.len(), 1);
        assert!(gw.stream);
    }

    #[test]
    fn tool_config_any_injects_instruction() {
        let req = decode(json!({
            "contents": [{"role": "user", "parts": [{"text": "go"}]}],
            "tools": [{"functionDeclarations": [{"name": "f1"}]}],
            "toolConfig": {"functionCallingConfig": {"mode": "ANY"}}
        }));
        let gw = translate_in(&req, "auto", false).expect("translate");
        assert!(gw.system.contains("must answer by calling"));
    }

    #[test]
    fn response_shape() {
        let completion = KiroCompletion {
            text: "cloudy".into(),
            tool_uses: Vec::new(),
            input_tokens: 8,
            output_tokens: 4,
            stop: StopKind::EndTurn,
        };
        let out = build_response(&completion, "gemini-1.5-pro");
        assert_eq!(out["candidates"][0]["content"]["parts"][0]["text"], "cloudy");
        assert_eq!(out["candidates"][0]["content"]["role"], "model");
        assert_eq!(out["candidates"][0]["finishReason"], "STOP");
        assert_eq!(out["usageMetadata"]["totalTokenCount"], 12);
    }
}
