//! Kiro wire payloads: conversation assembly toward the upstream and
//! accumulation of its event stream back into a complete completion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::mappers::normalizer::{ChatMessage, ContentPart, Role};
use crate::proxy::mappers::{GatewayRequest, ToolDefinition};
use crate::proxy::upstream::stream::KiroStreamEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<KiroImage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<KiroToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<KiroToolResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolSpec {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub content: Vec<KiroTextContent>,
    pub status: String,
    pub tool_use_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroTextContent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImage {
    pub format: String,
    pub source: KiroImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImageSource {
    pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<KiroToolUse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub name: String,
    pub input: Value,
    pub tool_use_id: String,
}

/// History entries serialize externally tagged, which is exactly the
/// `{"userInputMessage": …}` / `{"assistantResponseMessage": …}` shape the
/// upstream expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KiroHistoryEntry {
    #[serde(rename = "userInputMessage")]
    UserInput(UserInputMessage),
    #[serde(rename = "assistantResponseMessage")]
    AssistantResponse(AssistantResponseMessage),
}

pub const CHAT_TRIGGER_TYPE: &str = "MANUAL";
pub const API_ORIGIN: &str = "AI_EDITOR";

fn media_type_to_format(media_type: &str) -> String {
    media_type
        .strip_prefix("image/")
        .unwrap_or(media_type)
        .to_string()
}

fn extract_images(msg: &ChatMessage) -> Option<Vec<KiroImage>> {
    let images: Vec<KiroImage> = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Image { media_type, data } => Some(KiroImage {
                format: media_type_to_format(media_type),
                source: KiroImageSource { bytes: data.clone() },
            }),
            _ => None,
        })
        .collect();
    if images.is_empty() {
        None
    } else {
        Some(images)
    }
}

fn extract_tool_results(msg: &ChatMessage) -> Option<Vec<KiroToolResult>> {
    let results: Vec<KiroToolResult> = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => Some(KiroToolResult {
                content: vec![KiroTextContent {
                    text: content.clone(),
                }],
                status: if *is_error { "error" } else { "success" }.to_string(),
                tool_use_id: tool_call_id.clone(),
            }),
            _ => None,
        })
        .collect();
    if results.is_empty() {
        None
    } else {
        Some(results)
    }
}

fn extract_tool_uses(msg: &ChatMessage) -> Option<Vec<KiroToolUse>> {
    let uses: Vec<KiroToolUse> = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolUse { id, name, input } => Some(KiroToolUse {
                name: name.clone(),
                input: input.clone(),
                tool_use_id: id.clone(),
            }),
            _ => None,
        })
        .collect();
    if uses.is_empty() {
        None
    } else {
        Some(uses)
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<KiroToolSpec> {
    tools
        .iter()
        .map(|t| KiroToolSpec {
            tool_specification: ToolSpecification {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: InputSchema {
                    json: t.input_schema.clone(),
                },
            },
        })
        .collect()
}

fn user_entry(
    msg: &ChatMessage,
    model_id: &str,
    system_prefix: Option<&str>,
) -> UserInputMessage {
    let mut content = msg.joined_text();
    if let Some(prefix) = system_prefix {
        if !prefix.is_empty() {
            content = if content.trim().is_empty() {
                prefix.to_string()
            } else {
                format!("{}\n\n{}", prefix, content)
            };
        }
    }

    let tool_results = extract_tool_results(msg);
    let context = tool_results.map(|results| UserInputMessageContext {
        tools: None,
        tool_results: Some(results),
    });

    UserInputMessage {
        content,
        model_id: model_id.to_string(),
        origin: API_ORIGIN.to_string(),
        images: extract_images(msg),
        user_input_message_context: context,
    }
}

/// Assemble the `generateAssistantResponse` payload. The conversation must
/// already be normalized: strictly alternating and ending with a user turn.
/// That last user turn becomes `currentMessage`; everything before it is
/// history. The system prefix rides on the first outgoing user message, and
/// the tool list on the current one.
pub fn build_payload(
    request: &GatewayRequest,
    messages: &[ChatMessage],
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> Value {
    let model_id = request.model.as_str();
    let split = messages.len().saturating_sub(1);
    let (history_msgs, current_slice) = messages.split_at(split);

    let mut history: Vec<KiroHistoryEntry> = Vec::with_capacity(history_msgs.len());
    for (idx, msg) in history_msgs.iter().enumerate() {
        match msg.role {
            Role::User => {
                let prefix = if idx == 0 { Some(request.system.as_str()) } else { None };
                history.push(KiroHistoryEntry::UserInput(user_entry(msg, model_id, prefix)));
            }
            Role::Assistant => {
                history.push(KiroHistoryEntry::AssistantResponse(AssistantResponseMessage {
                    content: msg.joined_text(),
                    tool_uses: extract_tool_uses(msg),
                }));
            }
            // Normalization leaves no other roles behind.
            _ => {}
        }
    }

    let current_prefix = if history_msgs.is_empty() {
        Some(request.system.as_str())
    } else {
        None
    };
    let mut current = current_slice
        .first()
        .map(|m| user_entry(m, model_id, current_prefix))
        .unwrap_or(UserInputMessage {
            content: crate::proxy::mappers::normalizer::USER_PLACEHOLDER.to_string(),
            model_id: model_id.to_string(),
            origin: API_ORIGIN.to_string(),
            images: None,
            user_input_message_context: None,
        });

    if !request.tools.is_empty() {
        let specs = convert_tools(&request.tools);
        match &mut current.user_input_message_context {
            Some(ctx) => ctx.tools = Some(specs),
            None => {
                current.user_input_message_context = Some(UserInputMessageContext {
                    tools: Some(specs),
                    tool_results: None,
                });
            }
        }
    }

    let mut payload = serde_json::json!({
        "conversationState": {
            "chatTriggerType": CHAT_TRIGGER_TYPE,
            "conversationId": conversation_id,
            "currentMessage": { "userInputMessage": current },
        }
    });

    if !history.is_empty() {
        payload["conversationState"]["history"] =
            serde_json::to_value(&history).unwrap_or(Value::Null);
    }
    if let Some(arn) = profile_arn {
        payload["profileArn"] = Value::String(arn.to_string());
    }

    payload
}

// ---------------------------------------------------------------------------
// Stream accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopKind {
    EndTurn,
    ToolUse,
}

#[derive(Debug, Clone)]
pub struct CompletedToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A fully accumulated upstream response, protocol-agnostic.
#[derive(Debug, Clone)]
pub struct KiroCompletion {
    pub text: String,
    pub tool_uses: Vec<CompletedToolUse>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop: StopKind,
}

struct PendingTool {
    id: String,
    name: String,
    input_json: String,
}

/// Accumulates Kiro stream events into a complete completion. Also used by
/// the streaming translators to track tool state across deltas.
pub struct ResponseAccumulator {
    text: String,
    tool_uses: Vec<CompletedToolUse>,
    current_tool: Option<PendingTool>,
    input_tokens: u32,
    output_tokens: u32,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            tool_uses: Vec::new(),
            current_tool: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn process(&mut self, event: &KiroStreamEvent) {
        match event {
            KiroStreamEvent::Content(text) => {
                self.text.push_str(text);
            }
            KiroStreamEvent::ToolStart {
                name,
                tool_use_id,
                input,
            } => {
                self.finish_tool();
                let id = if tool_use_id.is_empty() {
                    format!("toolu_{}", uuid::Uuid::new_v4().simple())
                } else {
                    tool_use_id.clone()
                };
                self.current_tool = Some(PendingTool {
                    id,
                    name: name.clone(),
                    input_json: input.clone(),
                });
            }
            KiroStreamEvent::ToolInput(partial) => {
                if let Some(tool) = &mut self.current_tool {
                    tool.input_json.push_str(partial);
                }
            }
            KiroStreamEvent::ToolStop => {
                self.finish_tool();
            }
            KiroStreamEvent::Usage(usage) => {
                if let Some(v) = usage.get("inputTokenCount").and_then(|v| v.as_u64()) {
                    self.input_tokens = v as u32;
                }
                if let Some(v) = usage.get("outputTokenCount").and_then(|v| v.as_u64()) {
                    self.output_tokens = v as u32;
                }
            }
            KiroStreamEvent::ContextUsage(_) => {}
        }
    }

    fn finish_tool(&mut self) {
        if let Some(tool) = self.current_tool.take() {
            let input: Value = serde_json::from_str(&tool.input_json)
                .unwrap_or(Value::Object(serde_json::Map::new()));
            self.tool_uses.push(CompletedToolUse {
                id: tool.id,
                name: tool.name,
                input,
            });
        }
    }

    pub fn finish(mut self) -> KiroCompletion {
        self.finish_tool();
        let stop = if self.tool_uses.is_empty() {
            StopKind::EndTurn
        } else {
            StopKind::ToolUse
        };
        // Token counts are estimated when the stream carried no usage event.
        let output_tokens = if self.output_tokens == 0 {
            (self.text.len() / 4).max(1) as u32
        } else {
            self.output_tokens
        };
        KiroCompletion {
            text: self.text,
            tool_uses: self.tool_uses,
            input_tokens: self.input_tokens,
            output_tokens,
            stop,
        }
    }
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
