pub mod claude;
pub mod gemini;
pub mod governor;
pub mod kiro;
pub mod model_mapping;
pub mod normalizer;
pub mod openai;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
            Protocol::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A decoded client request after protocol translation, before history
/// normalization and governing.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub protocol: Protocol,
    pub model_requested: String,
    pub model: String,
    pub system: String,
    pub messages: Vec<normalizer::ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub web_search: bool,
    pub stream: bool,
    pub session_id: String,
    pub notes: Vec<String>,
}

/// Enforce the tool-surface limits: at most 50 tools, descriptions capped at
/// 500 characters with an ellipsis marker. Oversize input is trimmed, never
/// rejected. The reserved `web_search` name is lifted out of the list and
/// reported back as the native capability flag.
pub fn apply_tool_limits(tools: &mut Vec<ToolDefinition>, notes: &mut Vec<String>) -> bool {
    let before = tools.len();
    let mut web_search = false;
    tools.retain(|t| {
        if t.name == crate::constants::WEB_SEARCH_TOOL_NAME {
            web_search = true;
            false
        } else {
            true
        }
    });

    if tools.len() > crate::constants::MAX_TOOLS_PER_REQUEST {
        notes.push(format!(
            "tool list truncated from {} to {}",
            before,
            crate::constants::MAX_TOOLS_PER_REQUEST
        ));
        tools.truncate(crate::constants::MAX_TOOLS_PER_REQUEST);
    }

    for tool in tools.iter_mut() {
        let max = crate::constants::MAX_TOOL_DESCRIPTION_CHARS;
        if tool.description.chars().count() > max {
            tool.description = tool.description.chars().take(max).collect::<String>() + "…";
            notes.push(format!("description truncated for tool '{}'", tool.name));
        }
    }

    web_search
}
