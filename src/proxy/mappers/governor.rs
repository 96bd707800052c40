//! Long-context mitigation: size estimation, whole-turn truncation, summary
//! caching, and the stricter shrink applied after an upstream length error.

use std::collections::HashMap;
use std::time::Instant;

use crate::models::config::GovernorConfig;
use crate::proxy::mappers::normalizer::{ChatMessage, ContentPart, Role};

// Character budgets. The upstream counts tokens, but characters track close
// enough for a trip-wire and need no tokenizer.
pub const AUTO_COMPRESS_TRIGGER: usize = 120_000;
pub const SAFE_CHAR_LIMIT: usize = 100_000;
pub const PRE_ESTIMATE_TRIGGER: usize = 90_000;
pub const PRE_ESTIMATE_TARGET: usize = 80_000;
pub const SUMMARY_MAX_CHARS: usize = 3_000;
pub const SUMMARY_INPUT_CLAMP: usize = 15_000;
pub const SUMMARY_CACHE_TTL_SECS: u64 = 300;
pub const SUMMARY_CACHE_MAX_ENTRIES: usize = 64;

pub const SUMMARY_PROMPT: &str = "Summarize the key information in this conversation: \
the user's goals, important decisions and results, and the current working state. \
Keep everything needed to continue the conversation and stay under 3000 characters.";

fn part_chars(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => text.chars().count(),
        ContentPart::Image { data, .. } => data.len(),
        ContentPart::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
        ContentPart::ToolResult { content, .. } => content.chars().count(),
    }
}

pub fn message_chars(message: &ChatMessage) -> usize {
    message.parts.iter().map(part_chars).sum()
}

pub fn estimate_chars(messages: &[ChatMessage]) -> usize {
    messages.iter().map(message_chars).sum()
}

pub fn estimate_tokens(messages: &[ChatMessage]) -> u32 {
    (estimate_chars(messages) / 4).max(1) as u32
}

/// Drop the oldest turn pairs until the conversation fits the target.
/// Operates on a normalized conversation (alternating, ending on user), so
/// removing the two front messages keeps the shape intact. The final user
/// message is never dropped. Returns the dropped prefix, oldest first.
pub fn truncate_to(messages: &mut Vec<ChatMessage>, target_chars: usize) -> Vec<ChatMessage> {
    let mut dropped = Vec::new();
    while estimate_chars(messages) > target_chars && messages.len() > 2 {
        dropped.push(messages.remove(0));
        // The companion half of the turn pair, unless only the final user
        // message remains.
        if messages.len() > 1 {
            dropped.push(messages.remove(0));
        }
    }
    if !dropped.is_empty() {
        tracing::info!(
            "History truncated: dropped {} message(s), {} remain ({} chars)",
            dropped.len(),
            messages.len(),
            estimate_chars(messages)
        );
    }
    dropped
}

#[derive(Debug, Default)]
pub struct PreGovernOutcome {
    pub truncated: bool,
    pub dropped: Vec<ChatMessage>,
}

/// Pre-send strategies, tighter threshold first. Disabled strategies leave
/// the conversation untouched.
pub fn apply_pre(messages: &mut Vec<ChatMessage>, config: &GovernorConfig) -> PreGovernOutcome {
    let size = estimate_chars(messages);

    let target = if config.pre_estimate && size > PRE_ESTIMATE_TRIGGER {
        Some(PRE_ESTIMATE_TARGET)
    } else if config.auto_truncate && size > AUTO_COMPRESS_TRIGGER {
        Some(SAFE_CHAR_LIMIT)
    } else {
        None
    };

    match target {
        Some(target) => {
            let dropped = truncate_to(messages, target);
            PreGovernOutcome {
                truncated: !dropped.is_empty(),
                dropped,
            }
        }
        None => PreGovernOutcome::default(),
    }
}

/// Shrink target after an upstream length error; each retry tightens by 30%.
pub fn error_retry_target(retry: u32) -> usize {
    let mut target = SAFE_CHAR_LIMIT;
    for _ in 0..retry {
        target = target * 7 / 10;
    }
    target
}

/// Render the dropped prefix for the summarization call. Individual messages
/// are clamped so a single huge tool dump cannot eat the whole budget.
pub fn format_for_summary(dropped: &[ChatMessage]) -> String {
    let mut lines = Vec::with_capacity(dropped.len());
    for msg in dropped {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        let mut content = msg.joined_text();
        if content.chars().count() > 800 {
            content = content.chars().take(800).collect::<String>() + "...";
        }
        lines.push(format!("[{}]: {}", role, content));
    }
    let mut out = lines.join("\n");
    if out.chars().count() > SUMMARY_INPUT_CLAMP {
        out = out.chars().take(SUMMARY_INPUT_CLAMP).collect::<String>() + "\n...(truncated)";
    }
    out
}

/// The system-prefix note a generated summary becomes.
pub fn summary_note(summary: &str) -> String {
    let mut summary = summary.trim().to_string();
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS).collect::<String>() + "...";
    }
    format!("[Earlier conversation summary]\n{}", summary)
}

struct SummaryCacheEntry {
    summary: String,
    prefix_hash: u64,
    updated_at: Instant,
}

/// Per-session summary cache so repeated turns of one long conversation do
/// not re-summarize an unchanged prefix.
pub struct SummaryCache {
    entries: parking_lot::Mutex<HashMap<String, SummaryCacheEntry>>,
}

pub fn prefix_hash(dropped: &[ChatMessage]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    dropped.len().hash(&mut hasher);
    estimate_chars(dropped).hash(&mut hasher);
    hasher.finish()
}

impl SummaryCache {
    pub fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_key: &str, prefix_hash: u64) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.get(session_key)?;
        if entry.updated_at.elapsed().as_secs() > SUMMARY_CACHE_TTL_SECS {
            entries.remove(session_key);
            return None;
        }
        if entry.prefix_hash != prefix_hash {
            return None;
        }
        Some(entry.summary.clone())
    }

    pub fn put(&self, session_key: &str, prefix_hash: u64, summary: String) {
        let mut entries = self.entries.lock();
        if entries.len() >= SUMMARY_CACHE_MAX_ENTRIES && !entries.contains_key(session_key) {
            // Evict the stalest entry.
            if let Some(oldest) = entries
                .iter()
                .max_by_key(|(_, e)| e.updated_at.elapsed())
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            session_key.to_string(),
            SummaryCacheEntry {
                summary,
                prefix_hash,
                updated_at: Instant::now(),
            },
        );
    }
}

impl Default for SummaryCache {
    fn default() -> Self {
        Self::new()
    }
}
