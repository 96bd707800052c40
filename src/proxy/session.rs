use sha2::{Digest, Sha256};

use crate::proxy::mappers::normalizer::{ChatMessage, Role};

/// Derive a stable session key for sticky account routing.
///
/// Priority: an explicit client-supplied key (Anthropic `metadata.user_id`),
/// else a SHA-256 fingerprint of the first substantial user message. Hashing
/// only the conversation opener keeps every turn of one conversation on the
/// same key.
pub fn session_key(explicit: Option<&str>, messages: &[ChatMessage]) -> String {
    if let Some(key) = explicit {
        if !key.is_empty() && !key.contains("session-") {
            tracing::debug!("Using explicit session key: {}", key);
            return key.to_string();
        }
    }

    let mut hasher = Sha256::new();
    let mut content_found = false;

    for msg in messages {
        if msg.role != Role::User {
            continue;
        }
        let text = msg.joined_text();
        let clean = text.trim();
        // Skip probe-sized messages and injected reminders; they vary per
        // turn and would break stickiness.
        if clean.len() > 10 && !clean.contains("<system-reminder>") {
            hasher.update(clean.as_bytes());
            content_found = true;
            break;
        }
    }

    if !content_found {
        if let Some(last) = messages.last() {
            hasher.update(last.joined_text().as_bytes());
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hash[..16])
}
