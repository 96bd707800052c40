/// Model ids the upstream accepts directly.
pub const KIRO_MODELS: &[&str] = &[
    "auto",
    "claude-sonnet-4",
    "claude-sonnet-4.5",
    "claude-haiku-4.5",
    "claude-opus-4.5",
    "claude-3.7-sonnet",
];

pub const FALLBACK_MODEL: &str = "claude-sonnet-4";

/// Client-protocol aliases. Unknown names fall back to the default model and
/// the caller records a warning note on the flow.
const ALIASES: &[(&str, &str)] = &[
    ("gpt-4o", "claude-sonnet-4"),
    ("gpt-4", "claude-sonnet-4"),
    ("sonnet", "claude-sonnet-4"),
    ("gemini-1.5-pro", "claude-sonnet-4.5"),
    ("gpt-4o-mini", "claude-haiku-4.5"),
    ("gpt-3.5-turbo", "claude-haiku-4.5"),
    ("haiku", "claude-haiku-4.5"),
    ("o1", "claude-opus-4.5"),
    ("o1-preview", "claude-opus-4.5"),
    ("opus", "claude-opus-4.5"),
];

/// Resolve a requested model name to the upstream model id. Returns the id
/// plus a note when the name was unknown and fell back.
pub fn map_model(requested: &str) -> (String, Option<String>) {
    if KIRO_MODELS.contains(&requested) {
        return (requested.to_string(), None);
    }
    if let Some((_, target)) = ALIASES.iter().find(|(alias, _)| *alias == requested) {
        return (target.to_string(), None);
    }
    (
        FALLBACK_MODEL.to_string(),
        Some(format!(
            "unknown model '{}' mapped to {}",
            requested, FALLBACK_MODEL
        )),
    )
}

/// Names advertised on the model-listing endpoints: the upstream ids plus
/// the aliases clients are expected to send.
pub fn advertised_models() -> Vec<&'static str> {
    let mut out: Vec<&'static str> = KIRO_MODELS.to_vec();
    out.extend(ALIASES.iter().map(|(alias, _)| *alias));
    out
}
