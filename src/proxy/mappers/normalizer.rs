use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub const USER_PLACEHOLDER: &str = " ";
pub const ASSISTANT_PLACEHOLDER: &str = "…";

/// Repair an arbitrary client conversation into the strict shape the
/// upstream accepts: leading system content extracted, every `tool` message
/// folded into a user message as tool results, strict user/assistant
/// alternation starting and ending with `user`. Content is never dropped.
///
/// The function is pure; feeding its message output back in returns the
/// same messages with an empty system prefix.
pub fn normalize(messages: &[ChatMessage]) -> (String, Vec<ChatMessage>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut repaired: Vec<ChatMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                // Leading system content becomes the system prefix. A system
                // message appearing mid-conversation degrades to user text so
                // its content survives.
                if repaired.is_empty() {
                    let text = msg.joined_text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                } else {
                    repaired.push(ChatMessage {
                        role: Role::User,
                        parts: msg.parts.clone(),
                    });
                }
            }
            Role::Tool => {
                let results: Vec<ContentPart> = msg
                    .parts
                    .iter()
                    .filter(|p| matches!(p, ContentPart::ToolResult { .. }))
                    .cloned()
                    .collect();
                fold_tool_results(&mut repaired, results);
            }
            Role::User => {
                // A user message consisting only of tool results folds into
                // an adjacent user message the same way a tool message would;
                // ordinary user turns keep their own message and alternation
                // is repaired with placeholders below.
                let all_results = !msg.parts.is_empty()
                    && msg
                        .parts
                        .iter()
                        .all(|p| matches!(p, ContentPart::ToolResult { .. }));
                if all_results {
                    fold_tool_results(&mut repaired, msg.parts.clone());
                    continue;
                }
                repaired.push(msg.clone());
                dedupe_tool_results(repaired.last_mut().unwrap());
            }
            Role::Assistant => {
                repaired.push(msg.clone());
            }
        }
    }

    // Restore alternation with minimal placeholders.
    let mut i = 1;
    while i < repaired.len() {
        if repaired[i].role == repaired[i - 1].role {
            let filler = match repaired[i].role {
                Role::User => ChatMessage::text(Role::Assistant, ASSISTANT_PLACEHOLDER),
                _ => ChatMessage::text(Role::User, USER_PLACEHOLDER),
            };
            repaired.insert(i, filler);
            i += 2;
        } else {
            i += 1;
        }
    }

    if repaired.first().map(|m| m.role) != Some(Role::User) {
        repaired.insert(0, ChatMessage::text(Role::User, USER_PLACEHOLDER));
    }
    if repaired.last().map(|m| m.role) == Some(Role::Assistant) {
        repaired.push(ChatMessage::text(Role::User, USER_PLACEHOLDER));
    }

    (system_parts.join("\n\n"), repaired)
}

/// Append tool results to the preceding user message when there is one,
/// otherwise open a new user message for them.
fn fold_tool_results(repaired: &mut Vec<ChatMessage>, results: Vec<ContentPart>) {
    if results.is_empty() {
        return;
    }
    match repaired.last_mut() {
        Some(last) if last.role == Role::User => {
            merge_into_user(last, results);
        }
        _ => {
            let mut msg = ChatMessage {
                role: Role::User,
                parts: results,
            };
            dedupe_tool_results(&mut msg);
            repaired.push(msg);
        }
    }
}

fn merge_into_user(target: &mut ChatMessage, parts: Vec<ContentPart>) {
    target.parts.extend(parts);
    dedupe_tool_results(target);
}

/// Within one user message the last tool result per `tool_call_id` wins.
fn dedupe_tool_results(msg: &mut ChatMessage) {
    let mut seen_last: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for (idx, part) in msg.parts.iter().enumerate() {
        if let ContentPart::ToolResult { tool_call_id, .. } = part {
            seen_last.insert(tool_call_id.clone(), idx);
        }
    }
    if seen_last.is_empty() {
        return;
    }
    let mut idx = 0;
    msg.parts.retain(|part| {
        let keep = match part {
            ContentPart::ToolResult { tool_call_id, .. } => seen_last[tool_call_id] == idx,
            _ => true,
        };
        idx += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::text(Role::User, text)
    }

    fn assistant(text: &str) -> ChatMessage {
        ChatMessage::text(Role::Assistant, text)
    }

    fn tool_result(id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::Tool,
            parts: vec![ContentPart::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
                is_error: false,
            }],
        }
    }

    fn roles(messages: &[ChatMessage]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    fn assert_alternating(messages: &[ChatMessage]) {
        assert_eq!(messages.first().map(|m| m.role), Some(Role::User));
        assert_eq!(messages.last().map(|m| m.role), Some(Role::User));
        for pair in messages.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }

    #[test]
    fn double_user_gets_assistant_filler() {
        let (_, out) = normalize(&[user("a"), assistant("b"), user("c"), user("d")]);
        assert_alternating(&out);
        assert_eq!(
            roles(&out),
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(out[3].joined_text(), ASSISTANT_PLACEHOLDER);
    }

    #[test]
    fn three_consecutive_user_messages_stay_alternating() {
        let (_, out) = normalize(&[user("a"), user("b"), user("c")]);
        assert_alternating(&out);
        let text: Vec<String> = out.iter().map(|m| m.joined_text()).collect();
        // No content dropped.
        assert!(text.concat().contains('a'));
        assert!(text.concat().contains('b'));
        assert!(text.concat().contains('c'));
    }

    #[test]
    fn leading_system_is_extracted() {
        let sys = ChatMessage::text(Role::System, "be brief");
        let (system, out) = normalize(&[sys, user("hi")]);
        assert_eq!(system, "be brief");
        assert_eq!(roles(&out), vec![Role::User]);
        assert_eq!(out[0].joined_text(), "hi");
    }

    #[test]
    fn single_assistant_message_gets_wrapped() {
        let (_, out) = normalize(&[assistant("hello")]);
        assert_alternating(&out);
        assert_eq!(roles(&out), vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(out[0].joined_text(), USER_PLACEHOLDER);
        assert_eq!(out[2].joined_text(), USER_PLACEHOLDER);
    }

    #[test]
    fn conversation_beginning_with_tool_role() {
        let (_, out) = normalize(&[tool_result("x", "r"), assistant("c")]);
        assert_alternating(&out);
        assert!(matches!(out[0].parts[0], ContentPart::ToolResult { .. }));
    }

    #[test]
    fn tool_folds_into_adjacent_user_and_trailing_assistant_gets_closed() {
        // user a | user b | tool(x) r | assistant c
        let input = vec![user("a"), user("b"), tool_result("x", "r"), assistant("c")];
        let (_, out) = normalize(&input);

        assert_alternating(&out);
        assert_eq!(
            roles(&out),
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(out[1].joined_text(), ASSISTANT_PLACEHOLDER);
        // The tool result was folded into user "b".
        assert_eq!(out[2].joined_text(), "b");
        assert!(out[2].parts.iter().any(
            |p| matches!(p, ContentPart::ToolResult { tool_call_id, content, .. } if tool_call_id == "x" && content == "r")
        ));
        assert_eq!(out[3].joined_text(), "c");
        assert_eq!(out[4].joined_text(), USER_PLACEHOLDER);
    }

    #[test]
    fn duplicate_tool_results_last_occurrence_wins() {
        let input = vec![
            assistant("calling"),
            tool_result("x", "stale"),
            tool_result("x", "fresh"),
            tool_result("y", "other"),
        ];
        let (_, out) = normalize(&input);

        let results: Vec<(&str, &str)> = out
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => Some((tool_call_id.as_str(), content.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec![("x", "fresh"), ("y", "other")]);
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = vec![
            vec![user("a"), user("b"), tool_result("x", "r"), assistant("c")],
            vec![assistant("only")],
            vec![
                ChatMessage::text(Role::System, "sys"),
                user("q"),
                assistant("a1"),
                assistant("a2"),
            ],
            vec![
                user("q"),
                ChatMessage {
                    role: Role::Assistant,
                    parts: vec![ContentPart::ToolUse {
                        id: "t1".into(),
                        name: "lookup".into(),
                        input: json!({"q": 1}),
                    }],
                },
                tool_result("t1", "result"),
            ],
        ];

        for input in inputs {
            let (_, once) = normalize(&input);
            let (system_again, twice) = normalize(&once);
            assert_eq!(system_again, "");
            assert_eq!(once, twice);
        }
    }
}
