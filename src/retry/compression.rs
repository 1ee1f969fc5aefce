//! Context-compression ladder: three escalating levels applied when
//! upstream reports a `ValidationException` (typically "context too
//! long"), each retaining fewer trailing messages and summarizing or
//! truncating the rest.

use crate::providers::{ContentPart, NormalizedMessage, Role};

/// `N = max(2, 6 - 2*level)`: how many trailing messages survive untouched
/// (aside from truncation) at a given compression level.
fn keep_last_count(level: u8) -> usize {
    (6 - 2 * level as i32).max(2) as usize
}

/// `max(500, 2000 - 500*level)`: the per-message character budget at a
/// given compression level.
fn char_budget(level: u8) -> usize {
    (2000 - 500 * level as i32).max(500) as usize
}

/// Applies one compression pass. Returns `None` if the pass would not
/// reduce the message count — the caller should stop climbing the ladder.
pub fn compress_one_level(messages: &[NormalizedMessage], level: u8) -> Option<Vec<NormalizedMessage>> {
    if messages.len() < 2 {
        let truncated: Vec<_> = messages.iter().map(|m| truncate_message(m, level)).collect();
        return if truncated.len() < messages.len() { Some(truncated) } else { None };
    }

    let keep_last = keep_last_count(level).min(messages.len() - 1).max(1);
    let last_start = (messages.len() - keep_last).max(1);

    let mut result = Vec::with_capacity(messages.len());
    result.push(truncate_message(&messages[0], level));

    let middle = &messages[1..last_start];
    if !middle.is_empty() {
        if level <= 1 {
            result.extend(middle.iter().map(excerpt_message));
        } else {
            result.push(stub_message(middle.len()));
        }
    }

    result.extend(messages[last_start..].iter().map(|m| truncate_message(m, level)));

    if result.len() < messages.len() {
        Some(result)
    } else {
        None
    }
}

fn truncate_message(message: &NormalizedMessage, level: u8) -> NormalizedMessage {
    let budget = char_budget(level);
    let content = message
        .content
        .iter()
        .map(|part| truncate_part(part, budget))
        .collect();
    NormalizedMessage { role: message.role, content }
}

fn truncate_part(part: &ContentPart, budget: usize) -> ContentPart {
    match part {
        ContentPart::Text(text) => ContentPart::Text(truncate_text(text, budget)),
        ContentPart::ToolResult { tool_use_id, content, is_error } => ContentPart::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: truncate_text(content, budget),
            is_error: *is_error,
        },
        other => other.clone(),
    }
}

fn truncate_text(text: &str, budget: usize) -> String {
    let len = text.chars().count();
    if len <= budget {
        return text.to_string();
    }
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}\n[truncated, orig={len}]")
}

/// Level-1 "short excerpt" treatment for a middle message: the first 150
/// characters, role preserved so the turn sequence still reads naturally.
fn excerpt_message(message: &NormalizedMessage) -> NormalizedMessage {
    const EXCERPT_CHARS: usize = 150;
    let content = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => ContentPart::Text(truncate_text(text, EXCERPT_CHARS)),
            other => other.clone(),
        })
        .collect();
    NormalizedMessage { role: message.role, content }
}

/// Level 2-3 "stub" replacement for a whole middle block.
fn stub_message(count: usize) -> NormalizedMessage {
    NormalizedMessage {
        role: Role::User,
        content: vec![ContentPart::Text(format!("[history compressed, {count} messages]"))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_msg(role: Role, text: &str) -> NormalizedMessage {
        NormalizedMessage { role, content: vec![ContentPart::Text(text.to_string())] }
    }

    fn long_history(n: usize) -> Vec<NormalizedMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                text_msg(role, &format!("message number {i}"))
            })
            .collect()
    }

    #[test]
    fn level_one_keeps_excerpts_of_middle() {
        let messages = long_history(10);
        let compressed = compress_one_level(&messages, 1).unwrap();
        assert!(compressed.len() < messages.len());
    }

    #[test]
    fn level_two_replaces_middle_with_stub() {
        let messages = long_history(10);
        let compressed = compress_one_level(&messages, 2).unwrap();
        let has_stub = compressed.iter().any(|m| {
            matches!(&m.content[0], ContentPart::Text(text) if text.starts_with("[history compressed,"))
        });
        assert!(has_stub);
    }

    #[test]
    fn truncates_long_messages_with_footer() {
        let long_text = "x".repeat(3000);
        let messages = vec![text_msg(Role::User, &long_text), text_msg(Role::Assistant, "short"), text_msg(Role::User, "short2")];
        let compressed = compress_one_level(&messages, 3).unwrap();
        match &compressed[0].content[0] {
            ContentPart::Text(text) => assert!(text.contains("[truncated, orig=3000]")),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn halts_when_pass_does_not_reduce_count() {
        let messages = vec![text_msg(Role::User, "only one turn that's already short")];
        assert!(compress_one_level(&messages, 1).is_none());
    }

    #[test]
    fn keep_last_count_follows_formula() {
        assert_eq!(keep_last_count(1), 4);
        assert_eq!(keep_last_count(2), 2);
        assert_eq!(keep_last_count(3), 2);
    }

    #[test]
    fn char_budget_follows_formula() {
        assert_eq!(char_budget(1), 1500);
        assert_eq!(char_budget(2), 1000);
        assert_eq!(char_budget(3), 500);
    }
}
