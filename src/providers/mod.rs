//! Upstream adapters: one per backend wire format. Each adapter knows its
//! own URL template, auth header shape, model-id mapping, and request body
//! schema; it hands back a [`BuiltRequest`] the gateway sends as-is.
//!
//! `build_request(credential, normalized_messages, model, options) ->
//! (url, headers, body, stream_format)` is the shared entry point; each
//! submodule implements it for one wire format.

pub mod anthropic_style;
pub mod gemini;
pub mod kiro;
pub mod model_alias;
pub mod vertex_claude;

use serde_json::Value;

use crate::store::{Credential, Provider};
use crate::stream::StreamFormat;

/// One turn of conversation, already role-normalized to `user`/`assistant`.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Everything an adapter needs to build one outbound request. Already
/// merged (system prompt folded into the first user message where the
/// target wire format needs that) by the caller before dispatch.
#[derive(Debug, Clone)]
pub struct ChatRequestContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<NormalizedMessage>,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub stream: bool,
}

pub struct BuiltRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub stream_format: StreamFormat,
}

pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn build_request(
        &self,
        credential: &Credential,
        access_token: &str,
        ctx: &ChatRequestContext,
    ) -> anyhow::Result<BuiltRequest>;
}

/// Merges adjacent same-role messages by joining their text parts with a
/// newline, as CodeWhisperer's `history` requires. Tool-use and
/// tool-result parts are carried along unmodified, attached to the merged
/// turn they originated in.
pub fn merge_adjacent_same_role(messages: &[NormalizedMessage]) -> Vec<NormalizedMessage> {
    let mut merged: Vec<NormalizedMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                if let (Some(ContentPart::Text(prev_text)), Some(ContentPart::Text(next_text))) =
                    (prev.content.first_mut(), msg.content.first())
                {
                    prev_text.push('\n');
                    prev_text.push_str(next_text);
                    prev.content.extend(msg.content.iter().skip(1).cloned());
                } else {
                    prev.content.extend(msg.content.iter().cloned());
                }
            }
            _ => merged.push(msg.clone()),
        }
    }
    merged
}

/// Flattens a message's text parts for adapters that only carry plain text
/// (e.g. Gemini's `parts:[{text}]`).
pub fn flatten_text(content: &[ContentPart]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text(text) => Some(text.clone()),
            ContentPart::ToolResult { content, .. } => Some(content.clone()),
            ContentPart::ToolUse { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Returns the adapter for a provider. `Vertex` means the Claude-via-Vertex
/// path; Gemini models served from Vertex AI
/// are still `Provider::Gemini` credentials, distinguished internally by
/// `aux.project_id` being set (see [`gemini::GeminiAdapter`]).
pub fn adapter_for(provider: Provider) -> Box<dyn ProviderAdapter> {
    match provider {
        Provider::Kiro => Box::new(kiro::KiroAdapter::new()),
        Provider::Vertex => Box::new(vertex_claude::VertexClaudeAdapter::new()),
        Provider::Gemini => Box::new(gemini::GeminiAdapter::new()),
        Provider::Anthropic | Provider::Bedrock | Provider::Warp | Provider::Orchids => {
            Box::new(anthropic_style::AnthropicStyleAdapter::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_msg(role: Role, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            role,
            content: vec![ContentPart::Text(text.to_string())],
        }
    }

    #[test]
    fn merges_adjacent_same_role_with_newline() {
        let messages = vec![
            text_msg(Role::User, "first"),
            text_msg(Role::User, "second"),
            text_msg(Role::Assistant, "reply"),
        ];
        let merged = merge_adjacent_same_role(&messages);
        assert_eq!(merged.len(), 2);
        match &merged[0].content[0] {
            ContentPart::Text(text) => assert_eq!(text, "first\nsecond"),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn flatten_text_joins_text_and_tool_results() {
        let content = vec![
            ContentPart::Text("a".to_string()),
            ContentPart::ToolResult {
                tool_use_id: "t1".to_string(),
                content: "b".to_string(),
                is_error: false,
            },
        ];
        assert_eq!(flatten_text(&content), "a\nb");
    }
}
