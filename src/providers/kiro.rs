//! CodeWhisperer (Kiro) adapter.
//!
//! URL and header set are grounded directly on `kiro-provider.rs`'s
//! `base_url_for`/`build_headers`: the `x-amzn-codewhisperer-optout`,
//! `x-amzn-kiro-agent-mode`, and `amz-sdk-*` headers, the `Connection: close`
//! behavior, and the `q.<region>.amazonaws.com` host template are kept
//! verbatim. The `conversationState` tree shape (`chatTriggerType`,
//! `conversationId`, alternating `history`, `currentMessage`) is built per
//! its message shaping and streaming framing.

use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    merge_adjacent_same_role, BuiltRequest, ChatRequestContext, ContentPart, ProviderAdapter, Role,
};
use crate::store::{Credential, Provider};
use crate::stream::StreamFormat;

const DEFAULT_REGION: &str = "us-east-1";

pub struct KiroAdapter;

impl Default for KiroAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl KiroAdapter {
    pub fn new() -> Self {
        Self
    }

    fn region_for(&self, credential: &Credential) -> String {
        credential
            .aux
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    fn base_domain(&self, region: &str) -> String {
        format!("q.{region}.amazonaws.com")
    }
}

impl ProviderAdapter for KiroAdapter {
    fn provider(&self) -> Provider {
        Provider::Kiro
    }

    fn build_request(
        &self,
        credential: &Credential,
        access_token: &str,
        ctx: &ChatRequestContext,
    ) -> anyhow::Result<BuiltRequest> {
        let region = self.region_for(credential);
        let domain = self.base_domain(&region);
        let url = format!("https://{domain}/generateAssistantResponse");

        let body = build_conversation_state(ctx);

        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("x-amzn-codewhisperer-optout".to_string(), "true".to_string()),
            ("x-amzn-kiro-agent-mode".to_string(), "vibe".to_string()),
            (
                "x-amz-user-agent".to_string(),
                "aws-sdk-js/1.0.27 KiroIDE-gateway".to_string(),
            ),
            (
                "user-agent".to_string(),
                "aws-sdk-js/1.0.27 ua/2.1 api/codewhispererstreaming#1.0.27 m/E KiroIDE-gateway"
                    .to_string(),
            ),
            ("host".to_string(), domain),
            (
                "amz-sdk-invocation-id".to_string(),
                Uuid::new_v4().to_string(),
            ),
            ("amz-sdk-request".to_string(), "attempt=1; max=3".to_string()),
            ("authorization".to_string(), format!("Bearer {access_token}")),
            ("connection".to_string(), "close".to_string()),
        ];

        Ok(BuiltRequest {
            url,
            headers,
            body,
            stream_format: StreamFormat::AwsEventStream,
        })
    }
}

/// Builds the `conversationState` tree: a `history` of alternating
/// `userInputMessage`/`assistantResponseMessage` entries plus a
/// `currentMessage` holding the last turn. The system prompt is merged
/// into the first user message's text.
pub(crate) fn build_conversation_state(ctx: &ChatRequestContext) -> Value {
    let merged = merge_adjacent_same_role(&ctx.messages);

    let mut history = Vec::new();
    let mut iter = merged.iter().peekable();
    let mut first_user_seen = false;

    let mut turns: Vec<Value> = Vec::new();
    while let Some(message) = iter.next() {
        let mut text = super::flatten_text(&message.content);
        if !first_user_seen && message.role == Role::User {
            if let Some(system) = &ctx.system_prompt {
                text = format!("{system}\n\n{text}");
            }
            first_user_seen = true;
        }
        let entry = match message.role {
            Role::User => json!({
                "userInputMessage": {
                    "content": text,
                    "modelId": ctx.model,
                    "userInputMessageContext": user_input_context(ctx),
                }
            }),
            Role::Assistant => json!({
                "assistantResponseMessage": {
                    "content": text,
                    "toolUses": tool_uses(message),
                }
            }),
        };
        turns.push(entry);
    }

    let current_message = turns.pop().unwrap_or_else(|| {
        json!({
            "userInputMessage": {
                "content": "",
                "modelId": ctx.model,
                "userInputMessageContext": user_input_context(ctx),
            }
        })
    });
    history.extend(turns);

    json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": Uuid::new_v4().to_string(),
            "history": history,
            "currentMessage": current_message,
        }
    })
}

fn user_input_context(ctx: &ChatRequestContext) -> Value {
    if ctx.tools.is_empty() {
        return json!({});
    }
    json!({
        "tools": ctx
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpecification": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "inputSchema": { "json": tool.input_schema },
                    }
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn tool_uses(message: &super::NormalizedMessage) -> Value {
    let uses: Vec<Value> = message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolUse { id, name, input } => Some(json!({
                "toolUseId": id,
                "name": name,
                "input": input,
            })),
            _ => None,
        })
        .collect();
    Value::Array(uses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{NormalizedMessage, Role};
    use crate::store::{AuxAuthFields, Credential};
    use chrono::Utc;

    fn credential(region: Option<&str>) -> Credential {
        Credential {
            id: "cred1".to_string(),
            provider: Provider::Kiro,
            display_name: "test".to_string(),
            access_secret: "secret".to_string(),
            refresh_secret: None,
            aux: AuxAuthFields {
                region: region.map(str::to_string),
                ..Default::default()
            },
            expiry: None,
            active: true,
            use_count: 0,
            last_used_at: None,
            error_count: 0,
            last_error_message: None,
            last_error_at: None,
            quota: std::collections::HashMap::new(),
            quota_fetched_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ctx() -> ChatRequestContext {
        ChatRequestContext {
            system_prompt: Some("be nice".to_string()),
            messages: vec![
                NormalizedMessage {
                    role: Role::User,
                    content: vec![ContentPart::Text("hello".to_string())],
                },
                NormalizedMessage {
                    role: Role::Assistant,
                    content: vec![ContentPart::Text("hi there".to_string())],
                },
                NormalizedMessage {
                    role: Role::User,
                    content: vec![ContentPart::Text("how are you".to_string())],
                },
            ],
            model: "claude-3-5-sonnet".to_string(),
            tools: vec![],
            max_tokens: 1024,
            temperature: None,
            stream: true,
        }
    }

    #[test]
    fn builds_url_from_credential_region() {
        let adapter = KiroAdapter::new();
        let request = adapter.build_request(&credential(Some("eu-west-1")), "tok", &ctx()).unwrap();
        assert_eq!(request.url, "https://q.eu-west-1.amazonaws.com/generateAssistantResponse");
        assert!(matches!(request.stream_format, StreamFormat::AwsEventStream));
    }

    #[test]
    fn defaults_to_us_east_1_without_region() {
        let adapter = KiroAdapter::new();
        let request = adapter.build_request(&credential(None), "tok", &ctx()).unwrap();
        assert!(request.url.contains("us-east-1"));
    }

    #[test]
    fn system_prompt_merges_into_first_user_message() {
        let body = build_conversation_state(&ctx());
        let history = body["conversationState"]["history"].as_array().unwrap();
        let first_user_text = history[0]["userInputMessage"]["content"].as_str().unwrap();
        assert!(first_user_text.starts_with("be nice\n\n"));
    }

    #[test]
    fn last_message_becomes_current_message() {
        let body = build_conversation_state(&ctx());
        let current = &body["conversationState"]["currentMessage"];
        assert_eq!(
            current["userInputMessage"]["content"].as_str().unwrap(),
            "how are you"
        );
    }

    #[test]
    fn bearer_header_carries_access_token() {
        let adapter = KiroAdapter::new();
        let request = adapter.build_request(&credential(None), "tok123", &ctx()).unwrap();
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer tok123"));
    }
}
