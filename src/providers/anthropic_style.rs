//! Anthropic-direct / Bedrock / Warp / Orchids adapter: each has its own
//! URL template and small header/auth differences, but the wire body is
//! the outbound Claude messages schema directly. A small per-provider URL
//! table picks the template and the rest of the body-building is shared.

use serde_json::{json, Value};

use super::{merge_adjacent_same_role, BuiltRequest, ChatRequestContext, ContentPart, ProviderAdapter, Role};
use crate::store::{Credential, Provider};
use crate::stream::StreamFormat;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicStyleAdapter {
    provider: Provider,
}

impl AnthropicStyleAdapter {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    fn url_for(&self, credential: &Credential, model: &str) -> String {
        match self.provider {
            Provider::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            Provider::Bedrock => {
                let region = credential.aux.region.clone().unwrap_or_else(|| "us-east-1".to_string());
                format!(
                    "https://bedrock-runtime.{region}.amazonaws.com/model/{model}/invoke-with-response-stream"
                )
            }
            Provider::Warp => "https://app.warp.dev/ai/v1/messages".to_string(),
            Provider::Orchids => "https://api.orchids.app/v1/messages".to_string(),
            _ => unreachable!("AnthropicStyleAdapter only handles direct-Claude-wire providers"),
        }
    }
}

impl ProviderAdapter for AnthropicStyleAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn build_request(
        &self,
        credential: &Credential,
        access_token: &str,
        ctx: &ChatRequestContext,
    ) -> anyhow::Result<BuiltRequest> {
        let url = self.url_for(credential, &ctx.model);
        let body = build_messages_body(ctx);

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        match self.provider {
            Provider::Anthropic => {
                headers.push(("x-api-key".to_string(), access_token.to_string()));
                headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
            }
            Provider::Bedrock => {
                headers.push(("authorization".to_string(), format!("Bearer {access_token}")));
            }
            Provider::Warp | Provider::Orchids => {
                headers.push(("authorization".to_string(), format!("Bearer {access_token}")));
            }
            _ => unreachable!(),
        }

        Ok(BuiltRequest {
            url,
            headers,
            body,
            stream_format: StreamFormat::JsonLines,
        })
    }
}

fn build_messages_body(ctx: &ChatRequestContext) -> Value {
    let merged = merge_adjacent_same_role(&ctx.messages);

    let messages: Vec<Value> = merged
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": content_blocks(&message.content) })
        })
        .collect();

    let mut body = json!({
        "model": ctx.model,
        "max_tokens": ctx.max_tokens,
        "messages": messages,
        "stream": ctx.stream,
    });

    if let Some(system) = &ctx.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(temperature) = ctx.temperature {
        body["temperature"] = json!(temperature);
    }
    if !ctx.tools.is_empty() {
        body["tools"] = json!(ctx
            .tools
            .iter()
            .map(|tool| json!({
                "name": tool.name,
                "description": tool.description.clone().unwrap_or_default(),
                "input_schema": tool.input_schema,
            }))
            .collect::<Vec<_>>());
    }

    body
}

fn content_blocks(content: &[ContentPart]) -> Value {
    if content.len() == 1 {
        if let ContentPart::Text(text) = &content[0] {
            return json!(text);
        }
    }

    json!(content
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "type": "text", "text": text }),
            ContentPart::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentPart::ToolResult { tool_use_id, content, is_error } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NormalizedMessage;
    use crate::store::AuxAuthFields;
    use chrono::Utc;

    fn credential(provider: Provider) -> Credential {
        Credential {
            id: "cred1".to_string(),
            provider,
            display_name: "test".to_string(),
            access_secret: "tok".to_string(),
            refresh_secret: None,
            aux: AuxAuthFields::default(),
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
            system_prompt: None,
            messages: vec![NormalizedMessage {
                role: Role::User,
                content: vec![ContentPart::Text("hi".to_string())],
            }],
            model: "claude-3-5-sonnet".to_string(),
            tools: vec![],
            max_tokens: 512,
            temperature: None,
            stream: true,
        }
    }

    #[test]
    fn anthropic_uses_x_api_key_header() {
        let adapter = AnthropicStyleAdapter::new(Provider::Anthropic);
        let request = adapter.build_request(&credential(Provider::Anthropic), "sk-1", &ctx()).unwrap();
        assert_eq!(request.url, "https://api.anthropic.com/v1/messages");
        assert!(request.headers.iter().any(|(k, v)| k == "x-api-key" && v == "sk-1"));
    }

    #[test]
    fn bedrock_url_includes_region_and_model() {
        let adapter = AnthropicStyleAdapter::new(Provider::Bedrock);
        let mut cred = credential(Provider::Bedrock);
        cred.aux.region = Some("eu-central-1".to_string());
        let request = adapter.build_request(&cred, "tok", &ctx()).unwrap();
        assert!(request.url.contains("bedrock-runtime.eu-central-1.amazonaws.com"));
        assert!(request.url.contains("claude-3-5-sonnet"));
    }

    #[test]
    fn single_text_block_collapses_to_plain_string() {
        let body = build_messages_body(&ctx());
        assert!(body["messages"][0]["content"].is_string());
    }
}
