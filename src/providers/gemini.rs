//! Gemini adapter (Antigravity and Vertex-hosted Gemini): converts the
//! normalized Claude-style messages into Gemini's `contents`/`parts` shape
//! — assistant roles become `model`, content becomes `parts:[{text}]`,
//! one conversion function per direction with no shared trait needed for a
//! single-hop mapping like this.

use serde_json::{json, Value};

use super::{flatten_text, merge_adjacent_same_role, BuiltRequest, ChatRequestContext, ProviderAdapter, Role};
use crate::store::{Credential, Provider};
use crate::stream::StreamFormat;

const ANTIGRAVITY_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter;

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }

    fn is_vertex(credential: &Credential) -> bool {
        credential.aux.project_id.is_some()
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn build_request(
        &self,
        credential: &Credential,
        access_token: &str,
        ctx: &ChatRequestContext,
    ) -> anyhow::Result<BuiltRequest> {
        let body = build_generate_content_body(ctx);

        let (url, headers) = if Self::is_vertex(credential) {
            let project_id = credential.aux.project_id.clone().unwrap();
            let region = credential
                .aux
                .region
                .clone()
                .unwrap_or_else(|| "us-central1".to_string());
            let url = format!(
                "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/google/models/{model}:streamGenerateContent?alt=sse",
                model = ctx.model,
            );
            let headers = vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("authorization".to_string(), format!("Bearer {access_token}")),
            ];
            (url, headers)
        } else {
            let url = format!(
                "{ANTIGRAVITY_BASE}/models/{model}:streamGenerateContent?alt=sse&key={access_token}",
                model = ctx.model,
            );
            let headers = vec![("content-type".to_string(), "application/json".to_string())];
            (url, headers)
        };

        Ok(BuiltRequest {
            url,
            headers,
            body,
            stream_format: StreamFormat::SseJson,
        })
    }
}

fn build_generate_content_body(ctx: &ChatRequestContext) -> Value {
    let merged = merge_adjacent_same_role(&ctx.messages);

    let contents: Vec<Value> = merged
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            json!({
                "role": role,
                "parts": [{ "text": flatten_text(&message.content) }],
            })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": ctx.max_tokens,
        },
    });

    if let Some(temperature) = ctx.temperature {
        body["generationConfig"]["temperature"] = json!(temperature);
    }

    if let Some(system) = &ctx.system_prompt {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ContentPart;
    use crate::store::AuxAuthFields;
    use chrono::Utc;

    fn credential(project_id: Option<&str>) -> Credential {
        Credential {
            id: "cred1".to_string(),
            provider: Provider::Gemini,
            display_name: "test".to_string(),
            access_secret: "key".to_string(),
            refresh_secret: None,
            aux: AuxAuthFields {
                project_id: project_id.map(str::to_string),
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
            system_prompt: Some("be terse".to_string()),
            messages: vec![
                crate::providers::NormalizedMessage {
                    role: Role::User,
                    content: vec![ContentPart::Text("hi".to_string())],
                },
                crate::providers::NormalizedMessage {
                    role: Role::Assistant,
                    content: vec![ContentPart::Text("hello".to_string())],
                },
            ],
            model: "gemini-1.5-pro".to_string(),
            tools: vec![],
            max_tokens: 256,
            temperature: Some(0.7),
            stream: true,
        }
    }

    #[test]
    fn antigravity_path_uses_api_key_query_param() {
        let adapter = GeminiAdapter::new();
        let request = adapter.build_request(&credential(None), "api-key", &ctx()).unwrap();
        assert!(request.url.contains("key=api-key"));
        assert!(matches!(request.stream_format, StreamFormat::SseJson));
    }

    #[test]
    fn vertex_path_uses_bearer_and_project_url() {
        let adapter = GeminiAdapter::new();
        let request = adapter
            .build_request(&credential(Some("proj-1")), "jwt", &ctx())
            .unwrap();
        assert!(request.url.contains("projects/proj-1"));
        assert!(request.headers.iter().any(|(k, v)| k == "authorization" && v == "Bearer jwt"));
    }

    #[test]
    fn assistant_role_becomes_model() {
        let body = build_generate_content_body(&ctx());
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn system_prompt_becomes_system_instruction() {
        let body = build_generate_content_body(&ctx());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }
}
