//! Vertex-Claude adapter: identical payload semantics to [`super::kiro`]
//! but its own URL template and host, since it's served from
//! Vertex AI rather than the CodeWhisperer endpoint directly.

use super::kiro::build_conversation_state;
use super::{BuiltRequest, ChatRequestContext, ProviderAdapter};
use crate::store::{Credential, Provider};
use crate::stream::StreamFormat;

const DEFAULT_REGION: &str = "us-east5";

pub struct VertexClaudeAdapter;

impl Default for VertexClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexClaudeAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderAdapter for VertexClaudeAdapter {
    fn provider(&self) -> Provider {
        Provider::Vertex
    }

    fn build_request(
        &self,
        credential: &Credential,
        access_token: &str,
        ctx: &ChatRequestContext,
    ) -> anyhow::Result<BuiltRequest> {
        let region = credential
            .aux
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let project_id = credential
            .aux
            .project_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vertex credential is missing project_id"))?;

        let url = format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{model}:streamRawPredict",
            model = ctx.model,
        );

        let body = build_conversation_state(ctx);

        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("authorization".to_string(), format!("Bearer {access_token}")),
        ];

        Ok(BuiltRequest {
            url,
            headers,
            body,
            stream_format: StreamFormat::AwsEventStream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ContentPart, NormalizedMessage, Role};
    use crate::store::AuxAuthFields;
    use chrono::Utc;

    fn credential() -> Credential {
        Credential {
            id: "cred1".to_string(),
            provider: Provider::Vertex,
            display_name: "test".to_string(),
            access_secret: "secret".to_string(),
            refresh_secret: None,
            aux: AuxAuthFields {
                project_id: Some("proj-1".to_string()),
                region: Some("us-central1".to_string()),
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
            system_prompt: None,
            messages: vec![NormalizedMessage {
                role: Role::User,
                content: vec![ContentPart::Text("hi".to_string())],
            }],
            model: "claude-3-5-sonnet@20241022".to_string(),
            tools: vec![],
            max_tokens: 512,
            temperature: None,
            stream: true,
        }
    }

    #[test]
    fn builds_project_scoped_url() {
        let adapter = VertexClaudeAdapter::new();
        let request = adapter.build_request(&credential(), "jwt-token", &ctx()).unwrap();
        assert!(request.url.contains("projects/proj-1/locations/us-central1"));
        assert!(request.url.contains("claude-3-5-sonnet@20241022"));
    }

    #[test]
    fn missing_project_id_errors() {
        let adapter = VertexClaudeAdapter::new();
        let mut cred = credential();
        cred.aux.project_id = None;
        assert!(adapter.build_request(&cred, "jwt-token", &ctx()).is_err());
    }
}
