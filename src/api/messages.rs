//! `/v1/messages` (Claude-style) and `/v1/chat/completions` (OpenAI-style)
//! handlers implementing the inbound request lifecycle:
//! quota/concurrency enforcement, model routing, credential selection,
//! token validity, upstream request construction, streaming or
//! accumulated response delivery, pre-flush retry, and the post-completion
//! health/log update. Each step delegates to the subsystem that already
//! implements it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::auth::AuthedKey;
use super::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{
    self, model_alias, ChatRequestContext, ContentPart, NormalizedMessage, ProviderAdapter, Role,
    ToolDefinition,
};
use crate::retry::{self, RetryDecision};
use crate::settings::GlobalSettings;
use crate::store::{ApiKey, ApiLog, Credential, Provider, StoreError};
use crate::stream::tool_call::ToolCallAssembler;
use crate::stream::{ContentBlockInfo, Delta, StreamEvent, StreamFormat, StreamTranslator, Usage};
use crate::token::RefreshOutcome;

const DEFAULT_CONCURRENCY_LIMIT: u32 = 20;
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Which wire shape to render accumulated/streamed output as.
#[derive(Debug, Clone, Copy)]
enum ResponseStyle {
    Claude,
    OpenAi,
}

/// Request shape shared by both inbound surfaces after parsing.
struct ParsedRequest {
    model: String,
    system_prompt: Option<String>,
    messages: Vec<NormalizedMessage>,
    tools: Vec<ToolDefinition>,
    max_tokens: u32,
    temperature: Option<f32>,
    stream: bool,
    conversation_id: Option<String>,
}

// ---------------------------------------------------------------------
// Claude-style `/v1/messages`
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<InboundTool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Deserialize)]
pub struct InboundTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedKey>,
    Json(body): Json<MessagesRequest>,
) -> Result<Response, GatewayError> {
    let parsed = ParsedRequest {
        model: body.model.clone(),
        system_prompt: system_text(body.system.as_ref()),
        messages: body.messages.iter().map(to_normalized_claude).collect(),
        tools: body.tools.iter().map(to_tool_definition).collect(),
        max_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body.temperature,
        stream: body.stream,
        conversation_id: body.conversation_id.clone(),
    };
    process(state, authed, parsed, ResponseStyle::Claude, "/v1/messages").await
}

// ---------------------------------------------------------------------
// OpenAI-style `/v1/chat/completions`
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: String,
}

pub async fn create_chat_completion(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedKey>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for msg in &body.messages {
        if msg.role == "system" {
            system_parts.push(msg.content.clone());
        } else {
            let role = if msg.role == "assistant" { Role::Assistant } else { Role::User };
            messages.push(NormalizedMessage {
                role,
                content: vec![ContentPart::Text(msg.content.clone())],
            });
        }
    }
    let parsed = ParsedRequest {
        model: body.model.clone(),
        system_prompt: if system_parts.is_empty() { None } else { Some(system_parts.join("\n")) },
        messages,
        tools: Vec::new(),
        max_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body.temperature,
        stream: body.stream,
        conversation_id: body.conversation_id.clone(),
    };
    process(state, authed, parsed, ResponseStyle::OpenAi, "/v1/chat/completions").await
}

// ---------------------------------------------------------------------
// Shared lifecycle
// ---------------------------------------------------------------------

async fn process(
    state: Arc<AppState>,
    authed: AuthedKey,
    parsed: ParsedRequest,
    style: ResponseStyle,
    path: &'static str,
) -> Result<Response, GatewayError> {
    let started_at = Instant::now();

    // Step 2: quota + concurrency.
    enforce_quota(&state, &authed.key).await?;
    let limit = authed.key.limits.concurrent.unwrap_or(DEFAULT_CONCURRENCY_LIMIT);
    let semaphore = state.concurrency.semaphore_for(authed.key.id, limit).await;
    let _permit = semaphore
        .try_acquire_owned()
        .map_err(|_| GatewayError::concurrency_limited())?;

    // Step 3: model -> provider routing.
    let settings = state.settings.get().await;
    let provider = model_alias::resolve_provider(&settings, &parsed.model);

    // Step 4: credential selection. Kiro and Vertex stick a conversation to
    // one credential when the caller supplies a conversation id; every other
    // provider, and the no-conversation-id case, sticks on the API key.
    let fingerprint = match provider {
        Provider::Kiro | Provider::Vertex => parsed
            .conversation_id
            .clone()
            .unwrap_or_else(|| authed.key.id.to_string()),
        _ => authed.key.id.to_string(),
    };
    let credential = state
        .selection
        .select(provider, &fingerprint, Some(&parsed.model))
        .await
        .map_err(|_| GatewayError::unavailable(format!("no healthy {provider} credential available")))?;

    let target_model = model_alias::resolve_model(&state.store, provider, &parsed.model)
        .await
        .unwrap_or_else(|_| parsed.model.clone());

    let ctx = ChatRequestContext {
        system_prompt: parsed.system_prompt,
        messages: parsed.messages,
        model: target_model,
        tools: parsed.tools,
        max_tokens: parsed.max_tokens,
        temperature: parsed.temperature,
        stream: parsed.stream,
    };
    let stream_requested = parsed.stream;

    // Steps 5-8: token validity, request build, dispatch, pre-flush retry.
    match run_with_retry(&state, provider, credential, ctx, &settings).await {
        Ok((response, credential, format)) => {
            if stream_requested {
                Ok(stream_response(
                    state,
                    provider,
                    credential,
                    response,
                    format,
                    parsed.model,
                    authed.key.id,
                    started_at,
                    style,
                    path,
                )
                .await)
            } else {
                collect_response(
                    &state,
                    provider,
                    credential,
                    response,
                    format,
                    parsed.model,
                    authed.key.id,
                    started_at,
                    style,
                    path,
                )
                .await
            }
        }
        Err(err) => {
            log_request(&state, authed.key.id, None, &parsed.model, &Usage::default(), err.kind.status().as_u16(), started_at, path).await;
            Err(err)
        }
    }
}

async fn enforce_quota(state: &AppState, key: &ApiKey) -> GatewayResult<()> {
    let now = Utc::now();
    if let Some(daily) = key.limits.daily {
        check_window(state, key.id, now - chrono::Duration::days(1), daily, "daily").await?;
    }
    if let Some(monthly) = key.limits.monthly {
        check_window(state, key.id, now - chrono::Duration::days(30), monthly, "monthly").await?;
    }
    if let Some(total) = key.limits.total {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or(now);
        check_window(state, key.id, epoch, total, "total").await?;
    }
    Ok(())
}

async fn check_window(state: &AppState, key_id: Uuid, since: DateTime<Utc>, limit: u64, label: &str) -> GatewayResult<()> {
    let usage = state.store.usage_since(key_id, since).await.map_err(store_err)?;
    if usage.request_count >= limit {
        return Err(GatewayError::quota_exceeded(format!("{label} request limit reached")));
    }
    Ok(())
}

fn store_err(e: StoreError) -> GatewayError {
    GatewayError::unavailable(format!("store error: {e}"))
}

/// Drives the request through the token-validity, request-build, and
/// pre-flush retry ladder. Returns once an upstream response with a 2xx status is in hand,
/// since nothing has been written to the client before that point.
async fn run_with_retry(
    state: &AppState,
    provider: Provider,
    mut credential: Credential,
    mut ctx: ChatRequestContext,
    settings: &GlobalSettings,
) -> GatewayResult<(reqwest::Response, Credential, StreamFormat)> {
    let mut attempt = 0u32;
    let mut compression_level = 0u8;
    let mut forced_refresh = false;

    loop {
        let access_token = match ensure_access_token(state, &mut credential).await {
            Ok(token) => token,
            Err(err) => {
                record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                return Err(err);
            }
        };

        let built = match build_request(provider, &credential, &access_token, &ctx) {
            Ok(built) => built,
            Err(err) => {
                record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                return Err(err);
            }
        };

        let response = match send_built_request(state, &built).await {
            Ok(response) => response,
            Err(err) => {
                record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                return Err(err);
            }
        };

        if response.status().is_success() {
            return Ok((response, credential, built.stream_format));
        }

        let status = response.status().as_u16();
        let error_type_header = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body_text = response.text().await.unwrap_or_default();

        let decision = retry::classify(
            status,
            error_type_header.as_deref(),
            &body_text,
            attempt,
            compression_level,
            forced_refresh,
            settings.retry_base_delay_secs,
        );

        match decision {
            RetryDecision::RefreshAndRetry => {
                match state.token_manager.refresh(&credential).await {
                    Ok(outcome) => {
                        apply_refresh(&mut credential, outcome);
                        if let Err(err) = persist_credential(state, &credential).await {
                            record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                            return Err(err);
                        }
                        forced_refresh = true;
                    }
                    Err(e) => {
                        let err = GatewayError::auth_expired().with_upstream_detail(e.to_string());
                        record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                        return Err(err);
                    }
                }
            }
            RetryDecision::BackoffAndRetry { delay } => {
                if attempt >= settings.max_retries {
                    let err = GatewayError::rate_limited().with_upstream_detail(body_text);
                    record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            RetryDecision::CompressAndRetry => {
                if attempt >= settings.max_retries {
                    let err = GatewayError::context_too_large();
                    record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                    return Err(err);
                }
                compression_level += 1;
                match retry::compression::compress_one_level(&ctx.messages, compression_level) {
                    Some(compressed) => {
                        ctx.messages = compressed;
                        attempt += 1;
                    }
                    None => {
                        let err = GatewayError::context_too_large();
                        record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                        return Err(err);
                    }
                }
            }
            RetryDecision::Fail(err) => {
                record_outcome(state, provider, &credential, false, Some(&err.message)).await;
                return Err(err);
            }
        }
    }
}

async fn ensure_access_token(state: &AppState, credential: &mut Credential) -> GatewayResult<String> {
    let settings = state.settings.get().await;
    match state
        .token_manager
        .ensure_valid(credential, settings.token_refresh_threshold_minutes)
        .await
    {
        Ok(Some(outcome)) => {
            apply_refresh(credential, outcome);
            persist_credential(state, credential).await?;
        }
        Ok(None) => {}
        Err(e) => return Err(GatewayError::auth_expired().with_upstream_detail(e.to_string())),
    }
    Ok(credential.access_secret.clone())
}

fn apply_refresh(credential: &mut Credential, outcome: RefreshOutcome) {
    credential.access_secret = outcome.access_secret;
    if outcome.refresh_secret.is_some() {
        credential.refresh_secret = outcome.refresh_secret;
    }
    credential.expiry = outcome.expiry;
    credential.updated_at = Utc::now();
}

async fn persist_credential(state: &AppState, credential: &Credential) -> GatewayResult<()> {
    state
        .store
        .update_credential(credential.clone())
        .await
        .map_err(|e| GatewayError::unavailable(format!("failed to persist refreshed credential: {e}")))
}

fn build_request(
    provider: Provider,
    credential: &Credential,
    access_token: &str,
    ctx: &ChatRequestContext,
) -> GatewayResult<providers::BuiltRequest> {
    providers::adapter_for(provider)
        .build_request(credential, access_token, ctx)
        .map_err(|e| GatewayError::upstream(format!("failed to build upstream request: {e}")))
}

async fn send_built_request(state: &AppState, built: &providers::BuiltRequest) -> GatewayResult<reqwest::Response> {
    let mut request = state.http.post(&built.url);
    for (name, value) in &built.headers {
        request = request.header(name, value);
    }
    request.json(&built.body).send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::timeout()
        } else {
            GatewayError::upstream(e.to_string())
        }
    })
}

async fn record_outcome(state: &AppState, provider: Provider, credential: &Credential, success: bool, error_message: Option<&str>) {
    let settings = state.settings.get().await;
    let health_result = if success {
        state.health.record_success(provider, &credential.id, settings.health_success_bonus).await
    } else {
        state
            .health
            .record_failure(provider, &credential.id, settings.health_failure_penalty, error_message.unwrap_or("request failed"))
            .await
    };
    if let Err(e) = health_result {
        tracing::warn!(error = %e, "failed to update health after request");
    }
    if let Err(e) = state.registry.increment_use_count(provider, &credential.id).await {
        tracing::warn!(error = %e, "failed to increment credential use count");
    }

    if success {
        if let Err(e) = state.registry.reset_error_count(provider, &credential.id).await {
            tracing::warn!(error = %e, "failed to reset credential error count");
        }
        return;
    }

    let message = error_message.unwrap_or("request failed");
    match state.registry.record_error_count(provider, &credential.id, message).await {
        Ok(error_count) => {
            let config = state.settings.selection_config(provider.as_str()).await;
            if error_count >= config.quarantine_threshold {
                if let Err(e) = state.registry.move_to_error(provider, &credential.id, message).await {
                    tracing::warn!(error = %e, "failed to move credential to quarantine");
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to record credential error count"),
    }
}

async fn log_request(
    state: &AppState,
    api_key_id: Uuid,
    credential_id: Option<&str>,
    model: &str,
    usage: &Usage,
    status_code: u16,
    started_at: Instant,
    path: &str,
) {
    if let Err(e) = state.store.touch_api_key_last_used(api_key_id).await {
        tracing::warn!(error = %e, "failed to touch api key last_used_at");
    }
    let log = ApiLog {
        request_id: Uuid::new_v4(),
        api_key_id: Some(api_key_id),
        credential_id: credential_id.map(str::to_string),
        model: model.to_string(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        status_code,
        duration_ms: started_at.elapsed().as_millis() as u64,
        path: path.to_string(),
        source: "gateway".to_string(),
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.insert_api_log(log).await {
        tracing::warn!(error = %e, "failed to insert api log row");
    }
}

// ---------------------------------------------------------------------
// Non-streaming: accumulate the translator's events into one response.
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn collect_response(
    state: &AppState,
    provider: Provider,
    credential: Credential,
    response: reqwest::Response,
    format: StreamFormat,
    requested_model: String,
    api_key_id: Uuid,
    started_at: Instant,
    style: ResponseStyle,
    path: &str,
) -> Result<Response, GatewayError> {
    let status = response.status().as_u16();
    let body_text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            let err = GatewayError::upstream(e.to_string());
            record_outcome(state, provider, &credential, false, Some(&err.message)).await;
            log_request(state, api_key_id, Some(&credential.id), &requested_model, &Usage::default(), status, started_at, path).await;
            return Err(err);
        }
    };

    let mut translator = StreamTranslator::new(format, requested_model.clone());
    let mut events = translator.feed(&body_text);
    events.extend(translator.finish());

    let (content, stop_reason, usage) = accumulate_events(&events);

    record_outcome(state, provider, &credential, true, None).await;
    log_request(state, api_key_id, Some(&credential.id), &requested_model, &usage, status, started_at, path).await;

    let body = match style {
        ResponseStyle::Claude => build_claude_response(&requested_model, &content, stop_reason.as_deref(), &usage),
        ResponseStyle::OpenAi => build_openai_response(&requested_model, &content, stop_reason.as_deref(), &usage),
    };

    Ok(Json(body).into_response())
}

fn build_claude_response(model: &str, content: &[Value], stop_reason: Option<&str>, usage: &Usage) -> Value {
    json!({
        "id": format!("msg_{}", Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        },
    })
}

fn build_openai_response(model: &str, content: &[Value], stop_reason: Option<&str>, usage: &Usage) -> Value {
    let text: String = content
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": stop_reason.unwrap_or("stop"),
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.input_tokens + usage.output_tokens,
        },
    })
}

/// Replays `ContentBlockStart`/`Delta`/`Stop` events into a finished Claude
/// `content` array, keeping blocks in first-seen order.
fn accumulate_events(events: &[StreamEvent]) -> (Vec<Value>, Option<String>, Usage) {
    let mut order: Vec<u32> = Vec::new();
    let mut texts: HashMap<u32, String> = HashMap::new();
    let mut tool_meta: HashMap<u32, (String, String)> = HashMap::new();
    let mut tool_json: HashMap<u32, String> = HashMap::new();
    let mut stop_reason = None;
    let mut usage = Usage::default();

    for event in events {
        match event {
            StreamEvent::ContentBlockStart { index, block } => {
                order.push(*index);
                match block {
                    ContentBlockInfo::Text => {
                        texts.insert(*index, String::new());
                    }
                    ContentBlockInfo::ToolUse { id, name } => {
                        tool_meta.insert(*index, (id.clone(), name.clone()));
                        tool_json.insert(*index, String::new());
                    }
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => texts.entry(*index).or_default().push_str(text),
                Delta::InputJsonDelta { partial_json } => tool_json.entry(*index).or_default().push_str(partial_json),
            },
            StreamEvent::MessageDelta { stop_reason: sr, usage: u } => {
                if sr.is_some() {
                    stop_reason = sr.clone();
                }
                if let Some(u) = u {
                    usage = *u;
                }
            }
            _ => {}
        }
    }

    let content = order
        .into_iter()
        .filter_map(|index| {
            if let Some(text) = texts.get(&index) {
                Some(json!({ "type": "text", "text": text }))
            } else {
                tool_meta.get(&index).map(|(id, name)| {
                    let input = tool_json
                        .get(&index)
                        .map(|raw| ToolCallAssembler::parsed_input(raw))
                        .unwrap_or_else(|| json!({}));
                    json!({ "type": "tool_use", "id": id, "name": name, "input": input })
                })
            }
        })
        .collect();

    (content, stop_reason, usage)
}

// ---------------------------------------------------------------------
// Streaming: forward the translator's events as they arrive.
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn stream_response(
    state: Arc<AppState>,
    provider: Provider,
    credential: Credential,
    response: reqwest::Response,
    format: StreamFormat,
    requested_model: String,
    api_key_id: Uuid,
    started_at: Instant,
    style: ResponseStyle,
    path: &'static str,
) -> Response {
    let mut byte_stream = response.bytes_stream();

    let body = async_stream::stream! {
        let mut translator = StreamTranslator::new(format, requested_model.clone());
        let mut usage = Usage::default();
        let mut success = true;
        let mut failure_message: Option<String> = None;

        loop {
            match byte_stream.next().await {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    for event in translator.feed(&text) {
                        note_usage(&event, &mut usage);
                        if let Some(rendered) = render_event(style, &requested_model, &event) {
                            yield Ok::<_, std::io::Error>(Bytes::from(rendered));
                        }
                    }
                }
                Some(Err(e)) => {
                    success = false;
                    failure_message = Some(e.to_string());
                    break;
                }
                None => break,
            }
        }

        for event in translator.finish() {
            note_usage(&event, &mut usage);
            if let Some(rendered) = render_event(style, &requested_model, &event) {
                yield Ok::<_, std::io::Error>(Bytes::from(rendered));
            }
        }

        record_outcome(&state, provider, &credential, success, failure_message.as_deref()).await;
        let status = if success { 200 } else { 502 };
        log_request(&state, api_key_id, Some(&credential.id), &requested_model, &usage, status, started_at, path).await;
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn note_usage(event: &StreamEvent, usage: &mut Usage) {
    if let StreamEvent::MessageDelta { usage: Some(u), .. } = event {
        *usage = *u;
    }
}

fn render_event(style: ResponseStyle, model: &str, event: &StreamEvent) -> Option<String> {
    match style {
        ResponseStyle::Claude => Some(format!("data: {}\n\n", serde_json::to_string(event).unwrap_or_default())),
        ResponseStyle::OpenAi => openai_chunk(model, event).map(|body| format!("data: {body}\n\n")),
    }
}

fn openai_chunk(model: &str, event: &StreamEvent) -> Option<String> {
    match event {
        StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } => Some(
            json!({
                "id": "chatcmpl",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }],
            })
            .to_string(),
        ),
        StreamEvent::MessageStop => Some("[DONE]".to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------
// Inbound parsing helpers
// ---------------------------------------------------------------------

fn to_normalized_claude(msg: &InboundMessage) -> NormalizedMessage {
    NormalizedMessage {
        role: if msg.role == "assistant" { Role::Assistant } else { Role::User },
        content: parse_content(&msg.content),
    }
}

fn to_tool_definition(tool: &InboundTool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

fn system_text(system: Option<&Value>) -> Option<String> {
    match system {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() { None } else { Some(text) }
        }
        _ => None,
    }
}

fn parse_content(value: &Value) -> Vec<ContentPart> {
    match value {
        Value::String(text) => vec![ContentPart::Text(text.clone())],
        Value::Array(blocks) => blocks.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentPart> {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => block.get("text").and_then(Value::as_str).map(|t| ContentPart::Text(t.to_string())),
        Some("tool_use") => Some(ContentPart::ToolUse {
            id: block.get("id")?.as_str()?.to_string(),
            name: block.get("name")?.as_str()?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        Some("tool_result") => Some(ContentPart::ToolResult {
            tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
            content: match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_content() {
        let content = parse_content(&json!("hello"));
        assert!(matches!(&content[0], ContentPart::Text(t) if t == "hello"));
    }

    #[test]
    fn parses_tool_use_block() {
        let content = parse_content(&json!([{ "type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"} }]));
        match &content[0] {
            ContentPart::ToolUse { id, name, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "search");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn system_text_handles_string_and_block_array() {
        assert_eq!(system_text(Some(&json!("be nice"))), Some("be nice".to_string()));
        assert_eq!(
            system_text(Some(&json!([{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }]))),
            Some("a\nb".to_string())
        );
        assert_eq!(system_text(None), None);
    }

    #[test]
    fn accumulate_events_orders_blocks_by_first_seen() {
        let events = vec![
            StreamEvent::ContentBlockStart { index: 0, block: ContentBlockInfo::Text },
            StreamEvent::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: "hi".to_string() } },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta { stop_reason: Some("end_turn".to_string()), usage: Some(Usage { input_tokens: 3, output_tokens: 5 }) },
        ];
        let (content, stop_reason, usage) = accumulate_events(&events);
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["text"], "hi");
        assert_eq!(stop_reason, Some("end_turn".to_string()));
        assert_eq!(usage.output_tokens, 5);
    }

    #[test]
    fn openai_chunk_renders_text_delta_and_done_marker() {
        let event = StreamEvent::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: "hi".to_string() } };
        assert!(openai_chunk("gpt", &event).unwrap().contains("\"content\":\"hi\""));
        assert_eq!(openai_chunk("gpt", &StreamEvent::MessageStop), Some("[DONE]".to_string()));
    }
}
