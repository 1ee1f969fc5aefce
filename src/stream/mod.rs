//! Stream translator: normalizes three upstream framings into one ordered
//! event sequence.
//!
//! `StreamEvent` is a tagged enum over message/content-block/message-level
//! variants. The event-stream brace-counting scanner, SSE-JSON parser, and
//! JSON-lines parser each turn their own wire framing into this shared
//! event sequence.

pub mod event_stream;
pub mod jsonl;
pub mod sse_json;
pub mod tool_call;
pub mod translator;

pub use translator::StreamTranslator;

use serde::Serialize;

/// Which of the three upstream framings an adapter produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// AWS event-stream JSON-object scanning (CodeWhisperer, Vertex-Claude).
    AwsEventStream,
    /// `data:`-prefixed SSE lines carrying JSON payloads (Gemini).
    SseJson,
    /// Bare JSON-per-line, no `data:` prefix (other SSE variants).
    JsonLines,
}

/// One normalized stream event.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { message_id: String, model: String },
    ContentBlockStart { index: u32, block: ContentBlockInfo },
    ContentBlockDelta { index: u32, delta: Delta },
    ContentBlockStop { index: u32 },
    MessageDelta { stop_reason: Option<String>, usage: Option<Usage> },
    MessageStop,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockInfo {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}
