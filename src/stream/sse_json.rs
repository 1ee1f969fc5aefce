//! SSE-JSON parser (Gemini): lines are accumulated until `\n`; each
//! `data:` payload is parsed, `[DONE]` ends the stream.

use serde_json::Value;

use super::{ContentBlockInfo, Delta, StreamEvent, Usage};

pub struct SseJsonParser {
    buffer: String,
    text_block_open: bool,
}

impl Default for SseJsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseJsonParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            text_block_open: false,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer = self.buffer[pos + 1..].to_string();
            events.extend(self.handle_line(&line));
        }
        events
    }

    fn handle_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return self.close_text_block();
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return Vec::new();
        };
        self.handle_value(&value)
    }

    fn handle_value(&mut self, value: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !self.text_block_open {
                        events.push(StreamEvent::ContentBlockStart {
                            index: 0,
                            block: ContentBlockInfo::Text,
                        });
                        self.text_block_open = true;
                    }
                    events.push(StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: Delta::TextDelta { text: text.to_string() },
                    });
                }
            }
        }

        if let Some(usage) = value.get("usageMetadata") {
            let input_tokens = usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
            let output_tokens = usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
            events.push(StreamEvent::MessageDelta {
                stop_reason: None,
                usage: Some(Usage { input_tokens, output_tokens }),
            });
        }

        events
    }

    fn close_text_block(&mut self) -> Vec<StreamEvent> {
        if self.text_block_open {
            self.text_block_open = false;
            vec![StreamEvent::ContentBlockStop { index: 0 }]
        } else {
            Vec::new()
        }
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.close_text_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_candidate_text_delta() {
        let mut parser = SseJsonParser::new();
        let events = parser.feed("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 0, .. }));
    }

    #[test]
    fn done_sentinel_closes_open_block() {
        let mut parser = SseJsonParser::new();
        parser.feed("data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n");
        let events = parser.feed("data: [DONE]\n");
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
    }

    #[test]
    fn usage_metadata_emits_message_delta() {
        let mut parser = SseJsonParser::new();
        let events = parser.feed("data: {\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":5}}\n");
        assert!(matches!(
            events[0],
            StreamEvent::MessageDelta {
                usage: Some(Usage { input_tokens: 10, output_tokens: 5 }),
                ..
            }
        ));
    }
}
