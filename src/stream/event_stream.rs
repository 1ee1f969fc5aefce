//! AWS event-stream JSON-object-prefix scanner (CodeWhisperer / Vertex-Claude).
//!
//! Stateful, chunk-fed: accumulates bytes, locates the earliest of a fixed
//! set of JSON object prefixes, brace-counts (string/escape aware) to the
//! matching close, parses the slice, and classifies it.

use serde_json::Value;

use super::tool_call::ToolCallAssembler;
use super::{ContentBlockInfo, Delta, StreamEvent};

const PREFIXES: &[&str] = &[
    r#"{"content":"#,
    r#"{"followupPrompt":"#,
    r#"{"name":"#,
    r#"{"input":"#,
    r#"{"stop":"#,
];

pub struct EventStreamScanner {
    buffer: String,
    text_block_open: bool,
    last_text_delta: Option<String>,
    tool_calls: ToolCallAssembler,
    next_text_index: u32,
}

impl Default for EventStreamScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamScanner {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            text_block_open: false,
            last_text_delta: None,
            tool_calls: ToolCallAssembler::new(),
            next_text_index: 0,
        }
    }

    /// Feeds a new chunk and returns any normalized events produced.
    /// Unparsed trailing bytes are kept in the internal buffer as
    /// `remaining` for the next call.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some((prefix_start, _prefix)) = self.find_next_prefix() {
            let Some(end) = find_matching_close(&self.buffer, prefix_start) else {
                break;
            };
            let slice = self.buffer[prefix_start..end].to_string();
            if let Ok(value) = serde_json::from_str::<Value>(&slice) {
                events.extend(self.classify(&value));
            }
            self.buffer = self.buffer[end..].to_string();
        }

        events
    }

    /// Finalizes any still-open content or tool block.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = self.close_text_block_if_open();
        events.extend(self.tool_calls.finalize_current());
        events
    }

    fn find_next_prefix(&self) -> Option<(usize, &'static str)> {
        PREFIXES
            .iter()
            .filter_map(|p| self.buffer.find(p).map(|idx| (idx, *p)))
            .min_by_key(|(idx, _)| *idx)
    }

    fn classify(&mut self, value: &Value) -> Vec<StreamEvent> {
        if value.get("followupPrompt").is_some() {
            return Vec::new();
        }

        if let Some(name) = value.get("name").and_then(Value::as_str) {
            let tool_use_id = value
                .get("toolUseId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let initial_input = value.get("input").and_then(Value::as_str).map(str::to_string);

            let mut events = self.close_text_block_if_open();
            events.extend(self.tool_calls.start(tool_use_id, name.to_string(), initial_input));
            if value.get("stop").and_then(Value::as_bool) == Some(true) {
                events.extend(self.tool_calls.finalize_current());
            }
            return events;
        }

        if let Some(input) = value.get("input").and_then(Value::as_str) {
            return self.tool_calls.append_input("", input);
        }

        if value.get("stop").is_some() {
            return self.tool_calls.finalize_current();
        }

        if let Some(text) = value.get("content").and_then(Value::as_str) {
            return self.emit_text_delta(text);
        }

        Vec::new()
    }

    fn emit_text_delta(&mut self, text: &str) -> Vec<StreamEvent> {
        if self.last_text_delta.as_deref() == Some(text) {
            return Vec::new(); // duplicate consecutive delta suppressed
        }
        let mut events = Vec::new();
        if !self.text_block_open {
            events.push(StreamEvent::ContentBlockStart {
                index: self.next_text_index,
                block: ContentBlockInfo::Text,
            });
            self.text_block_open = true;
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: self.next_text_index,
            delta: Delta::TextDelta { text: text.to_string() },
        });
        self.last_text_delta = Some(text.to_string());
        events
    }

    fn close_text_block_if_open(&mut self) -> Vec<StreamEvent> {
        if self.text_block_open {
            self.text_block_open = false;
            self.last_text_delta = None;
            let idx = self.next_text_index;
            self.next_text_index += 1;
            vec![StreamEvent::ContentBlockStop { index: idx }]
        } else {
            Vec::new()
        }
    }
}

/// Brace-counts from `start` (the opening `{`) to its matching close,
/// tracking string/escape state so braces inside string literals don't
/// perturb the depth count.
fn find_matching_close(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let mut scanner = EventStreamScanner::new();
        let events = scanner.feed(r#"{"content":"hello"}"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(&events[1], StreamEvent::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text } } if text == "hello"));
    }

    #[test]
    fn suppresses_duplicate_consecutive_content() {
        let mut scanner = EventStreamScanner::new();
        scanner.feed(r#"{"content":"hi"}"#);
        let events = scanner.feed(r#"{"content":"hi"}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn ignores_followup_prompt() {
        let mut scanner = EventStreamScanner::new();
        let events = scanner.feed(r#"{"followupPrompt":{"content":"x"}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn handles_split_chunks_via_remaining_buffer() {
        let mut scanner = EventStreamScanner::new();
        let mut events = scanner.feed(r#"{"cont"#);
        assert!(events.is_empty());
        events = scanner.feed(r#"ent":"hel"#);
        assert!(events.is_empty());
        events = scanner.feed(r#"lo"}"#);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn tool_use_start_then_input_then_stop() {
        let mut scanner = EventStreamScanner::new();
        let start = scanner.feed(r#"{"name":"search","toolUseId":"t1"}"#);
        assert!(matches!(start[0], StreamEvent::ContentBlockStart { index: 0, .. }));

        let cont = scanner.feed(r#"{"input":"{\"q\":1}"}"#);
        assert_eq!(cont.len(), 1);

        let stop = scanner.feed(r#"{"stop":true}"#);
        assert!(matches!(stop[0], StreamEvent::ContentBlockStop { index: 0 }));
    }

    #[test]
    fn unfinalized_tool_call_is_finalized_on_finish() {
        let mut scanner = EventStreamScanner::new();
        scanner.feed(r#"{"name":"search","toolUseId":"t1"}"#);
        let final_events = scanner.finish();
        assert!(matches!(final_events[0], StreamEvent::ContentBlockStop { index: 0 }));
    }
}
