//! Shared tool-call assembly state machine.
//!
//! At most one tool call is open at a time per stream. A `toolUseId` that
//! differs from the currently open one finalizes it before opening the new
//! one; an explicit stop signal finalizes directly.

use super::{ContentBlockInfo, Delta, StreamEvent};

struct OpenToolCall {
    index: u32,
    id: String,
}

#[derive(Default)]
pub struct ToolCallAssembler {
    open: Option<OpenToolCall>,
    next_index: u32,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new tool call, finalizing any currently open one first.
    pub fn start(&mut self, id: String, name: String, initial_input: Option<String>) -> Vec<StreamEvent> {
        let mut events = self.finalize_current();
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            block: ContentBlockInfo::ToolUse { id: id.clone(), name },
        });
        if let Some(fragment) = initial_input {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json: fragment },
            });
        }
        self.open = Some(OpenToolCall { index, id });
        events
    }

    /// Appends an input fragment to the currently open tool call. A
    /// `tool_use_id` that doesn't match the open call finalizes it and
    /// opens a new (nameless) one, matching the scanner's "input with no
    /// name" continuation case when no call is open yet.
    pub fn append_input(&mut self, tool_use_id: &str, fragment: &str) -> Vec<StreamEvent> {
        match &self.open {
            Some(open) if tool_use_id.is_empty() || open.id == tool_use_id => {
                let index = open.index;
                vec![StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::InputJsonDelta {
                        partial_json: fragment.to_string(),
                    },
                }]
            }
            _ => self.start(tool_use_id.to_string(), String::new(), Some(fragment.to_string())),
        }
    }

    /// Finalizes the currently open tool call, if any.
    pub fn finalize_current(&mut self) -> Vec<StreamEvent> {
        match self.open.take() {
            Some(open) => vec![StreamEvent::ContentBlockStop { index: open.index }],
            None => Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// A finalized tool call's accumulated raw input, parsed as JSON when
    /// possible; the raw string is retained on parse failure.
    pub fn parsed_input(raw: &str) -> serde_json::Value {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tool_use_id_finalizes_previous() {
        let mut assembler = ToolCallAssembler::new();
        let events = assembler.start("t1".into(), "search".into(), None);
        assert!(matches!(events[0], StreamEvent::ContentBlockStart { index: 0, .. }));

        let events = assembler.start("t2".into(), "fetch".into(), None);
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 1, .. }));
    }

    #[test]
    fn append_input_joins_open_call() {
        let mut assembler = ToolCallAssembler::new();
        assembler.start("t1".into(), "search".into(), None);
        let events = assembler.append_input("t1", "{\"q\":");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::ContentBlockDelta { index: 0, .. }));
    }

    #[test]
    fn parsed_input_falls_back_to_raw_string_on_invalid_json() {
        let value = ToolCallAssembler::parsed_input("not json");
        assert_eq!(value, serde_json::Value::String("not json".to_string()));
    }

    #[test]
    fn unfinalized_call_reports_open() {
        let mut assembler = ToolCallAssembler::new();
        assembler.start("t1".into(), "search".into(), None);
        assert!(assembler.is_open());
        assembler.finalize_current();
        assert!(!assembler.is_open());
    }
}
