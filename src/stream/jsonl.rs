//! JSON-lines parser (non-`data:`-prefixed SSE variants): the same content
//! shape as [`super::sse_json`], minus the `data:` line prefix.

use serde_json::Value;

use super::{ContentBlockInfo, Delta, StreamEvent};

pub struct JsonLinesParser {
    buffer: String,
    text_block_open: bool,
}

impl Default for JsonLinesParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLinesParser {
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
            let line = self.buffer[..pos].trim().to_string();
            self.buffer = self.buffer[pos + 1..].to_string();
            if line.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                events.extend(self.handle_value(&value));
            }
        }
        events
    }

    fn handle_value(&mut self, value: &Value) -> Vec<StreamEvent> {
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/delta/text").and_then(Value::as_str));

        let Some(text) = text else { return Vec::new() };

        let mut events = Vec::new();
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
        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.text_block_open {
            self.text_block_open = false;
            vec![StreamEvent::ContentBlockStop { index: 0 }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_text_line() {
        let mut parser = JsonLinesParser::new();
        let events = parser.feed("{\"text\":\"hi\"}\n");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn parses_delta_text_shape() {
        let mut parser = JsonLinesParser::new();
        let events = parser.feed("{\"delta\":{\"text\":\"hi\"}}\n");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn finish_closes_dangling_block() {
        let mut parser = JsonLinesParser::new();
        parser.feed("{\"text\":\"hi\"}\n");
        let events = parser.finish();
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn build_input(texts: &[String]) -> String {
        texts
            .iter()
            .map(|t| format!("{}\n", serde_json::json!({ "text": t })))
            .collect()
    }

    fn feed_in_one_shot(input: &str) -> Vec<StreamEvent> {
        let mut parser = JsonLinesParser::new();
        let mut events = parser.feed(input);
        events.extend(parser.finish());
        events
    }

    fn feed_in_pieces(input: &str, split_seed: &[usize]) -> Vec<StreamEvent> {
        let chars: Vec<char> = input.chars().collect();
        let mut points: Vec<usize> = split_seed
            .iter()
            .map(|s| s % (chars.len() + 1))
            .collect();
        points.sort_unstable();
        points.dedup();

        let mut parser = JsonLinesParser::new();
        let mut events = Vec::new();
        let mut prev = 0;
        for point in points {
            events.extend(parser.feed(&chars[prev..point].iter().collect::<String>()));
            prev = point;
        }
        events.extend(parser.feed(&chars[prev..].iter().collect::<String>()));
        events.extend(parser.finish());
        events
    }

    proptest! {
        /// Chunk-boundary invariance: splitting the same byte stream at
        /// arbitrary points must not change the resulting event sequence.
        #[test]
        fn chunk_boundaries_do_not_change_event_sequence(
            texts in proptest::collection::vec("[a-zA-Z0-9 ]{0,8}", 0..6),
            split_seed in proptest::collection::vec(0usize..64, 0..10),
        ) {
            let input = build_input(&texts);
            prop_assert_eq!(feed_in_pieces(&input, &split_seed), feed_in_one_shot(&input));
        }
    }
}
