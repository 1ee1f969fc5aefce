//! Top-level translator: wraps the per-format parser and adds the
//! bracketing `message_start`/`message_stop` events the per-format parsers
//! don't themselves know about.

use uuid::Uuid;

use super::event_stream::EventStreamScanner;
use super::jsonl::JsonLinesParser;
use super::sse_json::SseJsonParser;
use super::{StreamEvent, StreamFormat};

enum Inner {
    EventStream(EventStreamScanner),
    SseJson(SseJsonParser),
    JsonLines(JsonLinesParser),
}

pub struct StreamTranslator {
    inner: Inner,
    started: bool,
    model: String,
}

impl StreamTranslator {
    pub fn new(format: StreamFormat, model: impl Into<String>) -> Self {
        let inner = match format {
            StreamFormat::AwsEventStream => Inner::EventStream(EventStreamScanner::new()),
            StreamFormat::SseJson => Inner::SseJson(SseJsonParser::new()),
            StreamFormat::JsonLines => Inner::JsonLines(JsonLinesParser::new()),
        };
        Self {
            inner,
            started: false,
            model: model.into(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = self.message_start_if_needed();
        events.extend(match &mut self.inner {
            Inner::EventStream(s) => s.feed(chunk),
            Inner::SseJson(s) => s.feed(chunk),
            Inner::JsonLines(s) => s.feed(chunk),
        });
        events
    }

    /// Flushes any dangling open block and appends the closing `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = self.message_start_if_needed();
        events.extend(match &mut self.inner {
            Inner::EventStream(s) => s.finish(),
            Inner::SseJson(s) => s.finish(),
            Inner::JsonLines(s) => s.finish(),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn message_start_if_needed(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamEvent::MessageStart {
            message_id: Uuid::new_v4().to_string(),
            model: self.model.clone(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_start_precedes_all_and_message_stop_terminates() {
        let mut translator = StreamTranslator::new(StreamFormat::AwsEventStream, "claude-3");
        let events = translator.feed(r#"{"content":"hi"}"#);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));

        let final_events = translator.finish();
        assert!(matches!(final_events.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn message_start_emitted_only_once() {
        let mut translator = StreamTranslator::new(StreamFormat::JsonLines, "claude-3");
        translator.feed("{\"text\":\"a\"}\n");
        let second = translator.feed("{\"text\":\"b\"}\n");
        assert!(!second.iter().any(|e| matches!(e, StreamEvent::MessageStart { .. })));
    }
}
