//! Incremental parser for the upstream SSE line protocol.
//!
//! The Cloud Code stream only ever carries `data:` payloads, so the parser
//! tracks exactly two things: the unterminated tail of the last chunk and
//! the payload of the event currently being assembled. A blank line closes
//! the event; a `[DONE]` payload marks end of stream; every other field and
//! comment line is dropped.

use bytes::Bytes;

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data == DONE_MARKER
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    /// Bytes after the last newline seen, carried into the next chunk.
    partial: String,
    /// Payload of the event under construction, if any data line arrived.
    pending: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.find('\n') {
            let (head, tail) = rest.split_at(newline);
            rest = &tail[1..];
            self.partial.push_str(head);
            let line = std::mem::take(&mut self.partial);
            self.accept_line(line.trim_end_matches('\r'), &mut events);
        }
        self.partial.push_str(rest);
        events
    }

    /// Flush whatever remains after the upstream body ends; the final event
    /// may end at EOF without its terminating blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let line = std::mem::take(&mut self.partial);
        self.accept_line(line.trim_end_matches('\r'), &mut events);
        if let Some(data) = self.pending.take() {
            events.push(SseEvent { data });
        }
        events
    }

    fn accept_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(data) = self.pending.take() {
                events.push(SseEvent { data });
            }
            return;
        }
        let Some(value) = line.strip_prefix("data:") else {
            // Comments and non-data fields carry nothing we forward.
            return;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match &mut self.pending {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.pending = Some(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"a\":").is_empty());
        let events = parser.push_str("1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn handles_crlf_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\r\ndata: {}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn non_data_fields_dropped() {
        let mut parser = SseParser::new();
        let events = parser.push_str("event: update\nretry: 500\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn done_marker_detected() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_done());
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"b\":2}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"b\":2}");
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn only_one_leading_space_stripped() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data:  indented\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, " indented");
    }
}
