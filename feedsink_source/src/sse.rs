//! Incremental decoding of a `text/event-stream` body.

use std::{mem, time::Duration};

const DEFAULT_EVENT_TYPE: &str = "message";

/// A dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    /// Last event id in effect when the event was dispatched
    pub id: Option<String>,
}

/// Splits arbitrary chunks of an event stream into [`SseEvent`]s.
///
/// Lines may end in `\n`, `\r\n` or `\r`, also when the terminator straddles two chunks.
/// The last event id and the reconnection delay outlive [`reset`](Self::reset), they are needed
/// to resume the stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, returning every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = vec![];
        let mut start = 0;
        while let Some(pos) = self.buf[start..]
            .iter()
            .position(|b| *b == b'\n' || *b == b'\r')
        {
            let end = start + pos;
            let next = match self.buf[end] {
                b'\r' if end + 1 == self.buf.len() => break, // may be followed by \n
                b'\r' if self.buf[end + 1] == b'\n' => end + 2,
                _ => end + 1,
            };
            let line = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
            start = next;
        }
        self.buf.drain(..start);
        events
    }

    /// Drop any partially received event, e.g. after the connection broke
    pub fn reset(&mut self) {
        self.buf.clear();
        self.event = None;
        self.data.clear();
        self.has_data = false;
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay requested by the server
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !mem::take(&mut self.has_data) {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data: mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        })
    }
}
