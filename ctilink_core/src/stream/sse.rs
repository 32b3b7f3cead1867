//! Server-sent events framing.

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    pub id: Option<String>,
    /// Event type; `"message"` when the server sent none.
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn new(id: Option<&str>, event: &str, data: &str) -> Self {
        Self {
            id: id.map(str::to_string),
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    pub fn data_json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.data)
            .map_err(|e| crate::Error::decode(format!("event data is not JSON: {e}")))
    }
}

pub type SseStream = BoxStream<'static, Result<SseEvent>>;

/// Line-oriented SSE field accumulator.
#[derive(Debug, Default)]
pub struct SseDecoder {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    pending: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator); a blank line dispatches.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => return None,
        }
        self.pending = true;
        None
    }

    /// Flushes a final event left without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !std::mem::take(&mut self.pending) {
            return None;
        }
        let event = SseEvent {
            id: self.id.take().filter(|id| !id.is_empty()),
            event: self
                .event
                .take()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

/// Decodes a chunked response body into events.
pub fn decode_event_stream<S>(body: S) -> SseStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let stream = try_stream! {
        let mut body = Box::pin(body);
        let mut buf: Vec<u8> = Vec::new();
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let mut line = buf.drain(..=pos).collect::<Vec<u8>>();
                line.pop();
                if line.ends_with(b"\r") { line.pop(); }
                let line = String::from_utf8_lossy(&line);
                if let Some(event) = decoder.push_line(&line) {
                    yield event;
                }
            }
        }

        if !buf.is_empty() {
            let line = String::from_utf8_lossy(&buf).to_string();
            if let Some(event) = decoder.push_line(&line) {
                yield event;
            }
        }
        if let Some(event) = decoder.finish() {
            yield event;
        }
    };
    stream.boxed()
}
