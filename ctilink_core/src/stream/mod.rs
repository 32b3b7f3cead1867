//! Live stream consumption.

pub mod consumer;
pub mod sse;

pub use consumer::{StreamCallback, StreamConsumer, StreamOptions, StreamPhase, StreamTarget, stream_callback};
pub use sse::{SseDecoder, SseEvent, SseStream, decode_event_stream};

use std::fmt;

/// Everything an event source needs to open the feed.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Full URL, `from` cursor included.
    pub url: String,
    pub token: String,
    pub verify_ssl: bool,
    /// Sent as the `listen-delete` header.
    pub listen_delete: bool,
    /// Sent as the `no-dependencies` header.
    pub no_dependencies: bool,
}

impl StreamRequest {
    /// Header pairs the platform expects on a stream request.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("authorization", format!("Bearer {}", self.token)),
            ("listen-delete", self.listen_delete.to_string()),
            ("no-dependencies", self.no_dependencies.to_string()),
        ]
    }
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("listen_delete", &self.listen_delete)
            .field("no_dependencies", &self.no_dependencies)
            .finish()
    }
}
