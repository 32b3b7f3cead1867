use async_trait::async_trait;
use ctilink_core::stream::{SseStream, StreamRequest, decode_event_stream};
use ctilink_core::traits::EventSource;
use ctilink_core::{Error, Result};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use tracing::instrument;

/// Live stream over HTTP server-sent events.
#[derive(Debug, Clone, Default)]
pub struct HttpEventSource;

impl HttpEventSource {
    pub fn new() -> Self {
        Self
    }
}

fn request_headers(request: &StreamRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    for (name, value) in request.headers() {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::InvalidInput(format!("header {name}: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

#[async_trait]
impl EventSource for HttpEventSource {
    #[instrument(level = "info", skip_all, fields(url = %request.url))]
    async fn connect(&self, request: &StreamRequest) -> Result<SseStream> {
        // Certificate checking is per client in reqwest, and the feed is opened once per run.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!request.verify_ssl)
            .build()
            .map_err(|e| Error::transport("build http client", e))?;
        let resp = http
            .get(&request.url)
            .headers(request_headers(request)?)
            .send()
            .await
            .map_err(|e| Error::transport("connect live stream", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::TransportMessage(format!(
                "live stream returned {status}: {text}"
            )));
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::transport("read live stream", e)));
        Ok(decode_event_stream(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_headers_include_auth_and_flags() {
        let headers = request_headers(&StreamRequest {
            url: "http://platform/stream/live?from=0".into(),
            token: "tok".into(),
            verify_ssl: true,
            listen_delete: true,
            no_dependencies: false,
        })
        .unwrap();
        assert_eq!(headers[ACCEPT], "text/event-stream");
        assert_eq!(headers["authorization"], "Bearer tok");
        assert_eq!(headers["listen-delete"], "true");
        assert_eq!(headers["no-dependencies"], "false");
    }
}
