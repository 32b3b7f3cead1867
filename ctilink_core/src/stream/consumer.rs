use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{SseEvent, SseStream, StreamRequest};
use crate::config::ConnectorConfig;
use crate::runtime::ConnectorContext;
use crate::state::{CURSOR_START, LAST_EVENT_ID_KEY};
use crate::traits::EventSource;
use crate::{Error, Result};

/// Handler for data events. An error ends the stream.
pub type StreamCallback = Arc<dyn Fn(SseEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn stream_callback<F, Fut>(f: F) -> StreamCallback
where
    F: Fn(SseEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Per-call overrides for `ConnectorRuntime::listen_stream`. Unset fields
/// fall back to the connector configuration.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Remote platform base URL; only used together with `token`.
    pub url: Option<String>,
    pub token: Option<String>,
    pub verify_ssl: Option<bool>,
    /// Unix timestamp (ms) to start from when no cursor is checkpointed yet.
    pub start_timestamp: Option<String>,
    pub live_stream_id: Option<String>,
    pub listen_delete: Option<bool>,
    pub no_dependencies: Option<bool>,
}

/// Resolved feed location and filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub base_url: String,
    token: String,
    pub verify_ssl: bool,
    pub stream_id: Option<String>,
    pub listen_delete: bool,
    pub no_dependencies: bool,
}

impl StreamTarget {
    pub fn resolve(cfg: &ConnectorConfig, opts: &StreamOptions) -> Self {
        let (base_url, token, default_verify) = match (&opts.url, &opts.token) {
            (Some(url), Some(token)) => (url.clone(), token.clone(), true),
            _ => (
                cfg.opencti.url.clone(),
                cfg.opencti.token.clone(),
                cfg.opencti.ssl_verify,
            ),
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            verify_ssl: opts.verify_ssl.unwrap_or(default_verify),
            stream_id: opts
                .live_stream_id
                .clone()
                .or_else(|| cfg.connector.live_stream_id.clone()),
            listen_delete: opts
                .listen_delete
                .unwrap_or(cfg.connector.live_stream_listen_delete),
            no_dependencies: opts
                .no_dependencies
                .unwrap_or(cfg.connector.live_stream_no_dependencies),
        }
    }

    /// Feed URL resuming after `cursor`.
    ///
    /// A dedicated stream starts from its own beginning when `from` is
    /// omitted; the global stream needs an explicit `from=0`.
    pub fn url(&self, cursor: &str) -> String {
        let fresh = cursor == CURSOR_START;
        match &self.stream_id {
            Some(id) if fresh => format!("{}/stream/{id}", self.base_url),
            Some(id) => format!("{}/stream/{id}?from={cursor}", self.base_url),
            None if fresh => format!("{}/stream?from=0", self.base_url),
            None => format!("{}/stream?from={cursor}", self.base_url),
        }
    }

    pub fn request(&self, cursor: &str) -> StreamRequest {
        StreamRequest {
            url: self.url(cursor),
            token: self.token.clone(),
            verify_ssl: self.verify_ssl,
            listen_delete: self.listen_delete,
            no_dependencies: self.no_dependencies,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Starting,
    Streaming,
    Stopped,
}

/// Tails the live stream, checkpointing the cursor after each handled event.
pub struct StreamConsumer {
    ctx: Arc<ConnectorContext>,
    source: Arc<dyn EventSource>,
    target: StreamTarget,
    start_timestamp: Option<String>,
    callback: StreamCallback,
    phase: watch::Sender<StreamPhase>,
}

impl StreamConsumer {
    pub fn new(
        ctx: Arc<ConnectorContext>,
        source: Arc<dyn EventSource>,
        target: StreamTarget,
        start_timestamp: Option<String>,
        callback: StreamCallback,
    ) -> Self {
        let (phase, _) = watch::channel(StreamPhase::Starting);
        Self {
            ctx,
            source,
            target,
            start_timestamp,
            callback,
            phase,
        }
    }

    pub fn phase(&self) -> watch::Receiver<StreamPhase> {
        self.phase.subscribe()
    }

    /// Runs until upstream close, a feed failure, a callback failure, or
    /// `cancel` (observed once per event; a blocked read is not interrupted).
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %self.ctx.connector_id()))]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let result = self.stream(&cancel).await;
        self.phase.send_replace(StreamPhase::Stopped);
        result
    }

    async fn stream(&self, cancel: &CancellationToken) -> Result<()> {
        let cursor = self.initial_cursor().await?;
        let request = self.target.request(&cursor);
        tracing::info!(
            url = %request.url,
            verify_ssl = request.verify_ssl,
            listen_delete = request.listen_delete,
            no_dependencies = request.no_dependencies,
            "starting listening stream events"
        );
        let mut events: SseStream = self.source.connect(&request).await?;
        self.phase.send_replace(StreamPhase::Streaming);

        while let Some(event) = events.next().await {
            let event = event?;
            if cancel.is_cancelled() {
                tracing::info!("live stream stopped");
                return Ok(());
            }
            self.handle(event).await?;
        }
        tracing::info!("live stream closed by upstream");
        Ok(())
    }

    /// Checkpointed cursor, seeding the state when none exists.
    async fn initial_cursor(&self) -> Result<String> {
        let state = self.ctx.state();
        if state.get().await.is_none() {
            let start = match self.start_timestamp.as_deref() {
                Some(ts) if !ts.is_empty() => format!("{ts}-0"),
                _ => CURSOR_START.to_string(),
            };
            let mut seeded = Map::new();
            seeded.insert(LAST_EVENT_ID_KEY.to_string(), Value::String(start));
            state.set(&seeded).await?;
        }
        Ok(state
            .last_event_id()
            .await
            .unwrap_or_else(|| CURSOR_START.to_string()))
    }

    async fn handle(&self, event: SseEvent) -> Result<()> {
        match event.event.as_str() {
            "heartbeat" | "connected" => Ok(()),
            "sync" => match &event.id {
                Some(id) => self.ctx.state().checkpoint(id).await,
                None => Ok(()),
            },
            _ => {
                let id = event.id.clone();
                (self.callback)(event).await.map_err(|e| match e {
                    Error::Callback(_) => e,
                    other => Error::callback(other.to_string()),
                })?;
                match id {
                    Some(id) => self.ctx.state().checkpoint(&id).await,
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryControlPlane, MemoryEventSource};
    use crate::models::ConnectorType;
    use crate::state::ConnectorStateStore;
    use std::sync::Mutex;

    fn config() -> ConnectorConfig {
        ConnectorConfig::new(
            "http://opencti:8080/",
            "token",
            "connector-1",
            "Stream",
            ConnectorType::Stream,
        )
    }

    fn ctx(raw: Option<&str>) -> Arc<ConnectorContext> {
        Arc::new(ConnectorContext::new(
            "connector-1",
            ConnectorStateStore::new(raw.map(str::to_string)),
            Arc::new(MemoryControlPlane::new()),
            None,
        ))
    }

    fn recording() -> (StreamCallback, Arc<Mutex<Vec<SseEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb = stream_callback({
            let seen = seen.clone();
            move |event| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(event);
                    Ok(())
                }
            }
        });
        (cb, seen)
    }

    #[test]
    fn url_resolution_follows_stream_kind_and_cursor() {
        let mut cfg = config();
        let global = StreamTarget::resolve(&cfg, &StreamOptions::default());
        assert_eq!(global.url("-"), "http://opencti:8080/stream?from=0");
        assert_eq!(global.url("12-0"), "http://opencti:8080/stream?from=12-0");

        cfg.connector.live_stream_id = Some("live-1".into());
        let live = StreamTarget::resolve(&cfg, &StreamOptions::default());
        assert_eq!(live.url("-"), "http://opencti:8080/stream/live-1");
        assert_eq!(live.url("12-0"), "http://opencti:8080/stream/live-1?from=12-0");

        let remote = StreamTarget::resolve(
            &cfg,
            &StreamOptions {
                url: Some("https://remote".into()),
                token: Some("remote-token".into()),
                live_stream_id: Some("live-2".into()),
                no_dependencies: Some(true),
                ..Default::default()
            },
        );
        let req = remote.request("-");
        assert_eq!(req.url, "https://remote/stream/live-2");
        assert_eq!(req.token, "remote-token");
        assert!(req.verify_ssl);
        assert!(req.listen_delete);
        assert!(req.no_dependencies);
        assert!(!format!("{req:?}").contains("remote-token"));
    }

    #[tokio::test]
    async fn data_events_reach_callback_and_move_the_cursor() {
        let source = Arc::new(MemoryEventSource::with_events([
            SseEvent::new(Some("10-0"), "create", r#"{"data":{}}"#),
            SseEvent::new(Some("10-0"), "sync", ""),
            SseEvent::new(None, "heartbeat", "1700000000"),
            SseEvent::new(Some("11-0"), "update", r#"{"data":{}}"#),
        ]));
        let ctx = ctx(Some(r#"{"connectorLastEventId":"-"}"#));
        let (cb, seen) = recording();
        let consumer = StreamConsumer::new(
            ctx.clone(),
            source.clone(),
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            None,
            cb,
        );
        let phase = consumer.phase();

        consumer.run(CancellationToken::new()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event, "create");
        assert_eq!(seen[1].event, "update");
        assert_eq!(ctx.state().last_event_id().await.as_deref(), Some("11-0"));
        assert_eq!(*phase.borrow(), StreamPhase::Stopped);
        assert_eq!(source.requests()[0].url, "http://opencti:8080/stream?from=0");
    }

    #[tokio::test]
    async fn sync_repositions_without_callback() {
        let source = Arc::new(MemoryEventSource::with_events([
            SseEvent::new(Some("3-0"), "connected", ""),
            SseEvent::new(Some("8-1"), "sync", ""),
            SseEvent::new(None, "sync", ""),
        ]));
        let ctx = ctx(Some(r#"{"connectorLastEventId":"2-0","other":true}"#));
        let (cb, seen) = recording();
        StreamConsumer::new(
            ctx.clone(),
            source.clone(),
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            None,
            cb,
        )
        .run(CancellationToken::new())
        .await
        .unwrap();

        assert!(seen.lock().unwrap().is_empty());
        let state = ctx.state().get().await.unwrap();
        assert_eq!(state["connectorLastEventId"], "8-1");
        assert_eq!(state["other"], true);
        assert_eq!(source.requests()[0].url, "http://opencti:8080/stream?from=2-0");
    }

    #[tokio::test]
    async fn missing_state_is_seeded_from_start_timestamp() {
        let source = Arc::new(MemoryEventSource::with_events(Vec::new()));
        let ctx = ctx(None);
        let (cb, _) = recording();
        StreamConsumer::new(
            ctx.clone(),
            source.clone(),
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            Some("1700000000000".into()),
            cb,
        )
        .run(CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(
            ctx.state().last_event_id().await.as_deref(),
            Some("1700000000000-0")
        );
        assert_eq!(
            source.requests()[0].url,
            "http://opencti:8080/stream?from=1700000000000-0"
        );
    }

    #[tokio::test]
    async fn callback_failure_ends_the_stream_before_checkpoint() {
        let source = Arc::new(MemoryEventSource::with_events([
            SseEvent::new(Some("1-0"), "create", "{}"),
            SseEvent::new(Some("2-0"), "create", "{}"),
            SseEvent::new(Some("3-0"), "create", "{}"),
        ]));
        let ctx = ctx(Some(r#"{"connectorLastEventId":"-"}"#));
        let calls = Arc::new(Mutex::new(0usize));
        let cb = stream_callback({
            let calls = calls.clone();
            move |event: SseEvent| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    if event.id.as_deref() == Some("2-0") {
                        return Err(Error::InvalidInput("unexpected entity".into()));
                    }
                    Ok(())
                }
            }
        });

        let err = StreamConsumer::new(
            ctx.clone(),
            source,
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            None,
            cb,
        )
        .run(CancellationToken::new())
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Callback(_)));
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(ctx.state().last_event_id().await.as_deref(), Some("1-0"));
    }

    #[tokio::test]
    async fn stop_is_observed_at_the_next_event() {
        let source = Arc::new(MemoryEventSource::new());
        let ctx = ctx(Some(r#"{"connectorLastEventId":"-"}"#));
        let (handled_tx, mut handled) = tokio::sync::mpsc::unbounded_channel();
        let cb = stream_callback(move |event: SseEvent| {
            let handled_tx = handled_tx.clone();
            async move {
                let _ = handled_tx.send(event.id);
                Ok(())
            }
        });
        let consumer = StreamConsumer::new(
            ctx.clone(),
            source.clone(),
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            None,
            cb,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        source.push(SseEvent::new(Some("1-0"), "create", "{}"));
        assert_eq!(handled.recv().await.unwrap().as_deref(), Some("1-0"));
        cancel.cancel();
        source.push(SseEvent::new(Some("2-0"), "create", "{}"));

        task.await.unwrap().unwrap();
        assert!(handled.try_recv().is_err());
        assert_eq!(ctx.state().last_event_id().await.as_deref(), Some("1-0"));
    }

    #[tokio::test]
    async fn feed_failure_is_returned() {
        let source = Arc::new(MemoryEventSource::new());
        source.fail("connection reset");
        let (cb, _) = recording();
        let err = StreamConsumer::new(
            ctx(None),
            source,
            StreamTarget::resolve(&config(), &StreamOptions::default()),
            None,
            cb,
        )
        .run(CancellationToken::new())
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}
