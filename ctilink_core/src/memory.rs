//! In-memory collaborators for local development and unit tests.
//!
//! Every call is recorded and most operations accept failure injection, so
//! consumer loops can be driven end to end without a platform or a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::models::{
    BrokerSettings, ConnectorDescriptor, ConnectorUser, PendingFile, PingResponse, QueueConfig,
    Registration,
};
use crate::stream::{SseEvent, SseStream, StreamRequest};
use crate::traits::{
    Broker, BrokerSession, ControlPlane, Delivery, DeliveryStream, EventSource, WorkTracker,
};
use crate::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Takes one unit from an injected-failure budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct ControlPlaneState {
    remote_state: Option<String>,
    /// Set by `reset_remote_state`, handed back by the next ping.
    pending_reset: Option<Option<String>>,
    registered: Vec<ConnectorDescriptor>,
    unregistered: Vec<String>,
    pings: Vec<Option<Map<String, Value>>>,
    applicant_ids: Vec<Option<String>>,
    uploads: Vec<PendingFile>,
}

/// Control plane that stores whatever state is pinged to it, like the
/// platform does, unless a remote reset has been queued.
pub struct MemoryControlPlane {
    connector_user_id: Option<String>,
    queue: QueueConfig,
    failing_pings: AtomicUsize,
    inner: Mutex<ControlPlaneState>,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self {
            connector_user_id: Some("user--connector".to_string()),
            queue: QueueConfig {
                connection: BrokerSettings {
                    host: "localhost".to_string(),
                    port: 5672,
                    user: "guest".to_string(),
                    pass: "guest".to_string(),
                    use_ssl: false,
                },
                listen: "listen_memory".to_string(),
                push_exchange: "amqp.worker.exchange".to_string(),
            },
            failing_pings: AtomicUsize::new(0),
            inner: Mutex::new(ControlPlaneState::default()),
        }
    }

    /// State handed back at registration.
    pub fn with_remote_state(self, raw: impl Into<String>) -> Self {
        lock(&self.inner).remote_state = Some(raw.into());
        self
    }

    pub fn with_listen_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue.listen = queue.into();
        self
    }

    pub fn without_connector_user(mut self) -> Self {
        self.connector_user_id = None;
        self
    }

    /// Emulates an operator resetting the state from the platform UI.
    pub fn reset_remote_state(&self, raw: Option<String>) {
        lock(&self.inner).pending_reset = Some(raw);
    }

    pub fn fail_next_pings(&self, count: usize) {
        self.failing_pings.store(count, Ordering::SeqCst);
    }

    pub fn remote_state(&self) -> Option<String> {
        lock(&self.inner).remote_state.clone()
    }

    pub fn registered(&self) -> Vec<ConnectorDescriptor> {
        lock(&self.inner).registered.clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        lock(&self.inner).unregistered.clone()
    }

    /// Local state carried by each successful or failed ping, in order.
    pub fn pings(&self) -> Vec<Option<Map<String, Value>>> {
        lock(&self.inner).pings.clone()
    }

    pub fn applicant_ids(&self) -> Vec<Option<String>> {
        lock(&self.inner).applicant_ids.clone()
    }

    pub fn uploads(&self) -> Vec<PendingFile> {
        lock(&self.inner).uploads.clone()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn register(&self, connector: &ConnectorDescriptor) -> Result<Registration> {
        let mut inner = lock(&self.inner);
        inner.registered.push(connector.clone());
        Ok(Registration {
            id: connector.id.clone(),
            connector_user: self
                .connector_user_id
                .clone()
                .map(|id| ConnectorUser { id }),
            connector_state: inner.remote_state.clone(),
            config: self.queue.clone(),
        })
    }

    async fn unregister(&self, connector_id: &str) -> Result<()> {
        lock(&self.inner).unregistered.push(connector_id.to_string());
        Ok(())
    }

    async fn ping(
        &self,
        _connector_id: &str,
        state: Option<&Map<String, Value>>,
    ) -> Result<PingResponse> {
        let mut inner = lock(&self.inner);
        inner.pings.push(state.cloned());
        if take_failure(&self.failing_pings) {
            return Err(Error::ControlPlane("ping refused".into()));
        }
        inner.remote_state = match inner.pending_reset.take() {
            Some(reset) => reset,
            None => state.map(serde_json::to_string).transpose()?,
        };
        Ok(PingResponse {
            connector_state: inner.remote_state.clone(),
        })
    }

    fn set_applicant_id(&self, applicant_id: Option<&str>) {
        lock(&self.inner)
            .applicant_ids
            .push(applicant_id.map(str::to_string));
    }

    async fn upload_pending_file(&self, file: &PendingFile) -> Result<()> {
        lock(&self.inner).uploads.push(file.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkCall {
    Received { work_id: String, message: String },
    Processed { work_id: String, message: String, in_error: bool },
    Expectations { work_id: String, count: usize },
    Ping { work_id: String },
}

#[derive(Default)]
pub struct MemoryWorkTracker {
    calls: Mutex<Vec<WorkCall>>,
    fail_processed: AtomicBool,
}

impl MemoryWorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WorkCall> {
        lock(&self.calls).clone()
    }

    pub fn pings(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, WorkCall::Ping { .. }))
            .count()
    }

    /// Makes every `to_processed` report fail after being recorded.
    pub fn fail_processed(&self, fail: bool) {
        self.fail_processed.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkTracker for MemoryWorkTracker {
    async fn to_received(&self, work_id: &str, message: &str) -> Result<()> {
        lock(&self.calls).push(WorkCall::Received {
            work_id: work_id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn to_processed(&self, work_id: &str, message: &str, in_error: bool) -> Result<()> {
        lock(&self.calls).push(WorkCall::Processed {
            work_id: work_id.to_string(),
            message: message.to_string(),
            in_error,
        });
        if self.fail_processed.load(Ordering::SeqCst) {
            return Err(Error::ControlPlane("work report refused".into()));
        }
        Ok(())
    }

    async fn add_expectations(&self, work_id: &str, expectations: usize) -> Result<()> {
        lock(&self.calls).push(WorkCall::Expectations {
            work_id: work_id.to_string(),
            count: expectations,
        });
        Ok(())
    }

    async fn ping(&self, work_id: &str) -> Result<()> {
        lock(&self.calls).push(WorkCall::Ping {
            work_id: work_id.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

type DeliveryReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Delivery>>>>;

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Result<Delivery>>,
    rx: DeliveryReceiver,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct BrokerShared {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    acks: Mutex<Vec<u64>>,
    published: Mutex<Vec<PublishedMessage>>,
    next_tag: AtomicU64,
    opens: AtomicUsize,
    closes: AtomicUsize,
    failing_opens: AtomicUsize,
    rejecting_publishes: AtomicUsize,
    rejected: AtomicUsize,
}

impl BrokerShared {
    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&MemoryQueue) -> R) -> R {
        let mut queues = lock(&self.queues);
        let q = queues
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);
        f(q)
    }
}

/// Broker whose queues survive reconnects, so a new session picks up where a
/// dropped one left off.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a raw message body; returns its delivery tag.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) -> u64 {
        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag: tag,
            body: body.into(),
        };
        self.shared.with_queue(queue, |q| {
            let _ = q.tx.send(Ok(delivery));
        });
        tag
    }

    pub fn enqueue_json(&self, queue: &str, body: &Value) -> u64 {
        self.enqueue(queue, body.to_string())
    }

    /// Breaks the current consumer of `queue` as a dropped connection would.
    pub fn drop_connection(&self, queue: &str) {
        self.shared.with_queue(queue, |q| {
            let _ = q
                .tx
                .send(Err(Error::TransportMessage("connection reset by peer".into())));
        });
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.shared.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn reject_next_publishes(&self, count: usize) {
        self.shared.rejecting_publishes.store(count, Ordering::SeqCst);
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.shared.acks).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.published).clone()
    }

    pub fn rejected(&self) -> usize {
        self.shared.rejected.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self, _settings: &BrokerSettings) -> Result<Box<dyn BrokerSession>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.shared.failing_opens) {
            return Err(Error::TransportMessage("connection refused".into()));
        }
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
        }))
    }
}

struct MemorySession {
    shared: Arc<BrokerShared>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let rx = self.shared.with_queue(queue, |q| q.rx.clone());
        let deliveries = stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|item| (item, rx))
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        lock(&self.shared.acks).push(delivery_tag);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        if take_failure(&self.shared.rejecting_publishes) {
            self.shared.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::PublishRejected("message returned unroutable".into()));
        }
        lock(&self.shared.published).push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Event feed fed by the test: push events, then close or fail it.
pub struct MemoryEventSource {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<SseEvent>>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<SseEvent>>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A feed that delivers `events` and then closes.
    pub fn with_events(events: impl IntoIterator<Item = SseEvent>) -> Self {
        let source = Self::new();
        for event in events {
            source.push(event);
        }
        source.close();
        source
    }

    pub fn push(&self, event: SseEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    /// Ends the feed with a network failure.
    pub fn fail(&self, message: &str) {
        if let Some(tx) = lock(&self.tx).take() {
            let _ = tx.send(Err(Error::TransportMessage(message.to_string())));
        }
    }

    /// Ends the feed as an upstream close.
    pub fn close(&self) {
        lock(&self.tx).take();
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn connect(&self, request: &StreamRequest) -> Result<SseStream> {
        lock(&self.requests).push(request.clone());
        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| Error::TransportMessage("feed already consumed".into()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
