//! Collaborator seams: control plane, work tracking, broker and event feed.
//!
//! Real adapters live in `ctilink_integrations`; in-memory versions for local
//! development and tests live in [`crate::memory`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

use crate::Result;
use crate::models::{
    BrokerSettings, ConnectorDescriptor, PendingFile, PingResponse, Registration,
};
use crate::stream::{SseStream, StreamRequest};

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register (or re-register) the connector and fetch its queue configuration.
    async fn register(&self, connector: &ConnectorDescriptor) -> Result<Registration>;

    async fn unregister(&self, connector_id: &str) -> Result<()>;

    /// Liveness ping carrying the local state; returns the remote copy.
    async fn ping(
        &self,
        connector_id: &str,
        state: Option<&Map<String, Value>>,
    ) -> Result<PingResponse>;

    /// Identity subsequent API calls act on behalf of. `None` resets it.
    fn set_applicant_id(&self, applicant_id: Option<&str>);

    /// Hands a bundle over for manual validation instead of importing it.
    async fn upload_pending_file(&self, file: &PendingFile) -> Result<()>;
}

#[async_trait]
pub trait WorkTracker: Send + Sync {
    async fn to_received(&self, work_id: &str, message: &str) -> Result<()>;

    async fn to_processed(&self, work_id: &str, message: &str, in_error: bool) -> Result<()>;

    async fn add_expectations(&self, work_id: &str, expectations: usize) -> Result<()>;

    /// Keeps a long-running unit of work from being considered abandoned.
    async fn ping(&self, work_id: &str) -> Result<()>;
}

/// A message handed out by the broker, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection and channel owned by the caller.
    async fn open(&self, settings: &BrokerSettings) -> Result<Box<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Publishes a persistent message. A negative acknowledgement or an
    /// unroutable return surfaces as `Error::PublishRejected`.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Opens the long-lived event feed described by `request`.
    async fn connect(&self, request: &StreamRequest) -> Result<SseStream>;
}
