use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::models::Bundle;
use crate::traits::BrokerSession;
use crate::{Error, Result};

/// Routing key of the connector's push queue.
pub fn routing_key(connector_id: &str) -> String {
    format!("push_routing_{connector_id}")
}

/// Envelope of one sub-bundle pushed to the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub applicant_id: Option<String>,
    /// 1-based position in the submission.
    pub action_sequence: usize,
    pub entities_types: Vec<String>,
    /// Base64 of the bundle JSON.
    pub content: String,
    pub update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
}

impl PushMessage {
    pub fn new(
        bundle: &Bundle,
        action_sequence: usize,
        applicant_id: Option<String>,
        entities_types: Vec<String>,
        update: bool,
        work_id: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            applicant_id,
            action_sequence,
            entities_types,
            content: STANDARD.encode(bundle.to_json()?),
            update,
            work_id,
        })
    }

    pub fn decode_content(&self) -> Result<Bundle> {
        let raw = STANDARD
            .decode(&self.content)
            .map_err(|e| Error::decode(format!("content is not base64: {e}")))?;
        let raw = String::from_utf8(raw)
            .map_err(|e| Error::decode(format!("content is not UTF-8: {e}")))?;
        Bundle::from_json(&raw)
    }
}

/// Pushes messages over one broker session, retrying rejected publishes.
pub struct BundlePublisher {
    session: Box<dyn BrokerSession>,
    exchange: String,
    routing_key: String,
    retry_delay: Duration,
}

impl BundlePublisher {
    pub fn new(
        session: Box<dyn BrokerSession>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            session,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            retry_delay,
        }
    }

    /// Publishes `message`, resending the identical body until the broker
    /// accepts it. Connection errors are returned.
    #[tracing::instrument(level = "debug", skip_all, fields(sequence = message.action_sequence))]
    pub async fn publish(&self, message: &PushMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        loop {
            match self
                .session
                .publish(&self.exchange, &self.routing_key, &body)
                .await
            {
                Ok(()) => {
                    tracing::info!(sequence = message.action_sequence, "bundle has been sent");
                    return Ok(());
                }
                Err(Error::PublishRejected(reason)) => {
                    tracing::error!(%reason, "unable to send bundle, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn close(self) -> Result<()> {
        self.session.close().await
    }
}
