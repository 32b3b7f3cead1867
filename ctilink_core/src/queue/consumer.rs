use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::BrokerSettings;
use crate::runtime::ConnectorContext;
use crate::runtime::supervisor::panic_message;
use crate::traits::{Broker, BrokerSession, Delivery, WorkTracker};
use crate::{Error, Result};

/// Processes the `event` of a queue message; the returned text is reported
/// as the work outcome.
pub type MessageCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String>> + Send + Sync>;

pub fn message_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    /// Wait before reconnecting after a broker failure.
    pub reconnect_backoff: Duration,
    /// Work ping period while a message is being processed.
    pub work_ping_interval: Duration,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            work_ping_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueMessage {
    pub internal: MessageInternal,
    #[serde(default)]
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageInternal {
    pub work_id: String,
    #[serde(default)]
    pub applicant_id: Option<String>,
}

const RECEIVED_MESSAGE: &str = "Connector ready to process the operation";

/// Consumes the connector queue one message at a time.
///
/// Each message is acknowledged as soon as it decodes, then handed to a
/// worker task; the next delivery is only read once that worker finished.
pub struct QueueConsumer {
    ctx: Arc<ConnectorContext>,
    broker: Arc<dyn Broker>,
    work: Arc<dyn WorkTracker>,
    settings: BrokerSettings,
    queue: String,
    callback: MessageCallback,
    cfg: QueueConsumerConfig,
}

impl QueueConsumer {
    pub fn new(
        ctx: Arc<ConnectorContext>,
        broker: Arc<dyn Broker>,
        work: Arc<dyn WorkTracker>,
        settings: BrokerSettings,
        queue: impl Into<String>,
        callback: MessageCallback,
        cfg: QueueConsumerConfig,
    ) -> Self {
        Self {
            ctx,
            broker,
            work,
            settings,
            queue: queue.into(),
            callback,
            cfg,
        }
    }

    /// Consumes until `cancel` fires, reconnecting after broker failures.
    #[tracing::instrument(level = "info", skip_all, fields(queue = %self.queue))]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("starting queue consumer");
        while !cancel.is_cancelled() {
            match self.consume(&cancel).await {
                Ok(()) => break,
                Err(e) => tracing::error!(%e, "queue consumer lost its broker connection"),
            }
            tracing::info!(
                backoff_secs = self.cfg.reconnect_backoff.as_secs(),
                "reconnecting to the broker"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.reconnect_backoff) => {}
            }
        }
        tracing::info!("queue consumer stopped");
        Ok(())
    }

    /// One broker session. `Ok` only when cancelled.
    async fn consume(&self, cancel: &CancellationToken) -> Result<()> {
        let session = self.broker.open(&self.settings).await?;
        let result = self.drain(session.as_ref(), cancel).await;
        if let Err(e) = session.close().await {
            tracing::debug!(%e, "closing broker session failed");
        }
        result
    }

    async fn drain(&self, session: &dyn BrokerSession, cancel: &CancellationToken) -> Result<()> {
        let mut deliveries = session.consume(&self.queue).await?;
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = deliveries.next() => match next {
                    Some(delivery) => delivery?,
                    None => return Err(Error::TransportMessage("delivery stream closed".into())),
                },
            };
            self.process_delivery(session, delivery).await?;
        }
    }

    /// Acknowledges, dispatches and waits for one message. Only broker errors
    /// are returned; processing failures go to the work tracker.
    #[tracing::instrument(level = "debug", skip_all, fields(delivery_tag = delivery.delivery_tag))]
    async fn process_delivery(&self, session: &dyn BrokerSession, delivery: Delivery) -> Result<()> {
        let message: QueueMessage = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                session.ack(delivery.delivery_tag).await?;
                tracing::error!(%e, "dropping undecodable message");
                return Ok(());
            }
        };
        session.ack(delivery.delivery_tag).await?;

        let QueueMessage { internal, event } = message;
        if let Some(applicant_id) = internal.applicant_id.as_deref() {
            self.ctx.set_applicant_id(applicant_id);
        }
        self.ctx.set_work_id(Some(internal.work_id.clone()));

        let worker = tokio::spawn(process_message(
            self.work.clone(),
            self.callback.clone(),
            internal.work_id.clone(),
            event,
        ));
        self.supervise_worker(&internal.work_id, worker).await;
        tracing::info!(
            delivery_tag = delivery.delivery_tag,
            "message processed, worker terminated"
        );
        Ok(())
    }

    /// Waits for the worker, pinging the work unit while it runs.
    async fn supervise_worker(&self, work_id: &str, mut worker: JoinHandle<()>) {
        let period = self.cfg.work_ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                joined = &mut worker => {
                    if let Err(e) = joined {
                        let message = if e.is_panic() {
                            format!("worker panicked: {}", panic_message(e.into_panic().as_ref()))
                        } else {
                            "worker was cancelled".to_string()
                        };
                        tracing::error!(%work_id, %message, "error in message processing, reporting error to API");
                        report_failure(self.work.as_ref(), work_id, &message).await;
                    }
                    return;
                }
                _ = ping.tick() => {
                    if let Err(e) = self.work.ping(work_id).await {
                        tracing::warn!(%work_id, %e, "work ping failed");
                    }
                }
            }
        }
    }
}

async fn process_message(
    work: Arc<dyn WorkTracker>,
    callback: MessageCallback,
    work_id: String,
    event: Value,
) {
    let outcome = async {
        work.to_received(&work_id, RECEIVED_MESSAGE).await?;
        callback(event).await
    }
    .await;

    match outcome {
        Ok(message) => {
            if let Err(e) = work.to_processed(&work_id, &message, false).await {
                tracing::error!(%work_id, %e, "failing reporting the processing");
            }
        }
        Err(e) => {
            tracing::error!(%work_id, %e, "error in message processing, reporting error to API");
            let message = match e {
                Error::Callback(message) => message,
                other => other.to_string(),
            };
            report_failure(work.as_ref(), &work_id, &message).await;
        }
    }
}

async fn report_failure(work: &dyn WorkTracker, work_id: &str, message: &str) {
    if let Err(e) = work.to_processed(work_id, message, true).await {
        tracing::error!(%work_id, %e, "failing reporting the processing");
    }
}
