//! Connector runtime: registration, component lifecycle and bundle submission.

pub mod context;
pub mod supervisor;

pub use context::ConnectorContext;
pub use supervisor::{ComponentFailure, ComponentHandle, FailureReporter, spawn_component};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectorConfig;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::models::{Bundle, PendingFile, QueueConfig};
use crate::queue::{BundlePublisher, MessageCallback, PushMessage, QueueConsumer, QueueConsumerConfig, routing_key};
use crate::splitter::split_bundle;
use crate::state::ConnectorStateStore;
use crate::stream::{StreamCallback, StreamConsumer, StreamOptions, StreamPhase, StreamTarget};
use crate::traits::{Broker, ControlPlane, EventSource, WorkTracker};
use crate::{Error, Result};

/// External systems the runtime talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub control_plane: Arc<dyn ControlPlane>,
    pub work: Arc<dyn WorkTracker>,
    pub broker: Arc<dyn Broker>,
    pub events: Arc<dyn EventSource>,
}

/// Options of a single `submit` call.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Work unit the sub-bundles belong to; defaults to the message in progress.
    pub work_id: Option<String>,
    /// Forwarded to the workers with every sub-bundle.
    pub entities_types: Vec<String>,
    /// Upsert instead of create.
    pub update: bool,
    /// Publish the bundle as one message.
    pub bypass_split: bool,
    /// Import directly even when validation before import is configured.
    pub bypass_validation: bool,
    /// Entity the pending file is attached to.
    pub entity_id: Option<String>,
    /// Pending file name; defaults to `<work_id>.json`.
    pub file_name: Option<String>,
}

/// Tunables that are not part of the connector configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub queue: QueueConsumerConfig,
    /// Delay before resending a message the broker rejected.
    pub publish_retry_delay: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            queue: QueueConsumerConfig::default(),
            publish_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct Components {
    heartbeat: Option<ComponentHandle>,
    queue: Option<ComponentHandle>,
    stream: Option<ComponentHandle>,
}

/// A registered connector and the loops it runs.
pub struct ConnectorRuntime {
    config: ConnectorConfig,
    collaborators: Collaborators,
    ctx: Arc<ConnectorContext>,
    queue_config: QueueConfig,
    options: RuntimeOptions,
    heartbeat: Arc<HeartbeatMonitor>,
    components: Mutex<Components>,
    shutdown: CancellationToken,
    reporter: FailureReporter,
    failures: Mutex<mpsc::UnboundedReceiver<ComponentFailure>>,
    stopped: AtomicBool,
}

impl ConnectorRuntime {
    pub async fn register(config: ConnectorConfig, collaborators: Collaborators) -> Result<Self> {
        Self::register_with(config, collaborators, RuntimeOptions::default()).await
    }

    /// Registers the connector and starts the heartbeat (unless the
    /// connector runs once and terminates).
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %config.connector.id))]
    pub async fn register_with(
        config: ConnectorConfig,
        collaborators: Collaborators,
        options: RuntimeOptions,
    ) -> Result<Self> {
        config.validate()?;
        let control_plane = collaborators.control_plane.clone();
        let registration = control_plane.register(&config.descriptor()).await?;
        tracing::info!(
            connector_type = %config.connector.connector_type,
            listen = %registration.config.listen,
            "connector registered"
        );

        let connector_user_id = registration.connector_user_id().map(str::to_string);
        if let Some(user_id) = connector_user_id.as_deref() {
            control_plane.set_applicant_id(Some(user_id));
        }
        let ctx = Arc::new(ConnectorContext::new(
            config.connector.id.clone(),
            ConnectorStateStore::new(registration.connector_state),
            control_plane,
            connector_user_id,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            ctx.clone(),
            HeartbeatConfig {
                interval: config.heartbeat_interval(),
            },
        ));
        let (reporter, failures) = FailureReporter::channel();
        let shutdown = CancellationToken::new();

        let mut components = Components::default();
        if !config.connector.run_and_terminate {
            let token = shutdown.child_token();
            let monitor = heartbeat.clone();
            components.heartbeat = Some(spawn_component(
                "heartbeat",
                token.clone(),
                Some(reporter.clone()),
                async move {
                    monitor.run(token).await;
                    Ok(())
                },
            ));
        }

        Ok(Self {
            config,
            collaborators,
            ctx,
            queue_config: registration.config,
            options,
            heartbeat,
            components: Mutex::new(components),
            shutdown,
            reporter,
            failures: Mutex::new(failures),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn connector_id(&self) -> &str {
        self.ctx.connector_id()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue_config
    }

    pub fn applicant_id(&self) -> Option<String> {
        self.ctx.applicant_id()
    }

    /// Work unit of the queue message being processed, if any.
    pub fn work_id(&self) -> Option<String> {
        self.ctx.work_id()
    }

    /// Starts consuming the connector queue.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn listen(&self, callback: MessageCallback) -> Result<()> {
        let mut components = self.components.lock().await;
        self.ensure_running()?;
        if components.queue.is_some() {
            return Err(Error::InvalidInput("queue consumer already started".into()));
        }
        let consumer = QueueConsumer::new(
            self.ctx.clone(),
            self.collaborators.broker.clone(),
            self.collaborators.work.clone(),
            self.queue_config.connection.clone(),
            self.queue_config.listen.clone(),
            callback,
            self.options.queue.clone(),
        );
        let token = self.shutdown.child_token();
        components.queue = Some(spawn_component(
            "queue",
            token.clone(),
            Some(self.reporter.clone()),
            consumer.run(token),
        ));
        Ok(())
    }

    /// Starts tailing the live stream; the receiver tracks its phase.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn listen_stream(
        &self,
        callback: StreamCallback,
        options: StreamOptions,
    ) -> Result<watch::Receiver<StreamPhase>> {
        let mut components = self.components.lock().await;
        self.ensure_running()?;
        if components.stream.is_some() {
            return Err(Error::InvalidInput("stream consumer already started".into()));
        }
        let consumer = StreamConsumer::new(
            self.ctx.clone(),
            self.collaborators.events.clone(),
            StreamTarget::resolve(&self.config, &options),
            options.start_timestamp.clone(),
            callback,
        );
        let phase = consumer.phase();
        let token = self.shutdown.child_token();
        components.stream = Some(spawn_component(
            "stream",
            token.clone(),
            Some(self.reporter.clone()),
            consumer.run(token),
        ));
        Ok(phase)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("connector runtime is stopped".into()));
        }
        Ok(())
    }

    pub async fn submit_json(&self, raw: &str, options: SubmitOptions) -> Result<Vec<Bundle>> {
        let bundle = Bundle::from_json(raw)?;
        self.submit(&bundle, options).await
    }

    /// Splits `bundle` and publishes the parts in order, returning them.
    ///
    /// With validation before import configured, the bundle is uploaded as a
    /// pending file instead and nothing is returned.
    #[tracing::instrument(level = "info", skip_all, fields(objects = bundle.len()))]
    pub async fn submit(&self, bundle: &Bundle, options: SubmitOptions) -> Result<Vec<Bundle>> {
        let work_id = options.work_id.clone().or_else(|| self.ctx.work_id());
        let file_name = options
            .file_name
            .clone()
            .or_else(|| work_id.as_ref().map(|w| format!("{w}.json")));

        if self.config.connector.validate_before_import && !options.bypass_validation {
            if let Some(file_name) = file_name {
                let file = PendingFile {
                    file_name,
                    data: bundle.to_json()?,
                    mime_type: "application/json".to_string(),
                    entity_id: options.entity_id.clone(),
                };
                self.collaborators
                    .control_plane
                    .upload_pending_file(&file)
                    .await?;
                tracing::info!(file_name = %file.file_name, "bundle uploaded for validation");
                return Ok(Vec::new());
            }
        }

        let bundles = if options.bypass_split {
            if bundle.is_empty() {
                Vec::new()
            } else {
                vec![bundle.clone()]
            }
        } else {
            split_bundle(bundle)
        };
        if bundles.is_empty() {
            return Err(Error::NothingToImport);
        }

        if let Some(work_id) = &work_id {
            self.collaborators
                .work
                .add_expectations(work_id, bundles.len())
                .await?;
        }

        let session = self
            .collaborators
            .broker
            .open(&self.queue_config.connection)
            .await?;
        let publisher = BundlePublisher::new(
            session,
            self.queue_config.push_exchange.clone(),
            routing_key(self.connector_id()),
            self.options.publish_retry_delay,
        );
        let applicant_id = self.ctx.applicant_id();
        let published = async {
            for (idx, part) in bundles.iter().enumerate() {
                let message = PushMessage::new(
                    part,
                    idx + 1,
                    applicant_id.clone(),
                    options.entities_types.clone(),
                    options.update,
                    work_id.clone(),
                )?;
                publisher.publish(&message).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = publisher.close().await {
            tracing::debug!(%e, "closing publish session failed");
        }
        published?;

        tracing::info!(bundles = bundles.len(), "bundle submitted");
        Ok(bundles)
    }

    /// Current connector state; `None` when absent or not a JSON object.
    pub async fn get_state(&self) -> Option<Map<String, Value>> {
        self.ctx.state().get().await
    }

    /// Replaces the connector state; `None` clears it. The heartbeat sends it
    /// with its next ping.
    pub async fn set_state(&self, state: Option<&Map<String, Value>>) -> Result<()> {
        match state {
            Some(state) => self.ctx.state().set(state).await,
            None => {
                self.ctx.state().replace_raw(None).await;
                Ok(())
            }
        }
    }

    /// Pushes the local state right away instead of waiting for the heartbeat.
    pub async fn force_ping(&self) -> Result<()> {
        self.heartbeat.force_ping().await.inspect_err(|e| {
            tracing::error!(%e, "error pinging the API");
        })
    }

    /// Stops every component and unregisters. Idempotent.
    ///
    /// Waits for the queue worker in flight and the current heartbeat ping;
    /// the stream only notices at its next event.
    #[tracing::instrument(level = "info", skip_all, fields(connector_id = %self.ctx.connector_id()))]
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("preparing for clean shutdown");
        let mut components = self.components.lock().await;
        if let Some(stream) = components.stream.take() {
            stream.signal_stop();
        }
        if let Some(queue) = components.queue.take() {
            queue.stop().await;
        }
        if let Some(heartbeat) = components.heartbeat.take() {
            heartbeat.stop().await;
        }
        drop(components);
        self.shutdown.cancel();

        self.collaborators
            .control_plane
            .unregister(self.connector_id())
            .await?;
        tracing::info!("connector unregistered");
        Ok(())
    }

    /// Runs until `shutdown` resolves or a component fails, then stops.
    ///
    /// A component failure is returned after the orderly stop.
    pub async fn supervise<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let failure = {
            let mut failures = self.failures.lock().await;
            tokio::select! {
                _ = shutdown => {
                    tracing::info!("shutdown requested");
                    None
                }
                failure = failures.recv() => failure,
            }
        };

        let stopped = self.stop().await;
        match failure {
            Some(failure) => {
                if let Err(e) = stopped {
                    tracing::error!(%e, "orderly shutdown after component failure failed");
                }
                Err(Error::ComponentFailed {
                    component: failure.component.to_string(),
                    message: failure.message,
                })
            }
            None => stopped,
        }
    }
}
