//! ctilink core: connector runtime for a threat-intelligence platform.
//!
//! Consumes work from the connector queue, keeps the connector alive with the
//! control plane, tails the live event stream and splits STIX bundles into
//! ordered sub-bundles for the workers.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod models;
pub mod o11y;
pub mod queue;
pub mod runtime;
pub mod splitter;
pub mod state;
pub mod stix;
pub mod stream;
pub mod tlp;
pub mod traits;

pub use config::{ConfigSource, ConnectorConfig, ConnectorSettings, PlatformConfig};
pub use error::{Error, Result};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use models::{
    Bundle, BrokerSettings, ConnectorDescriptor, ConnectorType, ConnectorUser, PendingFile, PingResponse,
    QueueConfig, Registration, StixObject,
};
pub use queue::{MessageCallback, PushMessage, QueueConsumerConfig, message_callback};
pub use runtime::{Collaborators, ConnectorRuntime, RuntimeOptions, SubmitOptions};
pub use splitter::{split_bundle, split_bundle_json};
pub use state::ConnectorStateStore;
pub use stream::{SseEvent, StreamCallback, StreamOptions, StreamPhase, StreamRequest, stream_callback};
pub use tlp::{Tlp, check_max_tlp};
pub use traits::{Broker, BrokerSession, ControlPlane, Delivery, DeliveryStream, EventSource, WorkTracker};
