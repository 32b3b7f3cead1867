//! Network adapters for `ctilink_core`: the platform GraphQL API, the live
//! event stream over HTTP and (behind `rabbitmq`) the AMQP broker.

pub mod graphql;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
pub mod sse_http;

pub use graphql::OpenCtiClient;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::{LapinBroker, LapinSession};
pub use sse_http::HttpEventSource;

#[cfg(feature = "rabbitmq")]
use std::sync::Arc;

#[cfg(feature = "rabbitmq")]
use ctilink_core::{Collaborators, PlatformConfig, Result};

/// Real collaborators for a connector talking to `platform`.
#[cfg(feature = "rabbitmq")]
pub fn collaborators(platform: &PlatformConfig) -> Result<Collaborators> {
    let client = Arc::new(OpenCtiClient::from_config(platform)?);
    Ok(Collaborators {
        control_plane: client.clone(),
        work: client,
        broker: Arc::new(LapinBroker::new()),
        events: Arc::new(HttpEventSource::new()),
    })
}
