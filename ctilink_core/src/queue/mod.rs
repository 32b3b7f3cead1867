//! Broker-facing side of the connector: work consumption and bundle push.

pub mod consumer;
pub mod publisher;

pub use consumer::{
    MessageCallback, MessageInternal, QueueConsumer, QueueConsumerConfig, QueueMessage,
    message_callback,
};
pub use publisher::{BundlePublisher, PushMessage, routing_key};
