use std::error::Error as StdError;

/// Common error type for `ctilink_core`.
///
/// Adapters (AMQP, HTTP) should preserve the underlying error chain where
/// possible via `Error::transport`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Broker or feed connection failure.
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("transport error: {0}")]
    TransportMessage(String),

    /// Malformed message or bundle payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// A user callback failed while processing a message or stream event.
    #[error("callback failed: {0}")]
    Callback(String),

    /// The broker refused an outbound message (negative ack or unroutable).
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("nothing to import")]
    NothingToImport,

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("unknown TLP marking: {0}")]
    UnknownTlp(String),

    #[error("component {component} failed: {message}")]
    ComponentFailed { component: String, message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transport(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::TransportMessage(_) | Self::PublishRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::transport("amqp connect", io);
        assert_eq!(err.to_string(), "transport error: amqp connect");
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("reset by peer"));
        assert!(err.is_transient());
    }

    #[test]
    fn content_errors_are_not_transient() {
        assert!(!Error::NothingToImport.is_transient());
        assert!(!Error::decode("bad json").is_transient());
        assert!(Error::PublishRejected("nack".into()).is_transient());
    }
}
