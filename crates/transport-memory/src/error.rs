use courier_transport::TransportError;
use thiserror::Error;

/// Errors raised by the in-memory broker.
#[derive(Debug, Error)]
pub enum Error {
    /// The channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// An exchange or queue does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// "exchange" or "queue".
        kind: &'static str,
        /// Name that was looked up.
        name: String,
    },

    /// The resource is owned by another channel.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// A redeclaration conflicts with the existing resource.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack or nack for a tag that is not outstanding.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// Cancel for a consumer that does not exist.
    #[error("unknown consumer tag {0}")]
    UnknownConsumer(String),
}

impl TransportError for Error {
    fn is_resource_locked(&self) -> bool {
        matches!(self, Self::ResourceLocked(_))
    }

    fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}
