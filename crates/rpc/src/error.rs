use courier_engine::{ConfigError, DeliveryHandlerError};
use thiserror::Error;

use crate::worker::RoutineError;

/// Result type alias for RPC operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur in masters and workers.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration was rejected before any broker activity.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The underlying engine failed.
    #[error(transparent)]
    Engine(#[from] courier_engine::Error),

    /// Another master already consumes this response queue.
    #[error("response queue {0} is already bound by another master")]
    DuplicateResponseQueue(String),

    /// No routine is registered under the requested id.
    #[error("no routine registered for {0}")]
    UnknownRoutine(String),

    /// A terminal event was already sent for this request.
    #[error("request {0} already has a result")]
    AlreadyFinished(String),

    /// A request or event body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An event message did not follow the protocol.
    #[error("malformed event: {0}")]
    Malformed(String),
}

impl DeliveryHandlerError for Error {}

impl RoutineError for Error {}
