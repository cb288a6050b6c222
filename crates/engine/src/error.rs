use crate::EngineState;
use crate::config::ConfigError;
use crate::segment::ReassemblyError;

use courier_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration was rejected before any broker activity.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine is closing or closed.
    #[error("engine is {engine_state}")]
    Suspended {
        /// State the engine was in when the call was refused.
        engine_state: EngineState,
    },

    /// The broker refused a confirmed publish.
    #[error("publish {sequence} was nacked by the broker")]
    Nacked {
        /// Confirm sequence number of the refused publish.
        sequence: u64,
    },

    /// Another owner holds the broker resource.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Any other broker failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A segmented payload could not be reassembled.
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    /// The channel went away before the operation settled.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    pub(crate) fn transport<E>(error: &E) -> Self
    where
        E: TransportError,
    {
        if error.is_resource_locked() {
            Self::ResourceLocked(error.to_string())
        } else if error.is_closed() {
            Self::ChannelClosed
        } else {
            Self::Transport(error.to_string())
        }
    }

    pub(crate) const fn suspended() -> Self {
        Self::Suspended {
            engine_state: EngineState::Suspended,
        }
    }

    /// The engine state carried by a suspended error.
    #[must_use]
    pub const fn engine_state(&self) -> Option<EngineState> {
        match self {
            Self::Suspended { engine_state } => Some(*engine_state),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry the operation later.
    ///
    /// The engine itself never retries.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Nacked { .. } | Self::Suspended { .. })
    }
}
