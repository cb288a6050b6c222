use std::error::Error;
use std::fmt::Debug;

/// Marker trait for transport errors.
///
/// The classification hooks let callers react to broker conditions without
/// knowing the concrete transport.
pub trait TransportError: Debug + Error + Send + Sync + 'static {
    /// The broker refused access because another owner holds the resource
    /// (for example a second consumer on an exclusive queue).
    fn is_resource_locked(&self) -> bool {
        false
    }

    /// The channel or connection is already closed.
    fn is_closed(&self) -> bool {
        false
    }
}
