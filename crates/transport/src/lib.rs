//! Abstract interface to an AMQP-style message broker.
//!
//! This crate describes what the rest of the workspace needs from a broker:
//! exchanges, queues and bindings, channels that publish (optionally in
//! confirm mode) and consume with explicit acknowledgement. Concrete brokers
//! live in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Error marker traits shared by every transport.
pub mod error;

/// Messages, properties and headers.
pub mod message;

/// Exchange and queue declarations.
pub mod topology;

pub use error::TransportError;
pub use message::{Delivery, Headers, Message, Properties};
pub use topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A single publish request as handed to a channel.
#[derive(Clone, Debug)]
pub struct Publish {
    /// Exchange the message is published to (empty for the default exchange).
    pub exchange: String,

    /// Primary routing key.
    pub routing_key: String,

    /// Extra routing keys that receive a copy of the same message.
    pub cc: Vec<String>,

    /// The message itself.
    pub message: Message,
}

/// What the channel reports synchronously after accepting a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Confirm sequence number, present only on confirm channels.
    pub sequence: Option<u64>,

    /// `false` once the channel's write buffer is saturated. Callers should
    /// wait for [`Channel::drained`] before publishing again.
    pub writable: bool,
}

/// Outcome of a publish as reported by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The broker took responsibility for the message.
    Ack,

    /// The broker refused the message.
    Nack,
}

/// A broker confirmation for one or more publishes on a confirm channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Confirm {
    /// Sequence number being confirmed.
    pub sequence: u64,

    /// When set, every outstanding sequence up to and including `sequence`
    /// is settled with the same outcome.
    pub multiple: bool,

    /// Ack or nack.
    pub outcome: ConfirmOutcome,
}

/// Options for starting a consumer.
#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    /// Deliveries are settled by the broker on send; `ack`/`nack` are not expected.
    pub no_ack: bool,

    /// Request exclusive access to the queue.
    pub exclusive: bool,

    /// Maximum number of unacknowledged deliveries in flight (0 = unlimited).
    pub prefetch: u16,
}

/// A live consumer on a queue.
#[derive(Debug)]
pub struct Subscription {
    /// Broker-assigned consumer tag.
    pub consumer_tag: String,

    /// Deliveries in broker order. The sender side is dropped on cancel.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// A broker channel. A channel is owned by a single sandbox for its lifetime.
#[async_trait]
pub trait Channel
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the channel.
    type Error: TransportError;

    /// Whether the channel was opened in confirm mode.
    fn is_confirm(&self) -> bool;

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), Self::Error>;

    /// Declares a queue and returns its name (generated when the declaration's name is empty).
    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<String, Self::Error>;

    /// Binds a queue to an exchange under a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error>;

    /// Removes every ready message from a queue, returning how many were dropped.
    async fn purge_queue(&self, queue: &str) -> Result<usize, Self::Error>;

    /// Hands a message to the channel's write buffer. Never blocks.
    fn publish(&self, publish: Publish) -> Result<PublishReceipt, Self::Error>;

    /// Resolves once the write buffer has drained below its low-water mark.
    async fn drained(&self) -> Result<(), Self::Error>;

    /// Takes the confirm event receiver. Returns `None` on non-confirm channels
    /// and on every call after the first.
    fn confirms(&self) -> Option<mpsc::UnboundedReceiver<Confirm>>;

    /// Starts consuming a queue.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Subscription, Self::Error>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), Self::Error>;

    /// Rejects a delivery, optionally returning it to the queue.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Self::Error>;

    /// Cancels a consumer. Its delivery receiver ends afterwards.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), Self::Error>;

    /// Flushes the write buffer and closes the channel.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// A connection to a broker that hands out channels.
#[async_trait]
pub trait Transport
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the transport.
    type Error: TransportError;

    /// The channel type produced by this transport.
    type Channel: Channel<Error = Self::Error>;

    /// Opens a plain channel.
    async fn create_channel(&self) -> Result<Self::Channel, Self::Error>;

    /// Opens a channel in publisher-confirm mode.
    async fn create_confirm_channel(&self) -> Result<Self::Channel, Self::Error>;
}
