//! In-memory broker implementing the `courier-transport` traits.
//!
//! Useful for tests and single-process setups. Exchanges, queues, prefetch,
//! exclusive ownership, dead-lettering and publisher confirms all behave like
//! a networked broker would, minus persistence.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod channel;
mod error;

pub use channel::MemoryChannel;
pub use error::Error;

use broker::BrokerState;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::Transport;
use parking_lot::Mutex;

/// Tuning for the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryOptions {
    /// Number of buffered publishes after which a channel reports itself
    /// non-writable. It becomes writable again at half this value.
    pub write_buffer_high_water: usize,

    /// Simulated latency applied to every publish before it is routed.
    pub wire_delay: Option<Duration>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            write_buffer_high_water: 256,
            wire_delay: None,
        }
    }
}

/// A handle to an in-memory broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<Mutex<BrokerState>>,
    next_channel: Arc<AtomicU64>,
    options: MemoryOptions,
}

impl MemoryTransport {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            broker: Arc::new(Mutex::new(BrokerState::default())),
            next_channel: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    /// Refuses the next `count` publishes made on confirm channels.
    pub fn nack_next(&self, count: usize) {
        self.broker.lock().nack_next(count);
    }

    /// Number of ready (undelivered) messages in a queue.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.broker.lock().ready_count(queue)
    }

    /// Number of active consumers on a queue.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.broker.lock().consumer_count(queue)
    }

    fn open(&self, confirm: bool) -> MemoryChannel {
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryChannel::open(id, confirm, self.broker.clone(), &self.options)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = Error;

    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, Error> {
        Ok(self.open(false))
    }

    async fn create_confirm_channel(&self) -> Result<MemoryChannel, Error> {
        Ok(self.open(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use courier_transport::{
        Channel, ConfirmOutcome, ConsumeOptions, ExchangeDeclaration, ExchangeKind, Message,
        Publish, QueueDeclaration, TransportError,
    };
    use tokio::time::timeout;

    async fn setup(transport: &MemoryTransport) -> MemoryChannel {
        let channel = transport.create_confirm_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeDeclaration {
                name: "orders".to_string(),
                kind: ExchangeKind::Direct,
                durable: true,
            })
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDeclaration {
                name: "orders.new".to_string(),
                ..QueueDeclaration::default()
            })
            .await
            .unwrap();
        channel
            .bind_queue("orders.new", "orders", "new")
            .await
            .unwrap();
        channel
    }

    fn publish(body: &'static str) -> Publish {
        Publish {
            exchange: "orders".to_string(),
            routing_key: "new".to_string(),
            cc: Vec::new(),
            message: Message::new(body),
        }
    }

    #[tokio::test]
    async fn test_confirms_follow_publish_order() {
        let transport = MemoryTransport::default();
        let channel = setup(&transport).await;
        let mut confirms = channel.confirms().unwrap();
        assert!(channel.confirms().is_none());

        let first = channel.publish(publish("a")).unwrap();
        let second = channel.publish(publish("b")).unwrap();
        assert_eq!(first.sequence, Some(1));
        assert_eq!(second.sequence, Some(2));

        for expected in [1, 2] {
            let confirm = timeout(Duration::from_secs(1), confirms.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(confirm.sequence, expected);
            assert_eq!(confirm.outcome, ConfirmOutcome::Ack);
        }
        assert_eq!(transport.queue_depth("orders.new"), Some(2));
    }

    #[tokio::test]
    async fn test_nack_next_refuses_publish() {
        let transport = MemoryTransport::default();
        let channel = setup(&transport).await;
        let mut confirms = channel.confirms().unwrap();

        transport.nack_next(1);
        channel.publish(publish("refused")).unwrap();
        channel.publish(publish("accepted")).unwrap();

        let refused = confirms.recv().await.unwrap();
        let accepted = confirms.recv().await.unwrap();
        assert_eq!(refused.outcome, ConfirmOutcome::Nack);
        assert_eq!(accepted.outcome, ConfirmOutcome::Ack);
        assert_eq!(transport.queue_depth("orders.new"), Some(1));
    }

    #[tokio::test]
    async fn test_backpressure_reports_unwritable_then_drains() {
        let transport = MemoryTransport::new(MemoryOptions {
            write_buffer_high_water: 2,
            wire_delay: Some(Duration::from_millis(5)),
        });
        let channel = setup(&transport).await;

        let receipts: Vec<_> = (0..4)
            .map(|_| channel.publish(publish("x")).unwrap())
            .collect();
        assert!(receipts.iter().any(|r| !r.writable));

        timeout(Duration::from_secs(1), channel.drained())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let transport = MemoryTransport::default();
        let producer = setup(&transport).await;
        let consumer = transport.create_channel().await.unwrap();

        let mut subscription = consumer
            .consume("orders.new", ConsumeOptions::default())
            .await
            .unwrap();
        producer.publish(publish("hello")).unwrap();

        let delivery = timeout(Duration::from_secs(1), subscription.deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.content, "hello");
        assert!(!delivery.redelivered);

        consumer.ack(delivery.delivery_tag).await.unwrap();
        assert!(consumer.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_second_exclusive_owner_is_resource_locked() {
        let transport = MemoryTransport::default();
        let declaration = QueueDeclaration {
            name: "responses".to_string(),
            exclusive: true,
            auto_delete: true,
            ..QueueDeclaration::default()
        };

        let first = transport.create_channel().await.unwrap();
        let second = transport.create_channel().await.unwrap();
        first.declare_queue(&declaration).await.unwrap();

        let err = second.declare_queue(&declaration).await.unwrap_err();
        assert!(err.is_resource_locked());

        first.close().await.unwrap();
        assert!(second.declare_queue(&declaration).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_work() {
        let transport = MemoryTransport::default();
        let channel = setup(&transport).await;
        channel.publish(publish("flushed")).unwrap();
        channel.close().await.unwrap();

        assert_eq!(transport.queue_depth("orders.new"), Some(1));
        let err = channel.publish(publish("late")).unwrap_err();
        assert!(err.is_closed());
    }
}
