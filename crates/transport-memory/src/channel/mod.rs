use crate::Error;
use crate::MemoryOptions;
use crate::broker::BrokerState;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{
    Channel, Confirm, ConfirmOutcome, ConsumeOptions, ExchangeDeclaration, Publish,
    PublishReceipt, QueueDeclaration, Subscription,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

struct Outbound {
    publish: Publish,
    sequence: Option<u64>,
}

struct Writer {
    sender: Option<mpsc::UnboundedSender<Outbound>>,
    next_sequence: u64,
}

/// A channel on the in-memory broker.
///
/// Publishes go through a write buffer drained by a background task, so a
/// publisher can outrun the broker and observe backpressure the same way it
/// would on a socket.
pub struct MemoryChannel {
    id: u64,
    confirm: bool,
    broker: Arc<Mutex<BrokerState>>,
    high_water: usize,
    writer: Mutex<Writer>,
    buffered: Arc<watch::Sender<usize>>,
    confirms: Mutex<Option<mpsc::UnboundedReceiver<Confirm>>>,
    closed: AtomicBool,
    tracker: TaskTracker,
}

impl MemoryChannel {
    pub(crate) fn open(
        id: u64,
        confirm: bool,
        broker: Arc<Mutex<BrokerState>>,
        options: &MemoryOptions,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(watch::Sender::new(0));

        let (confirm_tx, confirm_rx) = if confirm {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let tracker = TaskTracker::new();
        tracker.spawn(Self::write_loop(
            outbound_rx,
            broker.clone(),
            buffered.clone(),
            confirm_tx,
            options.wire_delay,
        ));

        debug!(channel = id, confirm, "channel opened");

        Self {
            id,
            confirm,
            broker,
            high_water: options.write_buffer_high_water.max(1),
            writer: Mutex::new(Writer {
                sender: Some(outbound_tx),
                next_sequence: 0,
            }),
            buffered,
            confirms: Mutex::new(confirm_rx),
            closed: AtomicBool::new(false),
            tracker,
        }
    }

    async fn write_loop(
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        broker: Arc<Mutex<BrokerState>>,
        buffered: Arc<watch::Sender<usize>>,
        confirms: Option<mpsc::UnboundedSender<Confirm>>,
        wire_delay: Option<Duration>,
    ) {
        while let Some(Outbound { publish, sequence }) = outbound.recv().await {
            if let Some(delay) = wire_delay {
                tokio::time::sleep(delay).await;
            }

            let outcome = {
                let mut state = broker.lock();
                if sequence.is_some() && state.take_nack() {
                    ConfirmOutcome::Nack
                } else {
                    match state.route(&publish) {
                        Ok(_) => ConfirmOutcome::Ack,
                        Err(e) => {
                            warn!(exchange = %publish.exchange, "publish refused: {e}");
                            ConfirmOutcome::Nack
                        }
                    }
                }
            };

            buffered.send_modify(|depth| *depth = depth.saturating_sub(1));

            if let (Some(confirms), Some(sequence)) = (&confirms, sequence) {
                let _ = confirms.send(Confirm {
                    sequence,
                    multiple: false,
                    outcome,
                });
            }
        }
    }

    const fn low_water(&self) -> usize {
        self.high_water / 2
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

impl Debug for MemoryChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("confirm", &self.confirm)
            .field("buffered", &*self.buffered.borrow())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.writer.lock().sender.take();
            self.broker.lock().close_channel(self.id);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    type Error = Error;

    fn is_confirm(&self) -> bool {
        self.confirm
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.lock().declare_exchange(exchange)
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<String, Error> {
        self.ensure_open()?;
        self.broker.lock().declare_queue(queue, self.id)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.lock().bind_queue(queue, exchange, routing_key)
    }

    async fn purge_queue(&self, queue: &str) -> Result<usize, Error> {
        self.ensure_open()?;
        self.broker.lock().purge_queue(queue)
    }

    fn publish(&self, publish: Publish) -> Result<PublishReceipt, Error> {
        self.ensure_open()?;

        let mut writer = self.writer.lock();
        let sequence = if self.confirm {
            writer.next_sequence += 1;
            Some(writer.next_sequence)
        } else {
            None
        };

        let sender = writer.sender.as_ref().ok_or(Error::ChannelClosed)?;

        // Count before sending so the write loop never decrements first.
        self.buffered.send_modify(|depth| *depth += 1);
        if sender.send(Outbound { publish, sequence }).is_err() {
            self.buffered.send_modify(|depth| *depth = depth.saturating_sub(1));
            return Err(Error::ChannelClosed);
        }
        drop(writer);

        let depth = *self.buffered.borrow();
        Ok(PublishReceipt {
            sequence,
            writable: depth < self.high_water,
        })
    }

    async fn drained(&self) -> Result<(), Error> {
        let low_water = self.low_water();
        let mut receiver = self.buffered.subscribe();
        receiver
            .wait_for(|depth| *depth <= low_water)
            .await
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed)
    }

    fn confirms(&self) -> Option<mpsc::UnboundedReceiver<Confirm>> {
        self.confirms.lock().take()
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription, Error> {
        self.ensure_open()?;
        let (sender, deliveries) = mpsc::unbounded_channel();
        let consumer_tag = self.broker.lock().consume(queue, self.id, &options, sender)?;

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.lock().ack(delivery_tag)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.lock().nack(delivery_tag, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.lock().cancel(consumer_tag)
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.writer.lock().sender.take();
        self.tracker.close();
        self.tracker.wait().await;

        self.broker.lock().close_channel(self.id);
        debug!(channel = self.id, "channel closed");

        Ok(())
    }
}
