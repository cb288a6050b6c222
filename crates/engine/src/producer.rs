//! Serialized, flow-controlled publishing on one channel.

use crate::Error;
use crate::observer::EngineObserver;

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_transport::{Channel, Confirm, ConfirmOutcome, Message, Publish};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

type Settled = oneshot::Sender<Result<(), Error>>;

struct PendingConfirm {
    sequence: u64,
    sender: Settled,
    permit: Option<OwnedSemaphorePermit>,
}

/// A message ready to be handed to the channel.
#[derive(Clone, Debug)]
pub struct Outgoing {
    /// Routing key to publish with.
    pub routing_key: String,

    /// Extra routing keys receiving a copy.
    pub cc: Vec<String>,

    /// The message.
    pub message: Message,
}

/// A publish that has been written but may still await its confirm.
///
/// Its quota permit is held by the sandbox until the broker settles it, so
/// dropping or holding this handle does not affect the quota.
pub struct PendingPublish {
    sequence: Option<u64>,
    receiver: Option<oneshot::Receiver<Result<(), Error>>>,
}

impl PendingPublish {
    /// Confirm sequence number, on confirm channels.
    #[must_use]
    pub const fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Waits for the broker's verdict. Resolves immediately on non-confirm channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Nacked`] when the broker refused the message and
    /// [`Error::ChannelClosed`] when the channel went away first.
    pub async fn confirmed(self) -> Result<(), Error> {
        match self.receiver {
            Some(receiver) => receiver.await.unwrap_or(Err(Error::ChannelClosed)),
            None => Ok(()),
        }
    }
}

impl Debug for PendingPublish {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPublish")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Owns one channel and publishes on it in call order.
///
/// Publishes are serialized by an async mutex. An optional semaphore bounds
/// the number of unconfirmed publishes. When the channel reports a full write
/// buffer the producer holds the mutex until the buffer drains, so later
/// calls queue behind it.
pub struct ProducerSandbox<C>
where
    C: Channel,
{
    engine_id: String,
    exchange: String,
    channel: Arc<C>,
    observer: Arc<dyn EngineObserver>,
    publish_lock: Mutex<()>,
    quota: Option<Arc<Semaphore>>,
    pending: Arc<SyncMutex<VecDeque<PendingConfirm>>>,
    settled: Arc<Notify>,
    closing: CancellationToken,
    closed: AtomicBool,
    shut: CancellationToken,
    tracker: TaskTracker,
}

impl<C> ProducerSandbox<C>
where
    C: Channel,
{
    /// Wraps a channel. Confirm channels get a listener task matching broker
    /// confirms to pending publishes.
    pub fn new(
        engine_id: String,
        exchange: String,
        channel: C,
        exchange_quota: Option<usize>,
        observer: Arc<dyn EngineObserver>,
    ) -> Self {
        let pending = Arc::new(SyncMutex::new(VecDeque::new()));
        let settled = Arc::new(Notify::new());
        let tracker = TaskTracker::new();

        if let Some(confirms) = channel.confirms() {
            tracker.spawn(Self::process_confirms(
                engine_id.clone(),
                confirms,
                pending.clone(),
                settled.clone(),
                observer.clone(),
            ));
        }

        debug!(engine_id = %engine_id, confirm = channel.is_confirm(), "producer sandbox created");

        Self {
            engine_id,
            exchange,
            channel: Arc::new(channel),
            observer,
            publish_lock: Mutex::new(()),
            quota: exchange_quota.map(|quota| Arc::new(Semaphore::new(quota))),
            pending,
            settled,
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            shut: CancellationToken::new(),
            tracker,
        }
    }

    async fn process_confirms(
        engine_id: String,
        mut confirms: mpsc::UnboundedReceiver<Confirm>,
        pending: Arc<SyncMutex<VecDeque<PendingConfirm>>>,
        settled: Arc<Notify>,
        observer: Arc<dyn EngineObserver>,
    ) {
        while let Some(confirm) = confirms.recv().await {
            let matched = Self::take_matching(&pending, confirm);
            if matched.is_empty() {
                warn!(engine_id = %engine_id, sequence = confirm.sequence, "confirm without a pending publish");
            }

            for PendingConfirm {
                sequence,
                sender,
                permit,
            } in matched
            {
                debug!(
                    engine_id = %engine_id,
                    sequence,
                    outcome = ?confirm.outcome,
                    "publish confirmed"
                );
                observer.on_confirm(&engine_id, sequence, confirm.outcome);

                // Quota frees up before the caller hears the verdict.
                drop(permit);
                let result = match confirm.outcome {
                    ConfirmOutcome::Ack => Ok(()),
                    ConfirmOutcome::Nack => Err(Error::Nacked { sequence }),
                };
                let _ = sender.send(result);
            }
            settled.notify_waiters();
        }

        // Channel is gone; nothing left can be confirmed.
        let orphans: Vec<_> = pending.lock().drain(..).collect();
        if !orphans.is_empty() {
            warn!(engine_id = %engine_id, count = orphans.len(), "confirm stream ended with publishes pending");
        }
        for entry in orphans {
            let _ = entry.sender.send(Err(Error::ChannelClosed));
        }
        settled.notify_waiters();
    }

    fn take_matching(
        pending: &SyncMutex<VecDeque<PendingConfirm>>,
        confirm: Confirm,
    ) -> Vec<PendingConfirm> {
        let mut pending = pending.lock();

        if confirm.multiple {
            let count = pending
                .iter()
                .take_while(|p| p.sequence <= confirm.sequence)
                .count();
            return pending.drain(..count).collect();
        }

        // Normally the front entry; a broker confirming out of order still settles the right one.
        let position = pending
            .iter()
            .position(|p| p.sequence == confirm.sequence);
        position
            .and_then(|position| pending.remove(position))
            .into_iter()
            .collect()
    }

    /// Writes a message to the channel and returns without waiting for its confirm.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Suspended`] once [`Self::close`] has begun, or with
    /// the channel's error when the publish cannot be written.
    pub async fn submit(&self, outgoing: Outgoing) -> Result<PendingPublish, Error> {
        if self.closing.is_cancelled() {
            return Err(Error::suspended());
        }

        let permit = match &self.quota {
            Some(quota) => {
                let permit = tokio::select! {
                    biased;
                    () = self.closing.cancelled() => return Err(Error::suspended()),
                    permit = quota.clone().acquire_owned() => permit,
                };
                Some(permit.map_err(|_| Error::suspended())?)
            }
            None => None,
        };

        let _guard = self.publish_lock.lock().await;
        if self.closing.is_cancelled() {
            return Err(Error::suspended());
        }

        let publish = Publish {
            exchange: self.exchange.clone(),
            routing_key: outgoing.routing_key,
            cc: outgoing.cc,
            message: outgoing.message,
        };

        let (receipt, receiver) = {
            // Held across publish so the listener cannot see the confirm first.
            let mut pending = self.pending.lock();
            let receipt = self
                .channel
                .publish(publish)
                .map_err(|e| Error::transport(&e))?;

            // Without confirms nothing stays unconfirmed and the permit goes now.
            let receiver = receipt.sequence.map(|sequence| {
                let (sender, receiver) = oneshot::channel();
                pending.push_back(PendingConfirm {
                    sequence,
                    sender,
                    permit,
                });
                receiver
            });
            (receipt, receiver)
        };

        if !receipt.writable {
            debug!(engine_id = %self.engine_id, "write buffer full, waiting for drain");
            self.observer.on_overflow(&self.engine_id);
            self.channel
                .drained()
                .await
                .map_err(|e| Error::transport(&e))?;
            debug!(engine_id = %self.engine_id, "write buffer drained");
            self.observer.on_drain(&self.engine_id);
        }

        Ok(PendingPublish {
            sequence: receipt.sequence,
            receiver,
        })
    }

    /// Publishes a message and waits for it to settle.
    ///
    /// # Errors
    ///
    /// See [`Self::submit`] and [`PendingPublish::confirmed`].
    pub async fn produce(&self, outgoing: Outgoing) -> Result<(), Error> {
        self.submit(outgoing).await?.confirmed().await
    }

    /// Number of publishes awaiting a confirm.
    #[must_use]
    pub fn pending_confirms(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stops accepting publishes, waits for outstanding confirms and closes the channel.
    ///
    /// Safe to call more than once and from several tasks; later callers
    /// return once the first has finished closing.
    ///
    /// # Errors
    ///
    /// Returns the channel's error if closing it fails.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.shut.cancelled().await;
            return Ok(());
        }

        self.closing.cancel();
        if let Some(quota) = &self.quota {
            quota.close();
        }

        // Any publish already past its state check finishes first.
        drop(self.publish_lock.lock().await);

        loop {
            let notified = self.settled.notified();
            if self.pending.lock().is_empty() || self.tracker.is_empty() {
                break;
            }
            notified.await;
        }

        let result = self
            .channel
            .close()
            .await
            .map_err(|e| Error::transport(&e));

        self.tracker.close();
        self.tracker.wait().await;

        debug!(engine_id = %self.engine_id, "producer sandbox closed");
        self.shut.cancel();
        result
    }
}

impl<C> Debug for ProducerSandbox<C>
where
    C: Channel,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSandbox")
            .field("engine_id", &self.engine_id)
            .field("exchange", &self.exchange)
            .field("channel", &self.channel)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observer::CountingObserver;

    use std::time::Duration;

    use courier_transport::{ExchangeDeclaration, ExchangeKind, QueueDeclaration, Transport};
    use courier_transport_memory::{MemoryOptions, MemoryTransport};
    use tokio::time::timeout;

    async fn sandbox(
        transport: &MemoryTransport,
        quota: Option<usize>,
        observer: Arc<CountingObserver>,
    ) -> ProducerSandbox<courier_transport_memory::MemoryChannel> {
        let channel = transport.create_confirm_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeDeclaration {
                name: "jobs".to_string(),
                kind: ExchangeKind::Direct,
                durable: false,
            })
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDeclaration {
                name: "jobs.q".to_string(),
                ..QueueDeclaration::default()
            })
            .await
            .unwrap();
        channel.bind_queue("jobs.q", "jobs", "run").await.unwrap();

        ProducerSandbox::new("test".to_string(), "jobs".to_string(), channel, quota, observer)
    }

    fn outgoing(body: &'static str) -> Outgoing {
        Outgoing {
            routing_key: "run".to_string(),
            cc: Vec::new(),
            message: Message::new(body),
        }
    }

    #[tokio::test]
    async fn test_confirms_match_fifo_with_nacks() {
        let transport = MemoryTransport::default();
        let observer = Arc::new(CountingObserver::new());
        let producer = sandbox(&transport, None, observer.clone()).await;

        transport.nack_next(1);
        let first = producer.submit(outgoing("a")).await.unwrap();
        let second = producer.submit(outgoing("b")).await.unwrap();
        assert_eq!(first.sequence(), Some(1));
        assert_eq!(second.sequence(), Some(2));

        assert!(matches!(
            first.confirmed().await,
            Err(Error::Nacked { sequence: 1 })
        ));
        assert!(second.confirmed().await.is_ok());

        let counts = observer.counts();
        assert_eq!((counts.acked, counts.nacked), (1, 1));
    }

    #[tokio::test]
    async fn test_quota_bounds_unconfirmed_publishes() {
        let transport = MemoryTransport::new(MemoryOptions {
            wire_delay: Some(Duration::from_millis(20)),
            ..MemoryOptions::default()
        });
        let observer = Arc::new(CountingObserver::new());
        let producer = sandbox(&transport, Some(1), observer).await;

        let first = producer.submit(outgoing("a")).await.unwrap();
        assert!(
            timeout(Duration::from_millis(5), producer.submit(outgoing("b")))
                .await
                .is_err()
        );

        first.confirmed().await.unwrap();
        let second = timeout(Duration::from_secs(1), producer.submit(outgoing("b")))
            .await
            .unwrap()
            .unwrap();
        second.confirmed().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_and_drain_are_observed() {
        let transport = MemoryTransport::new(MemoryOptions {
            write_buffer_high_water: 2,
            wire_delay: Some(Duration::from_millis(1)),
        });
        let observer = Arc::new(CountingObserver::new());
        let producer = sandbox(&transport, None, observer.clone()).await;

        let mut pending = Vec::new();
        for _ in 0..6 {
            pending.push(producer.submit(outgoing("x")).await.unwrap());
        }
        for publish in pending {
            publish.confirmed().await.unwrap();
        }

        let counts = observer.counts();
        assert!(counts.overflows > 0);
        assert_eq!(counts.overflows, counts.drains);
        assert_eq!(transport.queue_depth("jobs.q"), Some(6));
    }

    #[tokio::test]
    async fn test_close_settles_pending_then_rejects() {
        let transport = MemoryTransport::new(MemoryOptions {
            wire_delay: Some(Duration::from_millis(5)),
            ..MemoryOptions::default()
        });
        let observer = Arc::new(CountingObserver::new());
        let producer = sandbox(&transport, None, observer.clone()).await;

        let pending = producer.submit(outgoing("in flight")).await.unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert!(pending.confirmed().await.is_ok());
        assert_eq!(producer.pending_confirms(), 0);

        let err = producer.produce(outgoing("late")).await.unwrap_err();
        assert!(err.engine_state().is_some());
        assert_eq!(transport.queue_depth("jobs.q"), Some(1));
    }

    #[tokio::test]
    async fn test_quota_frees_on_confirm_while_handles_are_held() {
        let transport = MemoryTransport::new(MemoryOptions {
            wire_delay: Some(Duration::from_millis(2)),
            ..MemoryOptions::default()
        });
        let observer = Arc::new(CountingObserver::new());
        let producer = sandbox(&transport, Some(2), observer).await;

        let held = timeout(Duration::from_secs(2), async {
            let mut held = Vec::new();
            for _ in 0..5 {
                held.push(producer.submit(outgoing("x")).await.unwrap());
            }
            held
        })
        .await
        .unwrap();

        for publish in held {
            publish.confirmed().await.unwrap();
        }
        assert_eq!(transport.queue_depth("jobs.q"), Some(5));
    }

    #[tokio::test]
    async fn test_concurrent_close_waits_for_the_first() {
        let transport = MemoryTransport::new(MemoryOptions {
            wire_delay: Some(Duration::from_millis(30)),
            ..MemoryOptions::default()
        });
        let observer = Arc::new(CountingObserver::new());
        let producer = Arc::new(sandbox(&transport, None, observer).await);

        let pending = producer.submit(outgoing("in flight")).await.unwrap();
        let first = tokio::spawn({
            let producer = producer.clone();
            async move { producer.close().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        timeout(Duration::from_secs(1), producer.close())
            .await
            .unwrap()
            .unwrap();
        // The second close only returns once the in-flight confirm has settled.
        assert_eq!(producer.pending_confirms(), 0);
        assert!(pending.confirmed().await.is_ok());
        first.await.unwrap().unwrap();
    }
}
