//! One consumer subscription and the dispatch of its deliveries.

use crate::Error;
use crate::config::QueueSpec;
use crate::observer::EngineObserver;
use crate::segment::{PayloadStream, ReassemblyError, Segment, SegmentHeader, strip_reserved};

use std::error::Error as StdError;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{Channel, ConsumeOptions, Delivery, Properties};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Marker trait for delivery handler errors.
pub trait DeliveryHandlerError: StdError + Send + Sync + 'static {}

/// Application code that processes deliveries.
#[async_trait]
pub trait DeliveryHandler
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: DeliveryHandlerError;

    /// Handles one delivery. The handler settles it through `finisher`; a
    /// delivery still unsettled when this returns is rejected without requeue.
    async fn handle(&self, delivery: Delivered, finisher: Finisher) -> Result<(), Self::Error>;
}

/// Where a delivery came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Consumer that received it.
    pub consumer_tag: String,

    /// Broker delivery tag (the first segment's tag for streams).
    pub delivery_tag: u64,

    /// Exchange it was published to.
    pub exchange: String,

    /// Routing key it was published with.
    pub routing_key: String,

    /// Whether the broker delivered it before.
    pub redelivered: bool,

    /// Payload id when this is a reassembled stream.
    pub segment_id: Option<String>,
}

impl DeliveryInfo {
    fn of(delivery: &Delivery, segment_id: Option<String>) -> Self {
        Self {
            consumer_tag: delivery.consumer_tag.clone(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            segment_id,
        }
    }
}

/// A delivery as seen by a handler.
#[derive(Debug)]
pub struct Delivered {
    /// Message body. Empty for reassembled streams.
    pub content: Bytes,

    /// Message properties. Segment headers are removed for reassembled streams.
    pub properties: Properties,

    /// Delivery metadata.
    pub info: DeliveryInfo,

    /// The reassembled payload, for segmented messages on payload-enabled queues.
    pub payload: Option<PayloadStream>,
}

#[async_trait]
trait Settle: Send + Sync {
    async fn accept(&self, delivery_tag: u64) -> Result<(), Error>;

    async fn refuse(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error>;
}

#[async_trait]
impl<C> Settle for C
where
    C: Channel,
{
    async fn accept(&self, delivery_tag: u64) -> Result<(), Error> {
        self.ack(delivery_tag)
            .await
            .map_err(|e| Error::transport(&e))
    }

    async fn refuse(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.nack(delivery_tag, requeue)
            .await
            .map_err(|e| Error::transport(&e))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Accept,
    Refuse { requeue: bool },
}

#[derive(Debug, Default)]
struct Ledger {
    tags: Vec<u64>,
    verdict: Option<Verdict>,
}

/// Settles one logical delivery: a single message, or every segment of a
/// reassembled stream.
///
/// Only the first call to [`Finisher::finish`] or [`Finisher::reject`] has
/// any effect.
pub struct Finisher {
    settle: Arc<dyn Settle>,
    ledger: Arc<SyncMutex<Ledger>>,
    no_ack: bool,
}

impl Finisher {
    fn new(settle: Arc<dyn Settle>, no_ack: bool, tags: Vec<u64>) -> Self {
        Self {
            settle,
            ledger: Arc::new(SyncMutex::new(Ledger {
                tags,
                verdict: None,
            })),
            no_ack,
        }
    }

    fn share(&self) -> Self {
        Self {
            settle: self.settle.clone(),
            ledger: self.ledger.clone(),
            no_ack: self.no_ack,
        }
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the acknowledgement fails.
    pub async fn finish(self) -> Result<(), Error> {
        self.decide(Verdict::Accept).await
    }

    /// Rejects the delivery. Without requeue it goes to the queue's
    /// recyclebin, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the rejection fails.
    pub async fn reject(self, requeue: bool) -> Result<(), Error> {
        self.decide(Verdict::Refuse { requeue }).await
    }

    /// Whether a verdict has been given.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.ledger.lock().verdict.is_some()
    }

    async fn decide(&self, verdict: Verdict) -> Result<(), Error> {
        let tags = {
            let mut ledger = self.ledger.lock();
            if ledger.verdict.is_some() {
                return Ok(());
            }
            ledger.verdict = Some(verdict);
            std::mem::take(&mut ledger.tags)
        };
        self.apply(verdict, tags).await
    }

    /// Adds a later segment to the delivery, applying the verdict at once if
    /// the handler already gave one.
    async fn track(&self, delivery_tag: u64) -> Result<(), Error> {
        let verdict = {
            let mut ledger = self.ledger.lock();
            if ledger.verdict.is_none() {
                ledger.tags.push(delivery_tag);
            }
            ledger.verdict
        };
        match verdict {
            Some(verdict) => self.apply(verdict, vec![delivery_tag]).await,
            None => Ok(()),
        }
    }

    async fn apply(&self, verdict: Verdict, tags: Vec<u64>) -> Result<(), Error> {
        if self.no_ack {
            return Ok(());
        }
        for tag in tags {
            match verdict {
                Verdict::Accept => self.settle.accept(tag).await?,
                Verdict::Refuse { requeue } => self.settle.refuse(tag, requeue).await?,
            }
        }
        Ok(())
    }
}

impl Debug for Finisher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("Finisher")
            .field("tags", &ledger.tags)
            .field("verdict", &ledger.verdict)
            .field("no_ack", &self.no_ack)
            .finish()
    }
}

#[derive(Clone)]
struct Scope {
    engine_id: Arc<str>,
    consumer_tag: Arc<str>,
    observer: Arc<dyn EngineObserver>,
}

impl Scope {
    fn fault(&self, fault: &str) {
        warn!(engine_id = %self.engine_id, consumer_tag = %self.consumer_tag, "handler fault: {fault}");
        self.observer
            .on_handler_fault(&self.engine_id, &self.consumer_tag, fault);
    }

    /// Reports how a handler invocation ended and settles whatever it left unsettled.
    async fn conclude<E>(&self, outcome: Result<Result<(), E>, JoinError>, finisher: Finisher)
    where
        E: StdError,
    {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fault(&e.to_string()),
            Err(e) => self.fault(&format!("handler panicked: {e}")),
        }

        if !finisher.is_settled() {
            self.fault("delivery left unsettled");
            if let Err(e) = finisher.reject(false).await {
                warn!(consumer_tag = %self.consumer_tag, "failed to reject delivery: {e}");
            }
        }
    }
}

/// Streams a subscription keeps open at once; beyond this the oldest is abandoned.
const MAX_OPEN_STREAMS: usize = 1024;

/// Failed segment ids remembered so their stragglers are refused.
const MAX_FAILED_STREAMS: usize = 1024;

struct Assembly {
    sender: mpsc::UnboundedSender<Result<Segment, ReassemblyError>>,
    next_index: u64,
    finisher: Finisher,
    handler: JoinHandle<()>,
}

struct Dispatcher<X>
where
    X: DeliveryHandler,
{
    scope: Scope,
    handler: X,
    settle: Arc<dyn Settle>,
    no_ack: bool,
    payload_enabled: bool,
    tracker: TaskTracker,
    streams: IndexMap<String, Assembly>,
    completed: Vec<JoinHandle<()>>,
    failed: IndexSet<String>,
}

impl<X> Dispatcher<X>
where
    X: DeliveryHandler,
{
    async fn process_deliveries(mut self, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            let segment = if self.payload_enabled {
                SegmentHeader::parse(delivery.message.headers())
            } else {
                Ok(None)
            };

            match segment {
                Ok(None) => self.deliver_standalone(delivery).await,
                Ok(Some(header)) => self.deliver_segment(header, delivery).await,
                Err(e) => {
                    self.scope.fault(&e.to_string());
                    self.refuse(delivery.delivery_tag).await;
                }
            }
        }

        if !self.streams.is_empty() {
            warn!(
                consumer_tag = %self.scope.consumer_tag,
                streams = self.streams.len(),
                "subscription ended with incomplete streams"
            );
        }
        while let Some((segment_id, assembly)) = self.streams.shift_remove_index(0) {
            drop(Self::abandon(segment_id, assembly));
        }
        debug!(consumer_tag = %self.scope.consumer_tag, "delivery stream ended");
    }

    fn abandon(segment_id: String, assembly: Assembly) -> JoinHandle<()> {
        let _ = assembly.sender.send(Err(ReassemblyError::Incomplete {
            segment_id,
            received: assembly.next_index,
        }));
        assembly.handler
    }

    fn remember_failed(&mut self, segment_id: String) {
        if self.failed.len() >= MAX_FAILED_STREAMS {
            self.failed.shift_remove_index(0);
        }
        self.failed.insert(segment_id);
    }

    /// Waits for the handlers of streams whose last segment already arrived, so
    /// a later delivery is never handled before them.
    async fn await_completed(&mut self) {
        for handler in self.completed.drain(..) {
            if let Err(e) = handler.await {
                warn!(consumer_tag = %self.scope.consumer_tag, "stream handler task failed: {e}");
            }
        }
    }

    async fn refuse(&self, delivery_tag: u64) {
        if self.no_ack {
            return;
        }
        if let Err(e) = self.settle.refuse(delivery_tag, false).await {
            warn!(consumer_tag = %self.scope.consumer_tag, "failed to reject delivery: {e}");
        }
    }

    async fn deliver_standalone(&mut self, delivery: Delivery) {
        self.await_completed().await;

        let finisher = Finisher::new(self.settle.clone(), self.no_ack, vec![delivery.delivery_tag]);
        let ledger = finisher.share();
        let delivered = Delivered {
            info: DeliveryInfo::of(&delivery, None),
            content: delivery.message.content,
            properties: delivery.message.properties,
            payload: None,
        };

        // Run on its own task so a panicking handler cannot take the subscription down.
        let handler = self.handler.clone();
        let outcome = tokio::spawn(async move { handler.handle(delivered, finisher).await }).await;
        self.scope.conclude(outcome, ledger).await;
    }

    async fn deliver_segment(&mut self, header: SegmentHeader, delivery: Delivery) {
        let SegmentHeader {
            segment_id,
            index,
            is_last,
        } = header;

        if self.failed.contains(&segment_id) {
            debug!(segment_id = %segment_id, index, "dropping segment of failed stream");
            if is_last {
                self.failed.shift_remove(&segment_id);
            }
            self.refuse(delivery.delivery_tag).await;
            return;
        }

        if !self.streams.contains_key(&segment_id) {
            self.await_completed().await;
            self.open_stream(&segment_id, &delivery);
        }

        let expected = self
            .streams
            .get(&segment_id)
            .map_or(0, |assembly| assembly.next_index);

        if index != expected {
            let error = ReassemblyError::Gap {
                segment_id: segment_id.clone(),
                expected,
                received: index,
            };
            self.scope.fault(&error.to_string());
            if let Some(assembly) = self.streams.shift_remove(&segment_id) {
                let _ = assembly.sender.send(Err(error));
                self.completed.push(assembly.handler);
            }
            if !is_last {
                self.remember_failed(segment_id);
            }
            self.refuse(delivery.delivery_tag).await;
            return;
        }

        let Some(assembly) = self.streams.get_mut(&segment_id) else {
            return;
        };
        if let Err(e) = assembly.finisher.track(delivery.delivery_tag).await {
            warn!(segment_id = %segment_id, "failed to settle segment: {e}");
        }
        assembly.next_index += 1;
        let _ = assembly.sender.send(Ok(Segment {
            index,
            is_last,
            content: delivery.message.content,
        }));

        if is_last {
            debug!(segment_id = %segment_id, segments = index + 1, "stream complete");
            if let Some(assembly) = self.streams.shift_remove(&segment_id) {
                self.completed.push(assembly.handler);
            }
        }
    }

    fn open_stream(&mut self, segment_id: &str, first: &Delivery) {
        if self.streams.len() >= MAX_OPEN_STREAMS {
            if let Some((oldest, assembly)) = self.streams.shift_remove_index(0) {
                warn!(segment_id = %oldest, "too many open streams, abandoning the oldest");
                self.scope.fault(&format!("stream {oldest} abandoned"));
                let handler = Self::abandon(oldest.clone(), assembly);
                self.completed.push(handler);
                self.remember_failed(oldest);
            }
        }

        let (sender, payload) = PayloadStream::channel();
        let finisher = Finisher::new(self.settle.clone(), self.no_ack, Vec::new());

        let mut properties = first.message.properties.clone();
        strip_reserved(&mut properties.headers);
        let delivered = Delivered {
            content: Bytes::new(),
            properties,
            info: DeliveryInfo::of(first, Some(segment_id.to_string())),
            payload: Some(payload),
        };

        let handler = self.handler.clone();
        let scope = self.scope.clone();
        let ledger = finisher.share();
        let tracked = finisher.share();
        let handler = self.tracker.spawn(async move {
            let outcome =
                tokio::spawn(async move { handler.handle(delivered, finisher).await }).await;
            scope.conclude(outcome, ledger).await;
        });

        debug!(segment_id = %segment_id, "stream opened");
        self.streams.insert(
            segment_id.to_string(),
            Assembly {
                sender,
                next_index: 0,
                finisher: tracked,
                handler,
            },
        );
    }
}

/// Owns one channel and one consumer subscription on it.
pub struct ConsumerSandbox<C>
where
    C: Channel,
{
    engine_id: String,
    consumer_tag: String,
    queue_name: String,
    channel: Arc<C>,
    tracker: TaskTracker,
    cancelled: AtomicBool,
}

impl<C> ConsumerSandbox<C>
where
    C: Channel,
{
    /// Starts consuming `queue_name` and dispatching deliveries to `handler`.
    ///
    /// Standalone messages are handled one at a time in delivery order. Each
    /// reassembled stream gets its own handler invocation running alongside.
    /// A stream takes its place in delivery order at its last segment: later
    /// deliveries wait until its handler has returned. Streams still open when
    /// the subscription ends yield [`ReassemblyError::Incomplete`].
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the subscription is refused.
    pub async fn subscribe<X>(
        engine_id: String,
        channel: C,
        queue_name: String,
        spec: &QueueSpec,
        handler: X,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self, Error>
    where
        X: DeliveryHandler,
    {
        let subscription = channel
            .consume(
                &queue_name,
                ConsumeOptions {
                    no_ack: spec.no_ack,
                    exclusive: spec.exclusive,
                    prefetch: spec.prefetch,
                },
            )
            .await
            .map_err(|e| Error::transport(&e))?;

        let channel = Arc::new(channel);
        let settle: Arc<dyn Settle> = channel.clone();
        let tracker = TaskTracker::new();

        let dispatcher = Dispatcher {
            scope: Scope {
                engine_id: engine_id.as_str().into(),
                consumer_tag: subscription.consumer_tag.as_str().into(),
                observer,
            },
            handler,
            settle,
            no_ack: spec.no_ack,
            payload_enabled: spec.payload_enabled,
            tracker: tracker.clone(),
            streams: IndexMap::new(),
            completed: Vec::new(),
            failed: IndexSet::new(),
        };
        tracker.spawn(dispatcher.process_deliveries(subscription.deliveries));

        debug!(
            engine_id = %engine_id,
            consumer_tag = %subscription.consumer_tag,
            queue = %queue_name,
            "consumer sandbox subscribed"
        );

        Ok(Self {
            engine_id,
            consumer_tag: subscription.consumer_tag,
            queue_name,
            channel,
            tracker,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Broker consumer tag.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Queue being consumed.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Unsubscribes and waits for every dispatched handler to complete,
    /// then closes the channel. Unsettled deliveries return to the queue.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if cancelling or closing fails.
    pub async fn cancel(&self) -> Result<(), Error> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self
            .channel
            .cancel(&self.consumer_tag)
            .await
            .map_err(|e| Error::transport(&e));

        self.tracker.close();
        self.tracker.wait().await;

        let closed = self
            .channel
            .close()
            .await
            .map_err(|e| Error::transport(&e));

        debug!(engine_id = %self.engine_id, consumer_tag = %self.consumer_tag, "consumer sandbox cancelled");
        cancelled.and(closed)
    }
}

impl<C> Debug for ConsumerSandbox<C>
where
    C: Channel,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSandbox")
            .field("engine_id", &self.engine_id)
            .field("consumer_tag", &self.consumer_tag)
            .field("queue_name", &self.queue_name)
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observer::CountingObserver;
    use crate::segment::{IS_LAST_SEGMENT, SEGMENT_ID, SEGMENT_INDEX};

    use std::time::Duration;

    use courier_transport::{Headers, Message, Properties, Publish, QueueDeclaration, Transport};
    use courier_transport_memory::{MemoryChannel, MemoryTransport};
    use futures::StreamExt;
    use thiserror::Error;
    use tokio::time::timeout;

    #[derive(Debug, Error)]
    #[error("test handler failed")]
    struct TestError;

    impl DeliveryHandlerError for TestError {}

    #[derive(Clone, Debug)]
    enum Behaviour {
        Finish,
        Fail,
        Panic,
        Collect,
        Segments,
    }

    #[derive(Clone, Debug)]
    struct TestHandler {
        behaviour: Behaviour,
        seen: mpsc::UnboundedSender<Result<Bytes, ReassemblyError>>,
    }

    #[async_trait]
    impl DeliveryHandler for TestHandler {
        type Error = TestError;

        async fn handle(&self, delivery: Delivered, finisher: Finisher) -> Result<(), TestError> {
            match self.behaviour {
                Behaviour::Finish => {
                    let _ = self.seen.send(Ok(delivery.content));
                    finisher.finish().await.map_err(|_| TestError)
                }
                Behaviour::Fail => Err(TestError),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Collect => {
                    let payload = delivery.payload.ok_or(TestError)?;
                    let result = payload.into_bytes().await;
                    let ok = result.is_ok();
                    let _ = self.seen.send(result);
                    if ok {
                        finisher.finish().await.map_err(|_| TestError)
                    } else {
                        finisher.reject(false).await.map_err(|_| TestError)
                    }
                }
                Behaviour::Segments => {
                    let mut payload = delivery.payload.ok_or(TestError)?;
                    while let Some(segment) = payload.next().await {
                        match segment {
                            Ok(segment) => {
                                let _ = self.seen.send(Ok(segment.content));
                            }
                            Err(e) => {
                                let _ = self.seen.send(Err(e));
                                return finisher.reject(false).await.map_err(|_| TestError);
                            }
                        }
                    }
                    finisher.finish().await.map_err(|_| TestError)
                }
            }
        }
    }

    async fn declare(transport: &MemoryTransport) -> MemoryChannel {
        let channel = transport.create_channel().await.unwrap();
        channel
            .declare_queue(&QueueDeclaration {
                name: "work".to_string(),
                dead_letter_queue: Some("work.trash".to_string()),
                ..QueueDeclaration::default()
            })
            .await
            .unwrap();
        channel
    }

    fn publish(channel: &MemoryChannel, body: &'static str, headers: Headers) {
        channel
            .publish(Publish {
                exchange: String::new(),
                routing_key: "work".to_string(),
                cc: Vec::new(),
                message: Message::with_properties(
                    body,
                    Properties {
                        headers,
                        ..Properties::default()
                    },
                ),
            })
            .unwrap();
    }

    async fn subscribe(
        transport: &MemoryTransport,
        spec: QueueSpec,
        behaviour: Behaviour,
        observer: Arc<CountingObserver>,
    ) -> (
        ConsumerSandbox<MemoryChannel>,
        mpsc::UnboundedReceiver<Result<Bytes, ReassemblyError>>,
    ) {
        let (seen, receiver) = mpsc::unbounded_channel();
        let channel = transport.create_channel().await.unwrap();
        let sandbox = ConsumerSandbox::subscribe(
            "test".to_string(),
            channel,
            "work".to_string(),
            &spec,
            TestHandler { behaviour, seen },
            observer,
        )
        .await
        .unwrap();
        (sandbox, receiver)
    }

    #[tokio::test]
    async fn test_standalone_messages_in_order_and_acked() {
        let transport = MemoryTransport::default();
        let producer = declare(&transport).await;
        let observer = Arc::new(CountingObserver::new());
        let (sandbox, mut seen) =
            subscribe(&transport, QueueSpec::named("work"), Behaviour::Finish, observer).await;

        for body in ["0", "1", "2"] {
            publish(&producer, body, Headers::new());
        }

        for expected in ["0", "1", "2"] {
            let body = timeout(Duration::from_secs(1), seen.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(body, expected);
        }

        sandbox.cancel().await.unwrap();
        assert_eq!(transport.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_dead_letter() {
        for behaviour in [Behaviour::Fail, Behaviour::Panic] {
            let transport = MemoryTransport::default();
            let producer = declare(&transport).await;
            let observer = Arc::new(CountingObserver::new());
            let (sandbox, _seen) =
                subscribe(&transport, QueueSpec::named("work"), behaviour, observer.clone()).await;

            publish(&producer, "poison", Headers::new());
            publish(&producer, "poison", Headers::new());

            timeout(Duration::from_secs(1), async {
                while transport.queue_depth("work.trash") != Some(2) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();

            assert!(observer.counts().faults >= 2);
            sandbox.cancel().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_index_gap_fails_the_stream() {
        let transport = MemoryTransport::default();
        let producer = declare(&transport).await;
        let observer = Arc::new(CountingObserver::new());
        let spec = QueueSpec {
            payload_enabled: true,
            ..QueueSpec::named("work")
        };
        let (sandbox, mut seen) =
            subscribe(&transport, spec, Behaviour::Collect, observer.clone()).await;

        let segment = |index: u64| {
            Headers::new()
                .with(SEGMENT_ID, "s-1")
                .with(SEGMENT_INDEX, index)
        };
        publish(&producer, "a", segment(0));
        publish(&producer, "c", segment(2));

        let result = timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            Err(ReassemblyError::Gap {
                segment_id: "s-1".to_string(),
                expected: 1,
                received: 2,
            })
        );

        sandbox.cancel().await.unwrap();
        assert_eq!(transport.queue_depth("work.trash"), Some(2));
        assert!(observer.counts().faults >= 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_reports_incomplete() {
        let transport = MemoryTransport::default();
        let producer = declare(&transport).await;
        let observer = Arc::new(CountingObserver::new());
        let spec = QueueSpec {
            payload_enabled: true,
            ..QueueSpec::named("work")
        };
        let (sandbox, mut seen) = subscribe(&transport, spec, Behaviour::Segments, observer).await;

        for (index, body) in ["a", "b"].into_iter().enumerate() {
            publish(
                &producer,
                body,
                Headers::new()
                    .with(SEGMENT_ID, "s-1")
                    .with(SEGMENT_INDEX, index as u64),
            );
        }
        for expected in ["a", "b"] {
            let body = timeout(Duration::from_secs(1), seen.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(body, expected);
        }

        timeout(Duration::from_secs(1), sandbox.cancel())
            .await
            .unwrap()
            .unwrap();

        let result = timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            Err(ReassemblyError::Incomplete {
                segment_id: "s-1".to_string(),
                received: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_failed_stream_is_forgotten_after_its_last_segment() {
        let transport = MemoryTransport::default();
        let producer = declare(&transport).await;
        let observer = Arc::new(CountingObserver::new());
        let spec = QueueSpec {
            payload_enabled: true,
            ..QueueSpec::named("work")
        };
        let (sandbox, mut seen) = subscribe(&transport, spec, Behaviour::Collect, observer).await;

        let segment = |index: u64, is_last: bool| {
            Headers::new()
                .with(SEGMENT_ID, "s-1")
                .with(SEGMENT_INDEX, index)
                .with(IS_LAST_SEGMENT, is_last)
        };
        publish(&producer, "a", segment(0, false));
        publish(&producer, "c", segment(2, false));
        publish(&producer, "d", segment(3, true));

        let result = timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReassemblyError::Gap { .. })));

        // The id can be reused once the failed stream's last segment went by.
        publish(&producer, "x", segment(0, false));
        publish(&producer, "y", segment(1, true));
        let result = timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(Bytes::from_static(b"xy")));

        sandbox.cancel().await.unwrap();
        assert_eq!(transport.queue_depth("work.trash"), Some(3));
    }
}
