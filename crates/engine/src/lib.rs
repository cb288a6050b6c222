//! Reliable produce/consume on top of a `courier-transport` broker.
//!
//! An [`Engine`] owns one [`ProducerSandbox`] for publishing and one
//! [`ConsumerSandbox`] per subscription. Large buffers and streams are sent
//! as ordered segments and handed to consumers as a single [`PayloadStream`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration and construction-time validation.
pub mod config;

/// Subscriptions and delivery dispatch.
pub mod consumer;

/// Engine events for observability.
pub mod observer;

/// Flow-controlled, confirmed publishing.
pub mod producer;

/// Payload segmentation and reassembly.
pub mod segment;

mod error;

pub use config::{ConfigError, EngineConfig, QueueSpec, Topology, Violation};
pub use consumer::{
    ConsumerSandbox, Delivered, DeliveryHandler, DeliveryHandlerError, DeliveryInfo, Finisher,
};
pub use error::Error;
pub use observer::{CountingObserver, EngineObserver, NoopObserver, ObserverCounts};
pub use producer::{Outgoing, PendingPublish, ProducerSandbox};
pub use segment::{Payload, PayloadStream, ReassemblyError, Segment};

use segment::{Prepared, SegmentHeader, strip_reserved};

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use courier_transport::{Channel, Headers, Message, Properties, Transport};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Created; no channel open yet.
    Initializing,

    /// Producer channel open; nothing sent or consumed yet.
    Ready,

    /// At least one produce or consume call went through.
    Running,

    /// Closing or closed.
    Suspended,
}

impl Display for EngineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
        })
    }
}

/// Per-call produce options.
#[derive(Clone, Debug, Default)]
pub struct ProduceOptions {
    /// Extra routing keys that receive a copy.
    pub cc: Vec<String>,

    /// Routing key override for this call.
    pub routing_key: Option<String>,

    /// Message id; generated when absent.
    pub message_id: Option<String>,

    /// Correlation id.
    pub correlation_id: Option<String>,

    /// Queue a reply should be routed to.
    pub reply_to: Option<String>,
}

/// What a successful produce call sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Produced {
    /// Message id stamped on every message of this call.
    pub message_id: String,

    /// Payload id, when the body went out as segments.
    pub segment_id: Option<String>,

    /// Number of broker messages published.
    pub messages: usize,
}

/// A consumer started by [`Engine::consume`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribed {
    /// Broker consumer tag, used with [`Engine::cancel_consumer`].
    pub consumer_tag: String,

    /// Queue name (broker-generated when the `QueueSpec` left it empty).
    pub queue_name: String,
}

struct Lifecycle<T>
where
    T: Transport,
{
    state: EngineState,
    producer: Option<Arc<ProducerSandbox<T::Channel>>>,
    consumers: HashMap<String, Arc<ConsumerSandbox<T::Channel>>>,
}

struct EngineInner<T>
where
    T: Transport,
{
    transport: T,
    config: EngineConfig,
    observer: Arc<dyn EngineObserver>,
    lifecycle: Mutex<Lifecycle<T>>,
}

/// Produce/consume facade over one broker connection.
pub struct Engine<T>
where
    T: Transport,
{
    inner: Arc<EngineInner<T>>,
}

impl<T> Clone for Engine<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Engine<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("engine_id", &self.inner.config.engine_id)
            .field("exchange", &self.inner.config.exchange_name)
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl<T> Engine<T>
where
    T: Transport,
{
    /// Creates an engine with no observer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn new(transport: T, config: EngineConfig) -> Result<Self, Error> {
        Self::with_observer(transport, config, Arc::new(NoopObserver))
    }

    /// Creates an engine reporting to `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn with_observer(
        transport: T,
        config: EngineConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                transport,
                config,
                observer,
                lifecycle: Mutex::new(Lifecycle {
                    state: EngineState::Initializing,
                    producer: None,
                    consumers: HashMap::new(),
                }),
            }),
        })
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> EngineState {
        self.inner.lifecycle.lock().await.state
    }

    /// Opens the producer channel and declares the exchange.
    ///
    /// Calling it on a ready or running engine does nothing; calling it after
    /// [`Self::close`] opens fresh sandboxes.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the channel or exchange cannot be set up.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.ready_locked(&mut lifecycle).await
    }

    async fn ready_locked(&self, lifecycle: &mut Lifecycle<T>) -> Result<(), Error> {
        if matches!(lifecycle.state, EngineState::Ready | EngineState::Running) {
            return Ok(());
        }

        let config = &self.inner.config;
        let channel = if config.confirmation {
            self.inner.transport.create_confirm_channel().await
        } else {
            self.inner.transport.create_channel().await
        }
        .map_err(|e| Error::transport(&e))?;

        channel
            .declare_exchange(&config.exchange_declaration())
            .await
            .map_err(|e| Error::transport(&e))?;

        lifecycle.producer = Some(Arc::new(ProducerSandbox::new(
            config.engine_id.clone(),
            config.exchange_name.clone(),
            channel,
            config.exchange_quota,
            self.inner.observer.clone(),
        )));
        lifecycle.state = EngineState::Ready;

        info!(engine_id = %config.engine_id, exchange = %config.exchange_name, "engine ready");
        Ok(())
    }

    /// Publishes a payload.
    ///
    /// Buffers up to the configured segment size go out as one message. Larger
    /// buffers and streams go out as segments sharing one `segmentId`. With
    /// confirmation enabled the call resolves once the broker has confirmed
    /// every message it sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Suspended`] after [`Self::close`] began,
    /// [`Error::Nacked`] when the broker refused a message, or the broker's
    /// error.
    pub async fn produce(
        &self,
        payload: impl Into<Payload> + Send,
        headers: Headers,
        options: ProduceOptions,
    ) -> Result<Produced, Error> {
        let result = self.produce_inner(payload.into(), headers, options).await;

        if let Err(e) = &result {
            if !matches!(e, Error::Nacked { .. }) {
                self.inner
                    .observer
                    .on_produce_rejected(&self.inner.config.engine_id, e);
            }
        }

        result
    }

    async fn produce_inner(
        &self,
        payload: Payload,
        mut headers: Headers,
        options: ProduceOptions,
    ) -> Result<Produced, Error> {
        let producer = self.running_producer().await?;
        let config = &self.inner.config;

        strip_reserved(&mut headers);
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let properties = Properties {
            app_id: config.application_id.clone(),
            message_id: Some(message_id.clone()),
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            content_type: None,
            persistent: config.exchange_durable,
            headers,
        };
        let routing_key = options
            .routing_key
            .clone()
            .unwrap_or_else(|| config.routing_key.clone());

        let outgoing = |content: Bytes, properties: Properties| Outgoing {
            routing_key: routing_key.clone(),
            cc: options.cc.clone(),
            message: Message::with_properties(content, properties),
        };

        match payload.prepare(config.segment_size) {
            Prepared::Single(content) => {
                producer.produce(outgoing(content, properties)).await?;
                Ok(Produced {
                    message_id,
                    segment_id: None,
                    messages: 1,
                })
            }
            Prepared::Segmented(mut chunks) => {
                let segment_id = Uuid::new_v4().to_string();
                let mut pending = Vec::new();
                let mut index = 0;

                // One chunk of lookahead tells us which segment is last.
                let mut current = chunks.next().await;
                if current.is_none() {
                    current = Some(Bytes::new());
                }
                while let Some(content) = current {
                    let next = chunks.next().await;

                    let mut properties = properties.clone();
                    SegmentHeader {
                        segment_id: segment_id.clone(),
                        index,
                        is_last: next.is_none(),
                    }
                    .apply(&mut properties.headers);

                    pending.push(producer.submit(outgoing(content, properties)).await?);
                    index += 1;
                    current = next;
                }

                debug!(
                    engine_id = %config.engine_id,
                    segment_id = %segment_id,
                    segments = index,
                    "stream submitted"
                );

                let messages = pending.len();
                let mut first_error = None;
                for publish in pending {
                    if let Err(e) = publish.confirmed().await {
                        first_error.get_or_insert(e);
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }

                Ok(Produced {
                    message_id,
                    segment_id: Some(segment_id),
                    messages,
                })
            }
        }
    }

    async fn running_producer(&self) -> Result<Arc<ProducerSandbox<T::Channel>>, Error> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match lifecycle.state {
            EngineState::Suspended => return Err(Error::suspended()),
            EngineState::Initializing => self.ready_locked(&mut lifecycle).await?,
            EngineState::Ready | EngineState::Running => {}
        }
        lifecycle.state = EngineState::Running;
        lifecycle.producer.clone().ok_or_else(Error::suspended)
    }

    /// Declares the queue described by `spec` (or the configured default
    /// queue) and starts consuming it with `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Suspended`] after [`Self::close`] began,
    /// [`Error::Config`] when no queue is configured or the `QueueSpec` is invalid,
    /// or the broker's error (including [`Error::ResourceLocked`] when another
    /// owner holds an exclusive queue).
    pub async fn consume<X>(&self, handler: X, spec: Option<QueueSpec>) -> Result<Subscribed, Error>
    where
        X: DeliveryHandler,
    {
        let config = &self.inner.config;
        let spec = spec
            .or_else(|| config.queue.clone())
            .ok_or_else(|| ConfigError {
                violations: vec![Violation::new("queue", "no queue configured")],
            })?;
        let violations = spec.violations();
        if !violations.is_empty() {
            return Err(ConfigError { violations }.into());
        }

        let mut lifecycle = self.inner.lifecycle.lock().await;
        match lifecycle.state {
            EngineState::Suspended => return Err(Error::suspended()),
            EngineState::Initializing => self.ready_locked(&mut lifecycle).await?,
            EngineState::Ready | EngineState::Running => {}
        }

        let channel = self
            .inner
            .transport
            .create_channel()
            .await
            .map_err(|e| Error::transport(&e))?;
        let queue_name = Self::declare_topology(config, &spec, &channel).await?;

        let sandbox = ConsumerSandbox::subscribe(
            config.engine_id.clone(),
            channel,
            queue_name.clone(),
            &spec,
            handler,
            self.inner.observer.clone(),
        )
        .await?;

        let consumer_tag = sandbox.consumer_tag().to_string();
        lifecycle
            .consumers
            .insert(consumer_tag.clone(), Arc::new(sandbox));
        lifecycle.state = EngineState::Running;

        info!(engine_id = %config.engine_id, consumer_tag = %consumer_tag, queue = %queue_name, "consuming");
        Ok(Subscribed {
            consumer_tag,
            queue_name,
        })
    }

    async fn declare_topology(
        config: &EngineConfig,
        spec: &QueueSpec,
        channel: &T::Channel,
    ) -> Result<String, Error> {
        channel
            .declare_exchange(&config.exchange_declaration())
            .await
            .map_err(|e| Error::transport(&e))?;

        if let Some(recyclebin) = spec.recyclebin_declaration() {
            channel
                .declare_queue(&recyclebin)
                .await
                .map_err(|e| Error::transport(&e))?;
        }

        let queue_name = channel
            .declare_queue(&spec.queue_declaration())
            .await
            .map_err(|e| Error::transport(&e))?;

        if spec.binding {
            let binding_key = spec
                .binding_key
                .as_deref()
                .unwrap_or(&config.routing_key);
            channel
                .bind_queue(&queue_name, &config.exchange_name, binding_key)
                .await
                .map_err(|e| Error::transport(&e))?;
        }

        Ok(queue_name)
    }

    /// Cancels one consumer, waiting for its in-flight handlers.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if cancelling fails. Unknown tags are ignored.
    pub async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), Error> {
        let sandbox = self
            .inner
            .lifecycle
            .lock()
            .await
            .consumers
            .remove(consumer_tag);

        match sandbox {
            Some(sandbox) => sandbox.cancel().await,
            None => {
                debug!(consumer_tag = %consumer_tag, "cancel for unknown consumer");
                Ok(())
            }
        }
    }

    /// Drops every ready message in a queue.
    ///
    /// # Errors
    ///
    /// Returns the broker's error, e.g. when the queue does not exist.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<usize, Error> {
        let channel = self
            .inner
            .transport
            .create_channel()
            .await
            .map_err(|e| Error::transport(&e))?;

        let purged = channel
            .purge_queue(queue_name)
            .await
            .map_err(|e| Error::transport(&e));
        if let Err(e) = channel.close().await {
            warn!(queue = %queue_name, "failed to close purge channel: {e}");
        }

        let purged = purged?;
        debug!(queue = %queue_name, purged, "queue purged");
        Ok(purged)
    }

    /// Suspends the engine: new calls fail, confirmed publishes already in
    /// flight settle, consumers are cancelled after their handlers finish and
    /// every channel is closed.
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the first error met while closing; every sandbox is still closed.
    pub async fn close(&self) -> Result<(), Error> {
        let (producer, consumers) = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if lifecycle.state == EngineState::Suspended {
                return Ok(());
            }
            lifecycle.state = EngineState::Suspended;
            (
                lifecycle.producer.take(),
                lifecycle.consumers.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };

        let mut first_error = None;

        if let Some(producer) = producer {
            if let Err(e) = producer.close().await {
                first_error.get_or_insert(e);
            }
        }
        for consumer in consumers {
            if let Err(e) = consumer.cancel().await {
                first_error.get_or_insert(e);
            }
        }

        info!(engine_id = %self.inner.config.engine_id, "engine suspended");
        first_error.map_or(Ok(()), Err)
    }
}
