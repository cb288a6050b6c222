//! Serving requests: routine registration, dispatch and response events.

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, PROGRESS_ENABLED, REQUEST_ID, ROUTINE_ID, STATUS, Status};

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_engine::{
    Delivered, DeliveryHandler, Engine, EngineObserver, Finisher, NoopObserver, ProduceOptions,
    QueueSpec, Subscribed,
};
use courier_transport::{Headers, Transport};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Marker trait for routine errors.
pub trait RoutineError: StdError + Send + Sync + 'static {}

/// Application code serving one routine id.
#[async_trait]
pub trait Routine
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the routine.
    type Error: RoutineError;

    /// Serves one request. An error, a panic or returning without a terminal
    /// emit makes the worker send a failed event on the routine's behalf.
    async fn run(&self, request: Request, response: ResponseEmitter) -> Result<(), Self::Error>;
}

/// A request as seen by a routine.
#[derive(Clone, Debug)]
pub struct Request {
    /// Routine the request was sent to.
    pub routine_id: String,

    /// Caller-visible request id.
    pub request_id: String,

    /// Raw request body.
    pub body: Bytes,

    /// Request headers, including the protocol headers.
    pub headers: Headers,
}

impl Request {
    /// Decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the body is not valid JSON for `B`.
    pub fn json<B>(&self) -> Result<B>
    where
        B: DeserializeOwned,
    {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
trait ErasedRoutine: Send + Sync {
    async fn invoke(&self, request: Request, response: ResponseEmitter) -> Result<(), String>;
}

#[async_trait]
impl<R> ErasedRoutine for R
where
    R: Routine,
{
    async fn invoke(&self, request: Request, response: ResponseEmitter) -> Result<(), String> {
        self.run(request, response).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
trait EventSink: Send + Sync {
    async fn publish(
        &self,
        content: Bytes,
        headers: Headers,
        options: ProduceOptions,
    ) -> Result<(), courier_engine::Error>;
}

#[async_trait]
impl<T> EventSink for Engine<T>
where
    T: Transport,
{
    async fn publish(
        &self,
        content: Bytes,
        headers: Headers,
        options: ProduceOptions,
    ) -> Result<(), courier_engine::Error> {
        self.produce(content, headers, options).await.map(|_| ())
    }
}

#[derive(Debug)]
struct EventRoute {
    reply_to: String,
    correlation_id: String,
    routine_id: String,
    request_id: String,
}

/// Sends lifecycle events for one request back to the master.
///
/// Events go out in call order. Exactly one terminal event is allowed.
#[derive(Clone)]
pub struct ResponseEmitter {
    sink: Arc<dyn EventSink>,
    route: Arc<EventRoute>,
    progress_enabled: bool,
    finished: Arc<AtomicBool>,
}

impl ResponseEmitter {
    fn new(sink: Arc<dyn EventSink>, route: EventRoute, progress_enabled: bool) -> Self {
        Self {
            sink,
            route: Arc::new(route),
            progress_enabled,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Caller-visible request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.route.request_id
    }

    /// Whether the master asked for progress events.
    #[must_use]
    pub const fn progress_enabled(&self) -> bool {
        self.progress_enabled
    }

    /// Whether a terminal event was sent.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Reports that the routine picked the request up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFinished`] after a terminal event, or the
    /// engine's error.
    pub async fn emit_started(&self) -> Result<()> {
        self.ensure_open()?;
        self.send(Status::Started, Bytes::new()).await
    }

    /// Reports progress. Skipped when the master disabled progress events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFinished`] after a terminal event,
    /// [`Error::Codec`] when `data` cannot be encoded, or the engine's error.
    pub async fn emit_progress<D>(&self, step: u64, data: &D) -> Result<()>
    where
        D: Serialize + Sync + ?Sized,
    {
        self.ensure_open()?;
        if !self.progress_enabled {
            return Ok(());
        }
        let body = protocol::progress_body(step, data)?;
        self.send(Status::Progress, body).await
    }

    /// Sends the routine's result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFinished`] after a terminal event,
    /// [`Error::Codec`] when `result` cannot be encoded, or the engine's error.
    pub async fn emit_completed<R>(&self, result: &R) -> Result<()>
    where
        R: Serialize + Sync + ?Sized,
    {
        let body = protocol::encode(result)?;
        self.claim_terminal()?;
        self.send(Status::Completed, body).await
    }

    /// Sends a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFinished`] after a terminal event, or the
    /// engine's error.
    pub async fn emit_failed<E>(&self, error: E) -> Result<()>
    where
        E: Display + Send,
    {
        let body = protocol::failure_body(error.to_string())?;
        self.claim_terminal()?;
        self.send(Status::Failed, body).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::AlreadyFinished(self.route.request_id.clone()));
        }
        Ok(())
    }

    fn claim_terminal(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyFinished(self.route.request_id.clone()));
        }
        Ok(())
    }

    async fn send(&self, status: Status, content: Bytes) -> Result<()> {
        let route = &self.route;
        let headers = Headers::new()
            .with(ROUTINE_ID, route.routine_id.as_str())
            .with(REQUEST_ID, route.request_id.as_str())
            .with(STATUS, status.as_str());

        self.sink
            .publish(
                content,
                headers,
                ProduceOptions {
                    routing_key: Some(route.reply_to.clone()),
                    correlation_id: Some(route.correlation_id.clone()),
                    ..ProduceOptions::default()
                },
            )
            .await?;

        debug!(request_id = %route.request_id, status = %status, "event sent");
        Ok(())
    }
}

impl Debug for ResponseEmitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEmitter")
            .field("route", &self.route)
            .field("progress_enabled", &self.progress_enabled)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

type Routines = Arc<RwLock<HashMap<String, Arc<dyn ErasedRoutine>>>>;

/// Delivery handler on the operator queue.
#[derive(Clone)]
struct Dispatch {
    routines: Routines,
    sink: Arc<dyn EventSink>,
    response_name: Option<String>,
}

impl Debug for Dispatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("routines", &self.routines.read().keys().collect::<Vec<_>>())
            .field("response_name", &self.response_name)
            .finish_non_exhaustive()
    }
}

impl Dispatch {
    /// Runs the routine, returning the fault to report if it did not finish cleanly.
    async fn run(&self, request: Request, response: ResponseEmitter) -> Option<String> {
        let routine = self.routines.read().get(&request.routine_id).cloned();
        let Some(routine) = routine else {
            return Some(Error::UnknownRoutine(request.routine_id).to_string());
        };

        match tokio::spawn(async move { routine.invoke(request, response).await }).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(format!("routine panicked: {e}")),
        }
    }
}

#[async_trait]
impl DeliveryHandler for Dispatch {
    type Error = Error;

    async fn handle(&self, delivery: Delivered, finisher: Finisher) -> Result<(), Self::Error> {
        let Delivered {
            content,
            properties,
            payload,
            ..
        } = delivery;

        let Some(correlation_id) = properties.correlation_id else {
            warn!("request without correlation id dropped");
            finisher.finish().await?;
            return Ok(());
        };
        let Some(reply_to) = properties.reply_to.or_else(|| self.response_name.clone()) else {
            warn!(correlation_id = %correlation_id, "request without reply queue dropped");
            finisher.finish().await?;
            return Ok(());
        };

        let body = match payload {
            Some(stream) => stream
                .into_bytes()
                .await
                .map_err(courier_engine::Error::from)?,
            None => content,
        };

        let headers = properties.headers;
        let routine_id = headers.get_str(ROUTINE_ID).unwrap_or_default().to_string();
        let request_id = headers
            .get_str(REQUEST_ID)
            .map_or_else(|| correlation_id.clone(), ToString::to_string);
        let progress_enabled = headers.get_bool(PROGRESS_ENABLED).unwrap_or(true);

        let response = ResponseEmitter::new(
            self.sink.clone(),
            EventRoute {
                reply_to,
                correlation_id,
                routine_id: routine_id.clone(),
                request_id: request_id.clone(),
            },
            progress_enabled,
        );
        let request = Request {
            routine_id,
            request_id,
            body,
            headers,
        };

        let fault = self
            .run(request, response.clone())
            .await
            .or_else(|| {
                (!response.is_finished()).then(|| "routine returned without a result".to_string())
            });

        if let Some(fault) = fault {
            if response.is_finished() {
                debug!(request_id = %response.request_id(), "routine failed after its result: {fault}");
            } else {
                warn!(request_id = %response.request_id(), "routine failed: {fault}");
                if let Err(e) = response.emit_failed(&fault).await {
                    warn!(request_id = %response.request_id(), "failed to report routine failure: {e}");
                }
            }
        }

        finisher.finish().await?;
        Ok(())
    }
}

struct WorkerInner<T>
where
    T: Transport,
{
    engine: Engine<T>,
    config: WorkerConfig,
    routines: Routines,
    subscriptions: Mutex<Vec<Subscribed>>,
}

/// Consumes requests from an operator queue and serves them with registered routines.
pub struct RpcWorker<T>
where
    T: Transport,
{
    inner: Arc<WorkerInner<T>>,
}

impl<T> Clone for RpcWorker<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for RpcWorker<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcWorker")
            .field("engine", &self.inner.engine)
            .field("operator_name", &self.inner.config.operator_name)
            .finish_non_exhaustive()
    }
}

impl<T> RpcWorker<T>
where
    T: Transport,
{
    /// Creates a worker with no observer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn new(transport: T, config: WorkerConfig) -> Result<Self> {
        Self::with_observer(transport, config, Arc::new(NoopObserver))
    }

    /// Creates a worker whose engine reports to `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn with_observer(
        transport: T,
        config: WorkerConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = Engine::with_observer(transport, config.engine.clone(), observer)?;

        Ok(Self {
            inner: Arc::new(WorkerInner {
                engine,
                config,
                routines: Arc::new(RwLock::new(HashMap::new())),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The worker's configuration.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Registers `routine` under `routine_id`, replacing any previous one,
    /// and makes sure the worker is consuming.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if subscribing fails.
    pub async fn process<R>(&self, routine_id: impl Into<String>, routine: R) -> Result<()>
    where
        R: Routine,
    {
        let routine_id = routine_id.into();
        debug!(routine_id = %routine_id, "routine registered");
        self.inner
            .routines
            .write()
            .insert(routine_id, Arc::new(routine));

        self.ready().await
    }

    /// Opens `consumer_total` competing subscriptions on the operator queue.
    /// Does nothing when already consuming.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if subscribing fails.
    pub async fn ready(&self) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            return Ok(());
        }

        let engine = &self.inner.engine;
        engine.ready().await?;

        let config = &self.inner.config;
        let dispatch = Dispatch {
            routines: self.inner.routines.clone(),
            sink: Arc::new(engine.clone()),
            response_name: config.response_name.clone(),
        };
        let spec = QueueSpec {
            payload_enabled: true,
            ..QueueSpec::named(config.operator_name.clone())
        };

        for _ in 0..config.consumer_total {
            subscriptions.push(engine.consume(dispatch.clone(), Some(spec.clone())).await?);
        }

        info!(
            operator = %config.operator_name,
            consumers = config.consumer_total,
            "worker ready"
        );
        Ok(())
    }

    /// Stops consuming and closes the engine. Requests being served finish first.
    ///
    /// # Errors
    ///
    /// Returns the first error met while closing.
    pub async fn close(&self) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let engine = &self.inner.engine;

        // Routines still running need the producer to send their results.
        let mut first_error = None;
        for subscribed in subscriptions.drain(..) {
            if let Err(e) = engine.cancel_consumer(&subscribed.consumer_tag).await {
                warn!(consumer_tag = %subscribed.consumer_tag, "failed to cancel subscription: {e}");
                first_error.get_or_insert(e);
            }
        }
        engine.close().await?;
        if let Some(e) = first_error {
            return Err(e.into());
        }

        info!(operator = %self.inner.config.operator_name, "worker closed");
        Ok(())
    }
}
