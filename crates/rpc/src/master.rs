//! Issuing requests and routing their events back to jobs.

use crate::config::MasterConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobEvent};
use crate::protocol::{self, PROGRESS_ENABLED, REQUEST_ID, ROUTINE_ID};

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_engine::{
    Delivered, DeliveryHandler, Engine, EngineObserver, Finisher, NoopObserver, ProduceOptions,
    QueueSpec,
};
use courier_transport::{Headers, Transport};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingJob {
    request_id: String,
    deadline: Instant,
    events: mpsc::UnboundedSender<JobEvent>,
}

/// Jobs awaiting their terminal event, keyed by correlation id.
///
/// Mutated by the response consumer and the timeout sweep; both go through
/// the one lock.
#[derive(Default)]
struct JobTable {
    pending: SyncMutex<HashMap<String, PendingJob>>,
}

impl JobTable {
    fn insert(&self, correlation_id: String, job: PendingJob) {
        self.pending.lock().insert(correlation_id, job);
    }

    fn remove(&self, correlation_id: &str) {
        self.pending.lock().remove(correlation_id);
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hands an event to its job. Returns false when no job is waiting for it.
    fn dispatch(&self, correlation_id: &str, event: JobEvent) -> bool {
        let mut pending = self.pending.lock();

        if event.is_terminal() {
            return pending
                .remove(correlation_id)
                .is_some_and(|job| job.events.send(event).is_ok());
        }

        let Some(job) = pending.get(correlation_id) else {
            return false;
        };
        if job.events.send(event).is_err() {
            // Job handle dropped.
            pending.remove(correlation_id);
            return false;
        }
        true
    }

    /// Times out every job whose deadline has passed.
    fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.pending.lock().retain(|correlation_id, job| {
            if job.deadline > now {
                return true;
            }
            expired.push((correlation_id.clone(), job.request_id.clone()));
            let _ = job.events.send(JobEvent::TimedOut);
            false
        });

        for (correlation_id, request_id) in &expired {
            debug!(correlation_id = %correlation_id, request_id = %request_id, "job timed out");
        }
        expired.len()
    }

    fn fail_all(&self, reason: &str) {
        for (_, job) in self.pending.lock().drain() {
            let _ = job.events.send(JobEvent::Failed(reason.to_string()));
        }
    }
}

/// Delivery handler on the response queue.
#[derive(Clone)]
struct ResponseRouter {
    jobs: Arc<JobTable>,
}

impl Debug for ResponseRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("pending", &self.jobs.len())
            .finish()
    }
}

#[async_trait]
impl DeliveryHandler for ResponseRouter {
    type Error = Error;

    async fn handle(&self, delivery: Delivered, finisher: Finisher) -> Result<(), Self::Error> {
        let Delivered {
            content,
            properties,
            payload,
            ..
        } = delivery;

        let Some(correlation_id) = properties.correlation_id else {
            debug!("event without correlation id dropped");
            finisher.finish().await?;
            return Ok(());
        };

        let content = match payload {
            Some(stream) => stream
                .into_bytes()
                .await
                .map_err(courier_engine::Error::from)?,
            None => content,
        };

        let event = protocol::decode_event(&properties.headers, &content).unwrap_or_else(|e| {
            warn!(correlation_id = %correlation_id, "malformed event: {e}");
            JobEvent::Failed(format!("malformed event: {e}"))
        });

        if !self.jobs.dispatch(&correlation_id, event) {
            debug!(correlation_id = %correlation_id, "event for unknown job dropped");
        }

        finisher.finish().await?;
        Ok(())
    }
}

struct Session {
    consumer_tag: String,
    monitor: CancellationToken,
    tracker: TaskTracker,
}

struct MasterInner<T>
where
    T: Transport,
{
    engine: Engine<T>,
    config: MasterConfig,
    response_name: String,
    jobs: Arc<JobTable>,
    session: Mutex<Option<Session>>,
}

/// Issues requests and tracks each one as a [`Job`].
pub struct RpcMaster<T>
where
    T: Transport,
{
    inner: Arc<MasterInner<T>>,
}

impl<T> Clone for RpcMaster<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for RpcMaster<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMaster")
            .field("engine", &self.inner.engine)
            .field("response_name", &self.inner.response_name)
            .field("pending", &self.inner.jobs.len())
            .finish_non_exhaustive()
    }
}

impl<T> RpcMaster<T>
where
    T: Transport,
{
    /// Creates a master with no observer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn new(transport: T, config: MasterConfig) -> Result<Self> {
        Self::with_observer(transport, config, Arc::new(NoopObserver))
    }

    /// Creates a master whose engine reports to `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every configuration violation.
    pub fn with_observer(
        transport: T,
        config: MasterConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = Engine::with_observer(transport, config.engine.clone(), observer)?;
        let response_name = config.response_name.clone().unwrap_or_else(|| {
            format!("{}.response.{}", config.engine.routing_key, Uuid::new_v4())
        });

        Ok(Self {
            inner: Arc::new(MasterInner {
                engine,
                config,
                response_name,
                jobs: Arc::new(JobTable::default()),
                session: Mutex::new(None),
            }),
        })
    }

    /// The master's configuration.
    #[must_use]
    pub fn config(&self) -> &MasterConfig {
        &self.inner.config
    }

    /// Queue (and binding key) events come back on.
    #[must_use]
    pub fn response_name(&self) -> &str {
        &self.inner.response_name
    }

    /// Number of jobs still waiting for a terminal event.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Starts consuming the response queue and the timeout sweep. Does
    /// nothing when already started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateResponseQueue`] when another master owns the
    /// response queue, or the engine's error.
    pub async fn ready(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let engine = &self.inner.engine;
        let response_name = &self.inner.response_name;
        engine.ready().await?;

        let spec = QueueSpec {
            exclusive: true,
            auto_delete: true,
            binding_key: Some(response_name.clone()),
            payload_enabled: true,
            ..QueueSpec::named(response_name.clone())
        };
        let router = ResponseRouter {
            jobs: self.inner.jobs.clone(),
        };
        let subscribed = engine
            .consume(router, Some(spec))
            .await
            .map_err(|e| match e {
                courier_engine::Error::ResourceLocked(_) => {
                    Error::DuplicateResponseQueue(response_name.clone())
                }
                other => other.into(),
            })?;

        let monitor = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(Self::monitor(
            self.inner.jobs.clone(),
            self.inner.config.monitor_interval,
            monitor.clone(),
        ));
        tracker.close();

        *session = Some(Session {
            consumer_tag: subscribed.consumer_tag,
            monitor,
            tracker,
        });

        info!(response = %response_name, "master ready");
        Ok(())
    }

    /// One sweep loop per master, however many jobs are pending.
    async fn monitor(jobs: Arc<JobTable>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = jobs.sweep(Instant::now());
                    if expired > 0 {
                        info!(expired, "jobs timed out");
                    }
                }
            }
        }
    }

    /// Sends a request to `routine_id` and returns its job.
    ///
    /// A `requestId` header supplied by the caller is kept as the job's
    /// request id; otherwise the generated correlation id is used. The master
    /// is started on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when `body` cannot be encoded, or the
    /// engine's error if the request could not be published.
    pub async fn request<B>(&self, routine_id: &str, body: &B, mut headers: Headers) -> Result<Job>
    where
        B: Serialize + Sync + ?Sized,
    {
        let content = protocol::encode(body)?;
        self.ready().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let request_id = headers
            .get_str(REQUEST_ID)
            .map_or_else(|| correlation_id.clone(), ToString::to_string);
        headers.insert(ROUTINE_ID, routine_id);
        headers.insert(REQUEST_ID, request_id.as_str());
        headers.insert(PROGRESS_ENABLED, self.inner.config.progress_enabled);

        let created_at = Instant::now();
        let deadline = created_at + self.inner.config.monitor_timeout;
        let (events, receiver) = mpsc::unbounded_channel();
        // Registered before publishing so no event can beat its job.
        self.inner.jobs.insert(
            correlation_id.clone(),
            PendingJob {
                request_id: request_id.clone(),
                deadline,
                events,
            },
        );

        let produced = self
            .inner
            .engine
            .produce(
                content,
                headers,
                ProduceOptions {
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(self.inner.response_name.clone()),
                    ..ProduceOptions::default()
                },
            )
            .await;
        if let Err(e) = produced {
            self.inner.jobs.remove(&correlation_id);
            return Err(e.into());
        }

        debug!(
            routine_id = %routine_id,
            request_id = %request_id,
            correlation_id = %correlation_id,
            "request sent"
        );
        Ok(Job::new(
            routine_id.to_string(),
            request_id,
            correlation_id,
            created_at,
            deadline,
            receiver,
        ))
    }

    /// Stops the sweep, closes the engine and fails every pending job.
    ///
    /// Safe to call more than once; [`Self::ready`] starts the master again.
    ///
    /// # Errors
    ///
    /// Returns the first error met while closing the engine.
    pub async fn close(&self) -> Result<()> {
        let session = self.inner.session.lock().await.take();

        if let Some(session) = session {
            session.monitor.cancel();
            session.tracker.wait().await;
            debug!(consumer_tag = %session.consumer_tag, "response consumer stopping");
        }

        let closed = self.inner.engine.close().await;
        self.inner.jobs.fail_all("master closed");

        info!(response = %self.inner.response_name, "master closed");
        closed.map_err(Error::from)
    }
}
