//! A master's handle to one outstanding request.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One lifecycle event of a job, in the order the worker emitted it.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// The worker picked the request up.
    Started,

    /// Intermediate progress.
    Progress {
        /// Step reported by the routine.
        step: u64,
        /// Data attached to the step.
        data: Value,
    },

    /// The routine's result.
    Completed(Value),

    /// The routine failed, or the master closed before a result arrived.
    Failed(String),

    /// No terminal event arrived before the deadline.
    TimedOut,
}

impl JobEvent {
    /// Status reached once this event is observed.
    #[must_use]
    pub const fn status(&self) -> JobStatus {
        match self {
            Self::Started => JobStatus::Started,
            Self::Progress { .. } => JobStatus::Progress,
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::TimedOut => JobStatus::TimedOut,
        }
    }

    /// Whether no further events follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Sent; nothing heard back yet.
    Initialized,

    /// The worker picked the request up.
    Started,

    /// At least one progress event arrived.
    Progress,

    /// Finished with a result.
    Completed,

    /// Finished with an error.
    Failed,

    /// Deadline passed without a terminal event.
    TimedOut,
}

impl JobStatus {
    /// Whether the job is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timedOut",
        })
    }
}

/// How a job ended. Timing out is an outcome, not an error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Caller-visible request id.
    pub request_id: String,

    /// Final status.
    pub status: JobStatus,

    /// The routine's result, when completed.
    pub value: Option<Value>,

    /// The failure reason, when failed.
    pub error: Option<String>,
}

impl JobResult {
    /// Whether the routine produced a result.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Whether the routine failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.status == JobStatus::Failed
    }

    /// Whether the deadline passed first.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.status == JobStatus::TimedOut
    }
}

/// An outstanding request.
///
/// Events arrive in the order the worker emitted them and end with exactly
/// one terminal event: completed, failed or timed out.
#[derive(Debug)]
pub struct Job {
    routine_id: String,
    request_id: String,
    correlation_id: String,
    created_at: Instant,
    deadline: Instant,
    status: JobStatus,
    value: Option<Value>,
    error: Option<String>,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl Job {
    pub(crate) const fn new(
        routine_id: String,
        request_id: String,
        correlation_id: String,
        created_at: Instant,
        deadline: Instant,
        events: mpsc::UnboundedReceiver<JobEvent>,
    ) -> Self {
        Self {
            routine_id,
            request_id,
            correlation_id,
            created_at,
            deadline,
            status: JobStatus::Initialized,
            value: None,
            error: None,
            events,
        }
    }

    /// Routine the request was sent to.
    #[must_use]
    pub fn routine_id(&self) -> &str {
        &self.routine_id
    }

    /// Caller-visible request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Id matching responses to this request.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// When the request was issued.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the job times out without a terminal event.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Status after the events observed so far.
    #[must_use]
    pub const fn status(&self) -> JobStatus {
        self.status
    }

    /// Waits for the next event. Returns `None` once a terminal event has
    /// been observed.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.status.is_terminal() {
            return None;
        }

        let event = self
            .events
            .recv()
            .await
            .unwrap_or_else(|| JobEvent::Failed("response channel closed".to_string()));

        match &event {
            JobEvent::Completed(value) => self.value = Some(value.clone()),
            JobEvent::Failed(error) => self.error = Some(error.clone()),
            _ => {}
        }
        self.status = event.status();

        Some(event)
    }

    /// Waits for the job to end, skipping any events not yet observed.
    pub async fn extract_result(mut self) -> JobResult {
        while self.next_event().await.is_some() {}

        JobResult {
            request_id: self.request_id,
            status: self.status,
            value: self.value,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn job() -> (mpsc::UnboundedSender<JobEvent>, Job) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let now = Instant::now();
        (
            sender,
            Job::new(
                "fibonacci".to_string(),
                "req-1".to_string(),
                "corr-1".to_string(),
                now,
                now,
                receiver,
            ),
        )
    }

    #[tokio::test]
    async fn test_events_stop_after_terminal() {
        let (sender, mut job) = job();
        sender.send(JobEvent::Started).unwrap();
        sender.send(JobEvent::Completed(json!(55))).unwrap();
        sender.send(JobEvent::TimedOut).unwrap();

        assert_eq!(job.next_event().await, Some(JobEvent::Started));
        assert_eq!(job.status(), JobStatus::Started);
        assert_eq!(job.next_event().await, Some(JobEvent::Completed(json!(55))));
        assert_eq!(job.next_event().await, None);

        let result = job.extract_result().await;
        assert!(result.completed());
        assert_eq!(result.value, Some(json!(55)));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_the_job() {
        let (sender, job) = job();
        drop(sender);

        let result = job.extract_result().await;
        assert!(result.failed());
        assert_eq!(result.error.as_deref(), Some("response channel closed"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_outcome() {
        let (sender, job) = job();
        sender.send(JobEvent::Started).unwrap();
        sender.send(JobEvent::TimedOut).unwrap();

        let result = job.extract_result().await;
        assert!(result.timed_out());
        assert_eq!(result.value, None);
        assert_eq!(result.error, None);
    }
}
