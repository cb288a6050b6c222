//! Headers and bodies exchanged between masters and workers.
//!
//! Requests carry the routine id, the request id and whether progress events
//! are wanted. Every event a worker sends back carries a `status` header and a
//! JSON body whose shape depends on the status.

use crate::error::{Error, Result};
use crate::job::JobEvent;

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use courier_transport::Headers;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header naming the routine a request is for.
pub const ROUTINE_ID: &str = "routineId";

/// Header carrying the caller-visible request id.
pub const REQUEST_ID: &str = "requestId";

/// Header telling workers whether to publish progress events.
pub const PROGRESS_ENABLED: &str = "progressEnabled";

/// Header carrying an event's status.
pub const STATUS: &str = "status";

/// Status of an event message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The worker picked the request up.
    Started,

    /// Intermediate progress.
    Progress,

    /// The routine produced its result.
    Completed,

    /// The routine failed.
    Failed,
}

impl Status {
    /// Wire form of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Reads the wire form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "progress" => Some(Self::Progress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further events follow this one.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProgressBody {
    step: u64,
    data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailureBody {
    error: String,
}

pub(crate) fn encode<T>(value: &T) -> Result<Bytes>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_vec(value)?.into())
}

pub(crate) fn progress_body<D>(step: u64, data: &D) -> Result<Bytes>
where
    D: Serialize + ?Sized,
{
    encode(&ProgressBody {
        step,
        data: serde_json::to_value(data)?,
    })
}

pub(crate) fn failure_body(error: String) -> Result<Bytes> {
    encode(&FailureBody { error })
}

/// Decodes an event message into the job event it stands for.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for a missing or unknown status and
/// [`Error::Codec`] when the body does not match the status.
pub fn decode_event(headers: &Headers, content: &[u8]) -> Result<JobEvent> {
    let raw = headers
        .get_str(STATUS)
        .ok_or_else(|| Error::Malformed(format!("{STATUS} header is missing")))?;
    let status =
        Status::parse(raw).ok_or_else(|| Error::Malformed(format!("unknown status {raw}")))?;

    Ok(match status {
        Status::Started => JobEvent::Started,
        Status::Progress => {
            let body: ProgressBody = serde_json::from_slice(content)?;
            JobEvent::Progress {
                step: body.step,
                data: body.data,
            }
        }
        Status::Completed => JobEvent::Completed(serde_json::from_slice(content)?),
        Status::Failed => {
            let body: FailureBody = serde_json::from_slice(content)?;
            JobEvent::Failed(body.error)
        }
    })
}
