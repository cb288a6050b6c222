//! Request/response with progress events on top of `courier-engine`.
//!
//! An [`RpcMaster`] publishes requests to an operator routing key and tracks
//! each one as a [`Job`]. An [`RpcWorker`] consumes the operator queue, runs
//! the [`Routine`] registered for the request and sends `started`, `progress`
//! and a terminal `completed` or `failed` event back to the master's
//! response queue, correlated by id.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Master and worker configuration.
pub mod config;

/// Jobs and their events.
pub mod job;

/// Request issuing and event routing.
pub mod master;

/// Header names and event bodies.
pub mod protocol;

/// Routine registration and dispatch.
pub mod worker;

mod error;

pub use config::{MasterConfig, WorkerConfig};
pub use error::{Error, Result};
pub use job::{Job, JobEvent, JobResult, JobStatus};
pub use master::RpcMaster;
pub use worker::{Request, ResponseEmitter, Routine, RoutineError, RpcWorker};
