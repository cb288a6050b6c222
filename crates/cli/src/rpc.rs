use crate::{Error, RpcArgs};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_engine::{CountingObserver, EngineConfig, ObserverCounts};
use courier_rpc::{
    JobEvent, JobStatus, MasterConfig, Request, ResponseEmitter, Routine, RoutineError, RpcMaster,
    RpcWorker, WorkerConfig,
};
use courier_transport::Headers;
use courier_transport_memory::MemoryTransport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
enum FibonacciError {
    #[error("gave up on {0} at step {1}")]
    GaveUp(u64, u64),

    #[error(transparent)]
    Rpc(#[from] courier_rpc::Error),
}

impl RoutineError for FibonacciError {}

#[derive(Debug, Deserialize)]
struct Input {
    number: u64,
}

#[derive(Clone, Debug)]
struct Fibonacci {
    fail_on: Option<u64>,
}

#[async_trait]
impl Routine for Fibonacci {
    type Error = FibonacciError;

    async fn run(&self, request: Request, response: ResponseEmitter) -> Result<(), FibonacciError> {
        let Input { number } = request.json()?;
        response.emit_started().await?;

        let (mut current, mut next) = (0u64, 1u64);
        for step in 1..=number {
            (current, next) = (next, current.saturating_add(next));
            response
                .emit_progress(step, &json!({ "value": current }))
                .await?;

            if self.fail_on == Some(number) && step == number / 2 {
                return Err(FibonacciError::GaveUp(number, step));
            }
        }

        response
            .emit_completed(&json!({ "number": number, "value": current }))
            .await?;
        Ok(())
    }
}

/// What the RPC demo observed.
#[derive(Debug, Default, Serialize)]
pub struct RpcSummary {
    requests: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    progress_events: u64,
    counts: ObserverCounts,
}

/// Serves `args.requests` fibonacci requests with `args.workers` workers.
pub async fn run(
    transport: &MemoryTransport,
    engine: EngineConfig,
    args: &RpcArgs,
    observer: &Arc<CountingObserver>,
) -> Result<RpcSummary, Error> {
    let master = RpcMaster::with_observer(
        transport.clone(),
        MasterConfig {
            monitor_timeout: Duration::from_millis(args.monitor_timeout_ms),
            progress_enabled: !args.no_progress,
            ..MasterConfig::new(engine.clone())
        },
        observer.clone(),
    )?;
    master.ready().await?;

    let operator = format!("{}.operator", engine.routing_key);
    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let config = WorkerConfig {
            consumer_total: args.consumer_total,
            ..WorkerConfig::new(engine.clone(), operator.clone())
        };
        let worker = RpcWorker::with_observer(transport.clone(), config, observer.clone())?;
        worker
            .process(
                "fibonacci",
                Fibonacci {
                    fail_on: args.fail_on,
                },
            )
            .await?;
        workers.push(worker);
    }
    info!(workers = workers.len(), operator = %operator, "workers ready");

    let mut jobs = Vec::new();
    for number in 0..args.requests {
        let job = master
            .request("fibonacci", &json!({ "number": 10 + number }), Headers::new())
            .await?;
        jobs.push(job);
    }

    let mut summary = RpcSummary {
        requests: args.requests,
        ..RpcSummary::default()
    };
    for mut job in jobs {
        while let Some(event) = job.next_event().await {
            if matches!(event, JobEvent::Progress { .. }) {
                summary.progress_events += 1;
            }
        }
        match job.status() {
            JobStatus::Completed => summary.completed += 1,
            JobStatus::Failed => summary.failed += 1,
            JobStatus::TimedOut => summary.timed_out += 1,
            status => warn!(request_id = %job.request_id(), status = %status, "job did not end"),
        }
    }

    master.close().await?;
    for worker in workers {
        worker.close().await?;
    }

    summary.counts = observer.counts();
    Ok(summary)
}
