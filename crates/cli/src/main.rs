//! CLI binary running courier demos against the in-memory broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod rpc;
mod stream;

use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use courier_engine::{CountingObserver, EngineConfig};
use courier_transport_memory::{MemoryOptions, MemoryTransport};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine error
    #[error(transparent)]
    Engine(#[from] courier_engine::Error),

    /// RPC error
    #[error(transparent)]
    Rpc(#[from] courier_rpc::Error),

    /// Summary could not be printed
    #[error("summary error: {0}")]
    Summary(#[from] serde_json::Error),

    /// A demo step did not complete
    #[error("demo failed: {0}")]
    Demo(String),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Exchange every demo message goes through
    #[arg(long, default_value = "courier", env = "COURIER_EXCHANGE")]
    exchange: String,

    /// Routing key requests and stream payloads are published with
    #[arg(long, default_value = "fibonacci", env = "COURIER_ROUTING_KEY")]
    routing_key: String,

    /// Unsent publishes a channel buffers before signalling backpressure
    #[arg(long, default_value_t = 256, env = "COURIER_WRITE_BUFFER_HIGH_WATER")]
    write_buffer_high_water: usize,

    #[command(subcommand)]
    demo: Demo,
}

#[derive(Clone, Debug, Subcommand)]
enum Demo {
    /// Fibonacci routines served by competing workers
    Rpc(RpcArgs),

    /// One streamed payload, reassembled by a consumer
    Stream(StreamArgs),
}

#[derive(Clone, Debug, ClapArgs)]
struct RpcArgs {
    /// Number of requests to send
    #[arg(long, default_value_t = 12, env = "COURIER_RPC_REQUESTS")]
    requests: u64,

    /// Number of worker instances
    #[arg(long, default_value_t = 2, env = "COURIER_RPC_WORKERS")]
    workers: usize,

    /// Competing subscriptions per worker
    #[arg(long, default_value_t = 1, env = "COURIER_RPC_CONSUMER_TOTAL")]
    consumer_total: usize,

    /// Milliseconds a job may wait for its result
    #[arg(long, default_value_t = 2000, env = "COURIER_RPC_MONITOR_TIMEOUT_MS")]
    monitor_timeout_ms: u64,

    /// Skip progress events
    #[arg(long, env = "COURIER_RPC_NO_PROGRESS")]
    no_progress: bool,

    /// Input for which the routine fails halfway
    #[arg(long, env = "COURIER_RPC_FAIL_ON")]
    fail_on: Option<u64>,
}

#[derive(Clone, Debug, ClapArgs)]
struct StreamArgs {
    /// Number of chunks in the streamed payload
    #[arg(long, default_value_t = 32, env = "COURIER_STREAM_CHUNKS")]
    chunks: usize,

    /// Bytes per chunk
    #[arg(long, default_value_t = 4096, env = "COURIER_STREAM_CHUNK_SIZE")]
    chunk_size: usize,

    /// Maximum unconfirmed publishes in flight
    #[arg(long, default_value_t = 8, env = "COURIER_STREAM_QUOTA")]
    quota: usize,

    /// Ordinary messages interleaved with the stream
    #[arg(long, default_value_t = 4, env = "COURIER_STREAM_INTERLEAVED")]
    interleaved: usize,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            application_id: Some("courier-cli".to_string()),
            ..EngineConfig::new(self.exchange.clone(), self.routing_key.clone())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Summary {
    Rpc(rpc::RpcSummary),
    Stream(stream::StreamSummary),
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let transport = MemoryTransport::new(MemoryOptions {
        write_buffer_high_water: args.write_buffer_high_water,
        ..MemoryOptions::default()
    });
    let observer = Arc::new(CountingObserver::new());
    let config = args.engine_config();

    let demo = async {
        match &args.demo {
            Demo::Rpc(rpc_args) => rpc::run(&transport, config, rpc_args, &observer)
                .await
                .map(Summary::Rpc),
            Demo::Stream(stream_args) => stream::run(&transport, config, stream_args, &observer)
                .await
                .map(Summary::Stream),
        }
    };

    tokio::select! {
        result = demo => {
            let summary = result?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!("demo finished");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt signal");
            Err(Error::Demo("interrupted".to_string()))
        }
    }
}
