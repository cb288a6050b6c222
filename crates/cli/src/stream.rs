use crate::{Error, StreamArgs};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_engine::{
    CountingObserver, Delivered, DeliveryHandler, DeliveryHandlerError, Engine, EngineConfig,
    Finisher, ObserverCounts, Payload, ProduceOptions, QueueSpec,
};
use courier_transport::Headers;
use courier_transport_memory::MemoryTransport;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
#[error("collector failed: {0}")]
struct CollectorError(String);

impl DeliveryHandlerError for CollectorError {}

#[derive(Debug)]
enum Collected {
    Stream { segments: usize, bytes: usize },
    Message,
}

#[derive(Clone, Debug)]
struct Collector {
    collected: mpsc::UnboundedSender<Collected>,
}

#[async_trait]
impl DeliveryHandler for Collector {
    type Error = CollectorError;

    async fn handle(&self, delivery: Delivered, finisher: Finisher) -> Result<(), CollectorError> {
        let collected = match delivery.payload {
            Some(mut payload) => {
                let (mut segments, mut bytes) = (0, 0);
                while let Some(segment) = payload.next().await {
                    let segment = segment.map_err(|e| CollectorError(e.to_string()))?;
                    segments += 1;
                    bytes += segment.content.len();
                    debug!(index = segment.index, "segment received");
                }
                Collected::Stream { segments, bytes }
            }
            None => Collected::Message,
        };

        finisher
            .finish()
            .await
            .map_err(|e| CollectorError(e.to_string()))?;
        self.collected
            .send(collected)
            .map_err(|e| CollectorError(e.to_string()))
    }
}

/// What the stream demo observed.
#[derive(Debug, Default, Serialize)]
pub struct StreamSummary {
    segments_sent: usize,
    segments_received: usize,
    bytes_sent: usize,
    bytes_received: usize,
    messages_received: usize,
    counts: ObserverCounts,
}

/// Streams `args.chunks` chunks through one queue while ordinary messages
/// are published alongside.
pub async fn run(
    transport: &MemoryTransport,
    config: EngineConfig,
    args: &StreamArgs,
    observer: &Arc<CountingObserver>,
) -> Result<StreamSummary, Error> {
    let consumer = Engine::with_observer(transport.clone(), config.clone(), observer.clone())?;
    let producer = Engine::with_observer(
        transport.clone(),
        EngineConfig {
            confirmation: true,
            exchange_quota: Some(args.quota),
            ..config.clone()
        },
        observer.clone(),
    )?;

    let (collected, mut received) = mpsc::unbounded_channel();
    let queue = format!("{}.stream", config.routing_key);
    consumer
        .consume(
            Collector { collected },
            Some(QueueSpec {
                payload_enabled: true,
                ..QueueSpec::named(queue.clone())
            }),
        )
        .await?;
    info!(queue = %queue, "consumer ready");

    let chunks: Vec<Bytes> = (0..args.chunks)
        .map(|index| Bytes::from(vec![index.to_le_bytes()[0]; args.chunk_size]))
        .collect();
    let mut summary = StreamSummary {
        bytes_sent: args.chunks * args.chunk_size,
        ..StreamSummary::default()
    };

    let streaming = {
        let producer = producer.clone();
        tokio::spawn(async move {
            producer
                .produce(
                    Payload::stream(futures::stream::iter(chunks)),
                    Headers::new().with("kind", "stream"),
                    ProduceOptions::default(),
                )
                .await
        })
    };
    for index in 0..args.interleaved {
        producer
            .produce(
                format!("ordinary {index}"),
                Headers::new().with("kind", "ordinary"),
                ProduceOptions::default(),
            )
            .await?;
    }
    let produced = streaming
        .await
        .map_err(|e| Error::Demo(format!("stream task failed: {e}")))??;
    summary.segments_sent = produced.messages;

    for _ in 0..=args.interleaved {
        match received.recv().await {
            Some(Collected::Stream { segments, bytes }) => {
                summary.segments_received = segments;
                summary.bytes_received = bytes;
            }
            Some(Collected::Message) => summary.messages_received += 1,
            None => return Err(Error::Demo("collector stopped early".to_string())),
        }
    }

    producer.close().await?;
    consumer.close().await?;

    summary.counts = observer.counts();
    Ok(summary)
}
