use std::time::Duration;

use courier_transport::{
    Channel, ConsumeOptions, ExchangeDeclaration, ExchangeKind, Headers, Message, Properties,
    Publish, QueueDeclaration, Transport,
};
use courier_transport_memory::MemoryTransport;
use tokio::time::timeout;

#[tokio::test]
async fn test_fanout_reaches_every_bound_queue_with_headers() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = MemoryTransport::default();
    let channel = transport.create_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeDeclaration {
            name: "events".to_string(),
            kind: ExchangeKind::Fanout,
            durable: false,
        })
        .await
        .unwrap();

    let mut subscriptions = Vec::new();
    for name in ["audit", "billing"] {
        channel
            .declare_queue(&QueueDeclaration {
                name: name.to_string(),
                ..QueueDeclaration::default()
            })
            .await
            .unwrap();
        channel.bind_queue(name, "events", "ignored").await.unwrap();
        subscriptions.push(
            channel
                .consume(
                    name,
                    ConsumeOptions {
                        no_ack: true,
                        ..ConsumeOptions::default()
                    },
                )
                .await
                .unwrap(),
        );
    }

    let headers = Headers::new()
        .with("tenant", "acme")
        .with("attempt", 1)
        .with("urgent", false);
    let properties = Properties {
        app_id: Some("billing-service".to_string()),
        message_id: Some("m-1".to_string()),
        headers: headers.clone(),
        ..Properties::default()
    };

    channel
        .publish(Publish {
            exchange: "events".to_string(),
            routing_key: "anything".to_string(),
            cc: Vec::new(),
            message: Message::with_properties(
                serde_json::to_vec(&serde_json::json!({"total": 42})).unwrap(),
                properties,
            ),
        })
        .unwrap();

    for subscription in &mut subscriptions {
        let delivery = timeout(Duration::from_secs(1), subscription.deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&delivery.message.content).unwrap();
        assert_eq!(body["total"], 42);
        assert_eq!(delivery.message.properties.app_id.as_deref(), Some("billing-service"));
        assert_eq!(delivery.message.properties.headers, headers);
    }
}

#[tokio::test]
async fn test_cancel_ends_delivery_stream() {
    let transport = MemoryTransport::default();
    let channel = transport.create_channel().await.unwrap();
    channel
        .declare_queue(&QueueDeclaration {
            name: "jobs".to_string(),
            ..QueueDeclaration::default()
        })
        .await
        .unwrap();

    let mut subscription = channel
        .consume("jobs", ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(transport.consumer_count("jobs"), Some(1));

    channel.cancel(&subscription.consumer_tag).await.unwrap();
    assert_eq!(transport.consumer_count("jobs"), Some(0));

    let end = timeout(Duration::from_secs(1), subscription.deliveries.recv())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let transport = MemoryTransport::default();
    let channel = transport.create_channel().await.unwrap();
    channel
        .declare_queue(&QueueDeclaration {
            name: "direct-reply".to_string(),
            ..QueueDeclaration::default()
        })
        .await
        .unwrap();

    channel
        .publish(Publish {
            exchange: String::new(),
            routing_key: "direct-reply".to_string(),
            cc: Vec::new(),
            message: Message::new("pong"),
        })
        .unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.queue_depth("direct-reply"), Some(1));
}
