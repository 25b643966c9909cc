use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use super::engine::MemoryBroker;
use super::{Channel, Connector, DeliveryStream, Endpoint, PublishFlags, QueueSpec};
use crate::utils::error::TransportError;

const QUEUE: &str = "first_names";

fn endpoint() -> Endpoint {
    Endpoint {
        host: "localhost".to_string(),
        port: 5672,
        username: "guest".to_string(),
        password: "guest".to_string(),
        vhost: "/".to_string(),
    }
}

async fn open(broker: &MemoryBroker) -> Arc<dyn Channel> {
    broker.connect(&endpoint()).await.unwrap()
}

async fn next_body(stream: &mut DeliveryStream) -> super::Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for a delivery")
        .expect("stream ended")
        .expect("delivery error")
}

#[test]
fn test_queue_spec_mismatch() {
    let durable = QueueSpec::durable(QUEUE);
    assert_eq!(durable.mismatch(&durable.clone()), None);

    let transient = QueueSpec {
        durable: false,
        ..durable.clone()
    };
    let reason = transient.mismatch(&durable).unwrap();
    assert!(reason.contains("durable=false"));
}

#[test]
fn test_endpoint_display_hides_password() {
    let endpoint = Endpoint {
        password: "s3cret".to_string(),
        ..endpoint()
    };
    let shown = endpoint.to_string();
    assert_eq!(shown, "guest@localhost:5672/");
    assert!(!shown.contains("s3cret"));
}

#[tokio::test]
async fn test_declare_is_idempotent() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;

    let first = channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    let second = channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.queue_count(), 1);
}

#[tokio::test]
async fn test_declare_with_conflicting_parameters_fails() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();

    let conflicting = QueueSpec {
        durable: false,
        ..QueueSpec::durable(QUEUE)
    };
    let err = channel.declare_queue(&conflicting).await.unwrap_err();
    assert!(matches!(err, TransportError::QueueConflict { .. }));
    assert!(broker.has_queue(QUEUE));
}

#[tokio::test]
async fn test_mandatory_publish_to_missing_queue_is_unroutable() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;

    let err = channel
        .publish("nowhere", b"{}", PublishFlags::RELIABLE)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unroutable(q) if q == "nowhere"));

    // Without the mandatory flag the message is silently discarded.
    let lenient = PublishFlags {
        mandatory: false,
        ..PublishFlags::RELIABLE
    };
    channel.publish("nowhere", b"{}", lenient).await.unwrap();
}

#[tokio::test]
async fn test_deliveries_arrive_in_publish_order() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();

    for body in ["one", "two", "three"] {
        channel
            .publish(QUEUE, body.as_bytes(), PublishFlags::RELIABLE)
            .await
            .unwrap();
    }
    assert_eq!(broker.ready_count(QUEUE), Some(3));

    let mut stream = channel.consume(QUEUE, "c1").await.unwrap();
    for expected in ["one", "two", "three"] {
        let delivery = next_body(&mut stream).await;
        assert_eq!(delivery.body, expected.as_bytes());
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();
    }
    assert_eq!(broker.ready_count(QUEUE), Some(0));
    assert_eq!(broker.unacked_count(QUEUE), 0);
}

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_disconnect() {
    let broker = MemoryBroker::new();
    let first = open(&broker).await;
    first.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    first
        .publish(QUEUE, b"Ada", PublishFlags::RELIABLE)
        .await
        .unwrap();

    let mut stream = first.consume(QUEUE, "c1").await.unwrap();
    let delivery = next_body(&mut stream).await;
    assert_eq!(broker.unacked_count(QUEUE), 1);

    // Consumer goes away without acknowledging.
    drop(stream);
    drop(first);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), Some(1));

    // Settling on a dead channel is refused, the message stays queued.
    assert!(delivery.ack().await.is_err());

    let second = open(&broker).await;
    let mut stream = second.consume(QUEUE, "c2").await.unwrap();
    let redelivered = next_body(&mut stream).await;
    assert_eq!(redelivered.body, b"Ada");
    assert!(redelivered.redelivered);
    redelivered.ack().await.unwrap();

    assert_eq!(broker.ready_count(QUEUE), Some(0));
    assert_eq!(broker.unacked_count(QUEUE), 0);
}

#[tokio::test]
async fn test_dropped_connections_end_streams_with_error() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    let mut stream = channel.consume(QUEUE, "c1").await.unwrap();

    broker.drop_connections();

    let item = stream.next().await.unwrap();
    assert!(matches!(item, Err(TransportError::ConnectionLost(_))));
    assert!(stream.next().await.is_none());
    assert!(!channel.is_open());

    let err = channel
        .publish(QUEUE, b"late", PublishFlags::RELIABLE)
        .await
        .unwrap_err();
    assert!(err.is_connection_loss());
}

#[tokio::test]
async fn test_reject_with_requeue_offers_message_again() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    channel
        .publish(QUEUE, b"retry-me", PublishFlags::RELIABLE)
        .await
        .unwrap();

    let mut stream = channel.consume(QUEUE, "c1").await.unwrap();
    let delivery = next_body(&mut stream).await;
    delivery.reject(true).await.unwrap();

    let again = next_body(&mut stream).await;
    assert_eq!(again.body, b"retry-me");
    assert!(again.redelivered);
    assert_ne!(again.tag, delivery.tag);

    again.reject(false).await.unwrap();
    assert_eq!(broker.ready_count(QUEUE), Some(0));
    assert_eq!(broker.unacked_count(QUEUE), 0);
}

#[tokio::test]
async fn test_settling_twice_is_an_error() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    channel
        .publish(QUEUE, b"once", PublishFlags::RELIABLE)
        .await
        .unwrap();

    let mut stream = channel.consume(QUEUE, "c1").await.unwrap();
    let delivery = next_body(&mut stream).await;
    delivery.ack().await.unwrap();
    assert!(matches!(
        delivery.ack().await,
        Err(TransportError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_prefetch_limits_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    channel.set_prefetch(1).await.unwrap();
    for body in ["a", "b"] {
        channel
            .publish(QUEUE, body.as_bytes(), PublishFlags::RELIABLE)
            .await
            .unwrap();
    }

    let mut stream = channel.consume(QUEUE, "c1").await.unwrap();
    let first = next_body(&mut stream).await;
    assert_eq!(broker.ready_count(QUEUE), Some(1));
    assert_eq!(broker.unacked_count(QUEUE), 1);

    first.ack().await.unwrap();
    let second = next_body(&mut stream).await;
    assert_eq!(second.body, b"b");
}

#[tokio::test]
async fn test_competing_consumers_share_round_robin() {
    let broker = MemoryBroker::new();
    let a = open(&broker).await;
    let b = open(&broker).await;
    a.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    let mut stream_a = a.consume(QUEUE, "a").await.unwrap();
    let mut stream_b = b.consume(QUEUE, "b").await.unwrap();

    for body in ["1", "2"] {
        a.publish(QUEUE, body.as_bytes(), PublishFlags::RELIABLE)
            .await
            .unwrap();
    }

    assert_eq!(next_body(&mut stream_a).await.body, b"1");
    assert_eq!(next_body(&mut stream_b).await.body, b"2");
}

#[tokio::test]
async fn test_restart_keeps_durable_queues_and_persistent_messages() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_queue(&QueueSpec::durable(QUEUE)).await.unwrap();
    channel
        .declare_queue(&QueueSpec {
            durable: false,
            ..QueueSpec::durable("scratch")
        })
        .await
        .unwrap();

    channel
        .publish(QUEUE, b"kept", PublishFlags::RELIABLE)
        .await
        .unwrap();
    let transient = PublishFlags {
        persistent: false,
        ..PublishFlags::RELIABLE
    };
    channel.publish(QUEUE, b"lost", transient).await.unwrap();

    broker.restart();

    assert!(broker.has_queue(QUEUE));
    assert!(!broker.has_queue("scratch"));
    assert_eq!(broker.ready_count(QUEUE), Some(1));
}

#[tokio::test]
async fn test_auto_delete_queue_is_removed_with_last_consumer() {
    let broker = MemoryBroker::new();
    let owner = open(&broker).await;
    let consumer = open(&broker).await;
    let spec = QueueSpec {
        auto_delete: true,
        ..QueueSpec::durable("ephemeral")
    };
    owner.declare_queue(&spec).await.unwrap();

    let _stream = consumer.consume("ephemeral", "c1").await.unwrap();
    consumer.close().await.unwrap();

    assert!(!broker.has_queue("ephemeral"));
}

#[tokio::test]
async fn test_exclusive_queue_is_locked_to_its_owner() {
    let broker = MemoryBroker::new();
    let owner = open(&broker).await;
    let other = open(&broker).await;
    let spec = QueueSpec {
        exclusive: true,
        ..QueueSpec::durable("private")
    };
    owner.declare_queue(&spec).await.unwrap();

    assert!(matches!(
        other.declare_queue(&spec).await,
        Err(TransportError::QueueConflict { .. })
    ));
    assert!(other.consume("private", "c1").await.is_err());

    drop(owner);
    assert!(!broker.has_queue("private"));
}

#[tokio::test]
async fn test_refused_and_unauthorized_connections() {
    let broker = MemoryBroker::with_credentials("guest", "guest");
    broker.refuse_next(1);

    let err = broker.connect(&endpoint()).await.err().unwrap();
    assert!(err.is_transient());

    let wrong = Endpoint {
        password: "nope".to_string(),
        ..endpoint()
    };
    let err = broker.connect(&wrong).await.err().unwrap();
    assert!(matches!(err, TransportError::AccessRefused(_)));
    assert!(!err.is_transient());

    broker.set_reachable(false);
    assert!(broker.connect(&endpoint()).await.is_err());
    broker.set_reachable(true);
    assert!(broker.connect(&endpoint()).await.is_ok());
    assert_eq!(broker.connection_attempts(), 4);
}

#[tokio::test]
async fn test_amqp_connections_run_on_tokio() {
    let properties = super::amqp::connection_properties();
    assert!(properties.executor.is_some());
    assert!(properties.reactor.is_some());
}
