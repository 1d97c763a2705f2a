// Session lifecycle tests against the in-memory broker transport.

use std::sync::Arc;
use std::time::Duration;

use futures_lite::StreamExt;
use tokio::time::sleep;

use amqp_session::transport::MemoryTransport;
use amqp_session::{Confirmation, Session, SessionConfig, SessionError};

fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_reinit_delay(Duration::from_millis(20))
        .with_resend_delay(Duration::from_millis(60))
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn reconnect_retries_until_dial_succeeds() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_dials(3);

    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    // Three failures plus the successful attempt
    assert_eq!(transport.dial_count(), 4);
}

#[tokio::test]
async fn push_fails_fast_while_not_connected() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_dials(usize::MAX);

    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    assert!(!session.is_ready());

    let err = session.push("events", b"payload").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));

    let err = session.unsafe_push("events", b"payload").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));

    assert!(matches!(
        session.stream().await,
        Err(SessionError::NotConnected)
    ));

    // The transport was never asked to publish
    assert_eq!(transport.publish_count(), 0);
}

#[tokio::test]
async fn push_returns_after_first_positive_confirm() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    session.push("events", b"payload").await.unwrap();
    assert_eq!(transport.publish_count(), 1);
}

#[tokio::test]
async fn push_republishes_after_negative_confirm() {
    let transport = Arc::new(MemoryTransport::new());
    transport.script_confirm(Some(Confirmation::Nack));

    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    session.push("events", b"payload").await.unwrap();
    assert_eq!(transport.publish_count(), 2);
}

#[tokio::test]
async fn push_republishes_after_confirm_timeout() {
    let transport = Arc::new(MemoryTransport::new());
    // The first publish's confirm never arrives
    transport.script_confirm(None);

    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    session.push("events", b"payload").await.unwrap();
    assert_eq!(transport.publish_count(), 2);
}

#[tokio::test]
async fn unsafe_push_makes_exactly_one_attempt() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    transport.fail_publishes(1);
    let err = session.unsafe_push("events", b"payload").await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
    assert_eq!(transport.publish_count(), 1);
}

#[tokio::test]
async fn channel_failure_recovers_without_redialing() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    let dials = transport.dial_count();
    let opens = transport.channel_open_count();

    transport.close_channel("simulated channel exception");
    eventually("channel reinitialized", || {
        transport.channel_open_count() > opens
    })
    .await;
    eventually("session ready again", || session.is_ready()).await;

    // Channel-only recovery: the connection was never redialed
    assert_eq!(transport.dial_count(), dials);
}

#[tokio::test]
async fn connection_failure_triggers_exactly_one_redial() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    let dials = transport.dial_count();
    transport.close_connection("simulated connection loss");

    eventually("session ready again", || session.is_ready()).await;
    assert_eq!(transport.dial_count(), dials + 1);
}

#[tokio::test]
async fn channel_init_failures_are_retried() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_channel_opens(2);

    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    assert_eq!(transport.dial_count(), 1);
    assert_eq!(transport.channel_open_count(), 3);
}

#[tokio::test]
async fn close_twice_reports_already_closed() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    session.close().await.unwrap();
    assert!(!session.is_ready());

    let err = session.close().await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyClosed));

    // A closed session fails publishes fast
    let err = session.push("events", b"payload").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
}

#[tokio::test]
async fn shutdown_interrupts_a_pending_push_retry() {
    let transport = Arc::new(MemoryTransport::new());
    let config = test_config().with_resend_delay(Duration::from_millis(500));
    let session = Session::with_transport("events", "memory://", config, transport.clone());
    eventually("session ready", || session.is_ready()).await;

    // Every publish call fails, parking push in its retry wait
    transport.fail_publishes(usize::MAX);
    let pusher = session.clone();
    let push = tokio::spawn(async move { pusher.push("events", b"payload").await });

    eventually("first publish attempt", || transport.publish_count() >= 1).await;
    session.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), push)
        .await
        .expect("push did not observe shutdown")
        .expect("push task panicked");
    assert!(matches!(result.unwrap_err(), SessionError::ShuttingDown));
}

#[tokio::test]
async fn queue_identity_and_delivery_order_survive_channel_failures() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("orders", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    // Sent before any disruption, with no consumer attached yet
    transport.deliver("orders", "orders", b"before");

    for round in 1..=3u32 {
        transport.close_channel("simulated channel exception");
        let expected = 1 + round as usize;
        eventually("queue redeclared", || {
            transport.declared_queues().len() >= expected
        })
        .await;
    }
    eventually("session ready again", || session.is_ready()).await;

    // Re-initialization declared the same queue with the same identity
    let declared = transport.declared_queues();
    assert_eq!(declared.len(), 4);
    assert!(declared.iter().all(|q| q == "orders"));

    transport.deliver("orders", "orders", b"after");

    let mut deliveries = session.stream().await.unwrap();
    let first = deliveries.next().await.unwrap();
    assert_eq!(first.payload, b"before".to_vec());
    first.accept().await.unwrap();

    let second = deliveries.next().await.unwrap();
    assert_eq!(second.payload, b"after".to_vec());
    second.accept().await.unwrap();

    assert_eq!(transport.accepted().len(), 2);
}

#[tokio::test]
async fn published_messages_reach_the_queue_consumer() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("events", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    let mut deliveries = session.stream().await.unwrap();
    session.push("events", b"hello").await.unwrap();

    let delivery = deliveries.next().await.unwrap();
    assert_eq!(delivery.routing_key, "events");
    assert_eq!(delivery.payload, b"hello".to_vec());
    delivery.reject(false).await.unwrap();

    assert_eq!(transport.rejected().len(), 1);
}

#[tokio::test]
async fn derived_session_shares_the_connection() {
    let transport = Arc::new(MemoryTransport::new());
    let session = Session::with_transport("orders", "memory://", test_config(), transport.clone());
    eventually("session ready", || session.is_ready()).await;

    let derived = session.derive("invoices").unwrap();
    eventually("derived session ready", || derived.is_ready()).await;

    // Channel-only initialization: no second dial
    assert_eq!(transport.dial_count(), 1);
    assert!(transport.declared_queues().contains(&"invoices".to_string()));

    derived.push("invoices", b"payload").await.unwrap();
}

#[tokio::test]
async fn derive_requires_a_live_connection() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_dials(usize::MAX);

    let session = Session::with_transport("orders", "memory://", test_config(), transport.clone());
    assert!(matches!(
        session.derive("invoices"),
        Err(SessionError::NotConnected)
    ));
}
