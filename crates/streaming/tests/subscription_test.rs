//! Durable registrations and one-off subscriptions across reconnects.

mod common;

use common::{Received, client, eventually, payloads};

use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use harbor_bus::{Message, SubscriptionHandler};
use harbor_bus_memory::{Error as MemoryError, MemoryBus};
use harbor_streaming::{Error, RegistrationStatus, SubscriptionSpec};
use tokio::sync::mpsc;
use tracing_test::traced_test;

/// Handler that awaits before passing each payload on.
struct Forwarder(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl SubscriptionHandler for Forwarder {
    async fn handle(&self, message: Message) {
        tokio::task::yield_now().await;
        let _ = self.0.send(message.payload);
    }
}

#[tokio::test]
async fn test_registered_subscription_survives_connection_loss() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let received = Received::default();

    let status = client
        .register("order-events", received.spec("orders.*"))
        .await
        .unwrap();
    assert_eq!(status, RegistrationStatus::Active);

    client.publish("orders.created", "before").await.unwrap();
    eventually(|| received.len() == 1).await;

    let first = client.connection().unwrap().generation();
    bus.sever("network partition");
    eventually(|| {
        client
            .connection()
            .is_ok_and(|live| live.generation() > first)
            && bus.subscriber_count("orders.*") == 1
    })
    .await;

    client.publish("orders.created", "after").await.unwrap();
    eventually(|| received.len() == 2).await;
    assert_eq!(received.payloads(), payloads(&["before", "after"]));
}

#[tokio::test]
#[traced_test]
async fn test_failed_reinstatement_does_not_block_others() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let audit = Received::default();
    let orders = Received::default();

    bus.reject_subscriptions_to("audit");
    assert_matches!(
        client.register("audit", audit.spec("audit")).await,
        Err(Error::Bus(MemoryError::SubscriptionRejected(_)))
    );
    assert_eq!(
        client.register("orders", orders.spec("orders")).await.unwrap(),
        RegistrationStatus::Active
    );
    assert_eq!(client.registrations(), 2);

    let report = client.reconnect().await.unwrap();

    assert_eq!(report.subscriptions.attempted, 2);
    assert_eq!(report.subscriptions.reinstated, 1);
    assert_eq!(report.subscriptions.failed, vec!["audit".to_string()]);
    assert_eq!(bus.subscriber_count("orders"), 1);
    assert_eq!(bus.subscribe_attempts("audit"), 2);
    assert!(logs_contain("failed to reinstate subscription"));

    // retried only on the next reconnect
    bus.accept_subscriptions_to("audit");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.subscribe_attempts("audit"), 2);
    assert_eq!(bus.subscriber_count("audit"), 0);

    let report = client.reconnect().await.unwrap();

    assert_eq!(report.subscriptions.reinstated, 2);
    assert!(report.subscriptions.failed.is_empty());
    assert_eq!(bus.subscribe_attempts("audit"), 3);
    assert_eq!(bus.subscriber_count("audit"), 1);
    assert_eq!(bus.subscriber_count("orders"), 1);
}

#[tokio::test]
async fn test_every_registration_gets_one_attempt_per_reconnect() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let received = Received::default();

    for subject in ["a", "b", "c"] {
        client.register(subject, received.spec(subject)).await.unwrap();
    }

    client.reconnect().await.unwrap();

    for subject in ["a", "b", "c"] {
        assert_eq!(bus.subscribe_attempts(subject), 2);
        assert_eq!(bus.subscriber_count(subject), 1);
    }
}

#[tokio::test]
async fn test_registration_before_connect_is_pending() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    let received = Received::default();

    let status = client
        .register("order-events", received.spec("orders.created"))
        .await
        .unwrap();

    assert_eq!(status, RegistrationStatus::Pending);
    assert_eq!(bus.subscribe_attempts("orders.created"), 0);

    let report = client.connect().await.unwrap();

    assert_eq!(report.subscriptions.reinstated, 1);
    assert_eq!(bus.subscriber_count("orders.created"), 1);
}

#[tokio::test]
async fn test_reregistering_key_replaces_subscription() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let received = Received::default();

    client
        .register("events", received.spec("orders.created"))
        .await
        .unwrap();
    client
        .register("events", received.spec("orders.updated"))
        .await
        .unwrap();

    assert_eq!(client.registrations(), 1);
    assert_eq!(bus.subscriber_count("orders.created"), 0);
    assert_eq!(bus.subscriber_count("orders.updated"), 1);

    client.reconnect().await.unwrap();

    assert_eq!(bus.subscriber_count("orders.created"), 0);
    assert_eq!(bus.subscriber_count("orders.updated"), 1);
    assert_eq!(bus.subscribe_attempts("orders.created"), 1);
}

#[tokio::test]
async fn test_queue_group_registration() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let first = Received::default();
    let second = Received::default();

    client
        .register("worker-1", first.spec("jobs").queue("workers"))
        .await
        .unwrap();
    client
        .register("worker-2", second.spec("jobs").queue("workers"))
        .await
        .unwrap();

    for n in 0..4 {
        client.publish("jobs", format!("job-{n}")).await.unwrap();
    }

    eventually(|| first.len() + second.len() == 4).await;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
}

#[tokio::test]
async fn test_one_off_subscription_is_not_restored() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let received = Received::default();

    let _subscription = client.subscribe(received.spec("metrics")).await.unwrap();
    assert_eq!(bus.subscriber_count("metrics"), 1);

    let report = client.reconnect().await.unwrap();

    assert_eq!(report.subscriptions.attempted, 0);
    assert_eq!(bus.subscriber_count("metrics"), 0);
    assert_eq!(client.registrations(), 0);
}

#[tokio::test]
async fn test_one_off_subscription_fails_when_disconnected() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    let received = Received::default();

    assert_matches!(
        client.subscribe(received.spec("metrics")).await,
        Err(Error::NotConnected)
    );
    assert_eq!(bus.subscribe_attempts("metrics"), 0);
}

#[tokio::test]
async fn test_register_after_close_fails() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    client.close().await;
    let received = Received::default();

    assert_matches!(
        client.register("late", received.spec("late")).await,
        Err(Error::Closed)
    );
    assert_eq!(client.registrations(), 0);
}

#[tokio::test]
async fn test_async_handler_is_restored_after_reconnect() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let (sender, mut receiver) = mpsc::unbounded_channel();

    client
        .register("forwarder", SubscriptionSpec::new("orders.*", Forwarder(sender)))
        .await
        .unwrap();
    client.publish("orders.created", "before").await.unwrap();
    assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"before"));

    client.reconnect().await.unwrap();
    client.publish("orders.created", "after").await.unwrap();

    assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"after"));
    assert_eq!(bus.subscriber_count("orders.*"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_reinstate_subscribe_once() {
    let bus = MemoryBus::new();
    let client = client(&bus);
    client.connect().await.unwrap();
    let received = Received::default();
    let subjects: Vec<String> = (0..20).map(|n| format!("orders.{n}")).collect();

    let registering = tokio::spawn({
        let client = client.clone();
        let received = received.clone();
        let subjects = subjects.clone();
        async move {
            for subject in &subjects {
                let status = client
                    .register(subject.clone(), received.spec(subject))
                    .await
                    .unwrap();
                assert_eq!(status, RegistrationStatus::Active);
            }
        }
    });
    let reinstating = tokio::spawn({
        let client = client.clone();
        async move {
            let mut attempted = 0;
            for _ in 0..20 {
                let report = client.reinstate_all().await;
                assert!(report.failed.is_empty());
                assert!(report.attempted <= client.registrations());
                attempted += report.attempted;
                tokio::task::yield_now().await;
            }
            attempted
        }
    });

    registering.await.unwrap();
    let attempted_by_reinstate = reinstating.await.unwrap();

    assert!(attempted_by_reinstate <= subjects.len());
    for subject in &subjects {
        assert_eq!(bus.subscribe_attempts(subject), 1);
        assert_eq!(bus.subscriber_count(subject), 1);
    }

    // nothing left to do on the same connection
    assert_eq!(client.reinstate_all().await.attempted, 0);
}
