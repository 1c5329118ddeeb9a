//! In-memory implementation of the bus crate.
//!
//! A single [`MemoryBus`] plays the role of the broker. Its fault injection
//! methods (`set_reachable`, `sever`, `interrupt_next_acks`, ...) make outages
//! reproducible in tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod error;
mod subject;
mod subscription;

pub use connection::MemoryConnection;
pub use error::Error;
pub use subscription::{MemorySubscription, MemorySubscriptionOptions};

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use harbor_bus::{
    ConnectOptions, ConnectionLost, ConnectionLostHandler, Connector, Message, MessageId,
    SubscriptionHandler,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use subject::{subject_matches, validate_publish_subject, validate_subscribe_subject};

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    connection_lost: Option<ConnectionLostHandler>,
}

struct SubscriptionEntry {
    id: u64,
    connection_id: u64,
    subject: String,
    queue: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Broker {
    unreachable: bool,
    failing_connects: usize,
    interrupted_acks: usize,
    rejected_subjects: HashSet<String>,
    next_id: u64,
    next_sequence: u64,
    connections: HashMap<u64, ConnectionEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    queue_cursors: HashMap<(String, String), usize>,
    connect_attempts: usize,
    subscribe_attempts: HashMap<String, usize>,
    published: Vec<Message>,
}

impl Broker {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_connection(&mut self, connection_id: u64) -> Option<ConnectionEntry> {
        self.subscriptions
            .retain(|entry| entry.connection_id != connection_id);
        let entry = self.connections.remove(&connection_id)?;
        entry.open.store(false, Ordering::SeqCst);
        Some(entry)
    }
}

/// An in-process message broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    broker: Arc<Mutex<Broker>>,
}

impl Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let broker = self.broker.lock();
        f.debug_struct("MemoryBus")
            .field("reachable", &!broker.unreachable)
            .field("connections", &broker.connections.len())
            .field("subscriptions", &broker.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl MemoryBus {
    /// Creates a new, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes new connection attempts succeed or fail with [`Error::Unreachable`].
    /// Existing connections are not affected; see [`Self::sever`].
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.lock().unreachable = !reachable;
    }

    /// Makes the next `count` connection attempts fail with [`Error::ConnectRefused`].
    pub fn fail_next_connects(&self, count: usize) {
        self.broker.lock().failing_connects = count;
    }

    /// Makes the acknowledgements of the next `count` accepted publishes fail
    /// with [`Error::AckInterrupted`]. Those messages are not delivered.
    pub fn interrupt_next_acks(&self, count: usize) {
        self.broker.lock().interrupted_acks = count;
    }

    /// Rejects every subscription attempt on exactly `subject`.
    pub fn reject_subscriptions_to(&self, subject: impl Into<String>) {
        self.broker.lock().rejected_subjects.insert(subject.into());
    }

    /// Undoes [`Self::reject_subscriptions_to`].
    pub fn accept_subscriptions_to(&self, subject: &str) {
        self.broker.lock().rejected_subjects.remove(subject);
    }

    /// Severs every open connection, dropping their subscriptions and
    /// notifying each connection-lost handler from a separate task.
    ///
    /// Returns the number of connections severed.
    pub fn sever(&self, cause: &str) -> usize {
        let severed = self.drop_all_connections();

        info!(count = severed.len(), cause, "severing memory bus connections");

        let count = severed.len();
        for entry in severed {
            if let Some(connection_lost) = entry.connection_lost {
                let lost = ConnectionLost::new(cause);
                tokio::spawn(async move { connection_lost(lost) });
            }
        }

        count
    }

    /// Severs every open connection without notifying anyone, as if the
    /// peer vanished before keep-alives noticed. Clients keep using their
    /// dead connections until they reconnect.
    ///
    /// Returns the number of connections severed.
    pub fn sever_silently(&self) -> usize {
        let count = self.drop_all_connections().len();
        info!(count, "silently severing memory bus connections");

        count
    }

    fn drop_all_connections(&self) -> Vec<ConnectionEntry> {
        let mut broker = self.broker.lock();
        let ids: Vec<u64> = broker.connections.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| broker.drop_connection(id))
            .collect()
    }

    /// Number of connection attempts seen so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.broker.lock().connect_attempts
    }

    /// Number of subscription attempts seen so far on exactly `subject`.
    #[must_use]
    pub fn subscribe_attempts(&self, subject: &str) -> usize {
        self.broker
            .lock()
            .subscribe_attempts
            .get(subject)
            .copied()
            .unwrap_or_default()
    }

    /// Number of live subscriptions on exactly `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker
            .lock()
            .subscriptions
            .iter()
            .filter(|entry| entry.subject == subject)
            .count()
    }

    /// Number of open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.broker.lock().connections.len()
    }

    /// Payloads of every delivered publish on `subject`, in publish order.
    #[must_use]
    pub fn published(&self, subject: &str) -> Vec<Bytes> {
        self.broker
            .lock()
            .published
            .iter()
            .filter(|message| message.subject == subject)
            .map(|message| message.payload.clone())
            .collect()
    }

    pub(crate) fn is_registered(&self, connection_id: u64) -> bool {
        self.broker.lock().connections.contains_key(&connection_id)
    }

    pub(crate) fn close_connection(&self, connection_id: u64) {
        self.broker.lock().drop_connection(connection_id);
    }

    /// Accepts a publish. Returns the assigned id and whether its
    /// acknowledgement must report an interruption.
    pub(crate) fn route(
        &self,
        connection_id: u64,
        subject: &str,
        payload: Bytes,
    ) -> Result<(MessageId, bool), Error> {
        validate_publish_subject(subject)?;

        let mut guard = self.broker.lock();
        let broker = &mut *guard;

        if !broker.connections.contains_key(&connection_id) {
            return Err(Error::ConnectionClosed);
        }

        broker.next_sequence += 1;
        let sequence = broker.next_sequence;
        let message_id = MessageId::new(format!("mem-{sequence}"));

        if broker.interrupted_acks > 0 {
            broker.interrupted_acks -= 1;
            debug!(%message_id, subject, "dropping message to simulate an interrupted ack");
            return Ok((message_id, true));
        }

        let message = Message {
            subject: subject.to_string(),
            payload,
            sequence: Some(sequence),
        };

        let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (index, entry) in broker.subscriptions.iter().enumerate() {
            if !subject_matches(subject, &entry.subject) {
                continue;
            }
            match &entry.queue {
                Some(queue) => groups
                    .entry((entry.subject.clone(), queue.clone()))
                    .or_default()
                    .push(index),
                None => {
                    let _ = entry.sender.send(message.clone());
                }
            }
        }

        for (group, members) in groups {
            let cursor = broker.queue_cursors.entry(group).or_insert(0);
            let member = members[*cursor % members.len()];
            *cursor += 1;
            let _ = broker.subscriptions[member].sender.send(message.clone());
        }

        trace!(%message_id, subject, "routed message");
        broker.published.push(message);

        Ok((message_id, false))
    }

    pub(crate) fn add_subscription(
        &self,
        connection_id: u64,
        subject: &str,
        queue: Option<&str>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<u64, Error> {
        let mut broker = self.broker.lock();

        *broker
            .subscribe_attempts
            .entry(subject.to_string())
            .or_default() += 1;

        if !broker.connections.contains_key(&connection_id) {
            return Err(Error::ConnectionClosed);
        }
        validate_subscribe_subject(subject)?;
        if broker.rejected_subjects.contains(subject) {
            return Err(Error::SubscriptionRejected(subject.to_string()));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler.handle(message).await;
            }
        });

        let id = broker.next_id();
        broker.subscriptions.push(SubscriptionEntry {
            id,
            connection_id,
            subject: subject.to_string(),
            queue: queue.map(ToString::to_string),
            sender,
        });

        debug!(id, subject, queue, "added subscription");

        Ok(id)
    }

    pub(crate) fn remove_subscription(&self, subscription_id: u64) {
        self.broker
            .lock()
            .subscriptions
            .retain(|entry| entry.id != subscription_id);
    }
}

#[async_trait]
impl Connector for MemoryBus {
    type Error = Error;
    type Connection = MemoryConnection;

    async fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, Self::Error> {
        let mut broker = self.broker.lock();
        broker.connect_attempts += 1;

        if broker.unreachable {
            return Err(Error::Unreachable);
        }
        if broker.failing_connects > 0 {
            broker.failing_connects -= 1;
            return Err(Error::ConnectRefused);
        }

        let id = broker.next_id();
        let open = Arc::new(AtomicBool::new(true));
        broker.connections.insert(
            id,
            ConnectionEntry {
                open: open.clone(),
                connection_lost: options.connection_lost.clone(),
            },
        );
        drop(broker);

        debug!(id, client_id = %options.client_id, "opened memory bus connection");

        Ok(MemoryConnection::new(id, self.clone(), open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use harbor_bus::{Ack, BusError, Connection, FailureKind, Subscription};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    fn options(lost: Option<ConnectionLostHandler>) -> ConnectOptions {
        ConnectOptions {
            cluster_id: "test-cluster".to_string(),
            client_id: "test-client".to_string(),
            urls: vec!["memory://".to_string()],
            ping_interval: Duration::from_secs(5),
            max_pings_out: 3,
            connection_lost: lost,
        }
    }

    fn channel_handler() -> (Arc<dyn SubscriptionHandler>, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler: Arc<dyn SubscriptionHandler> = Arc::new(move |message: Message| {
            let _ = sender.send(message);
        });
        (handler, receiver)
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = MemoryBus::new();
        let connection = bus.connect(options(None)).await.unwrap();
        let (handler, mut receiver) = channel_handler();

        let _subscription = connection
            .subscribe("orders.*", None, handler, &MemorySubscriptionOptions)
            .await
            .unwrap();

        let (ack_sender, ack_receiver) = oneshot::channel();
        let id = connection
            .publish(
                "orders.created",
                Bytes::from_static(b"order-1"),
                Some(Box::new(move |ack: Ack<Error>| {
                    let _ = ack_sender.send(ack);
                })),
            )
            .await
            .unwrap();

        let ack = timeout(Duration::from_secs(1), ack_receiver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_id, id);
        assert!(ack.result.is_ok());

        let message = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.subject, "orders.created");
        assert_eq!(message.payload, Bytes::from_static(b"order-1"));
        assert_eq!(bus.published("orders.created").len(), 1);
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let bus = MemoryBus::new();
        let connection = bus.connect(options(None)).await.unwrap();
        let (first, mut first_receiver) = channel_handler();
        let (second, mut second_receiver) = channel_handler();

        let _a = connection
            .subscribe("jobs", Some("workers"), first, &MemorySubscriptionOptions)
            .await
            .unwrap();
        let _b = connection
            .subscribe("jobs", Some("workers"), second, &MemorySubscriptionOptions)
            .await
            .unwrap();

        for n in 0..4 {
            connection
                .publish("jobs", Bytes::from(format!("job-{n}")), None)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut first_count = 0;
        while first_receiver.try_recv().is_ok() {
            first_count += 1;
        }
        let mut second_count = 0;
        while second_receiver.try_recv().is_ok() {
            second_count += 1;
        }

        assert_eq!(first_count, 2);
        assert_eq!(second_count, 2);
    }

    #[tokio::test]
    async fn test_unreachable_and_refused_connects() {
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        assert_matches!(bus.connect(options(None)).await, Err(Error::Unreachable));

        bus.set_reachable(true);
        bus.fail_next_connects(1);
        assert_matches!(bus.connect(options(None)).await, Err(Error::ConnectRefused));
        assert!(bus.connect(options(None)).await.is_ok());
        assert_eq!(bus.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_sever_notifies_and_closes() {
        let bus = MemoryBus::new();
        let (lost_sender, mut lost_receiver) = mpsc::unbounded_channel();
        let lost: ConnectionLostHandler = Arc::new(move |lost: ConnectionLost| {
            let _ = lost_sender.send(lost);
        });
        let connection = bus.connect(options(Some(lost))).await.unwrap();

        assert_eq!(bus.sever("test outage"), 1);

        let notification = timeout(Duration::from_secs(1), lost_receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.cause, "test outage");

        let error = connection
            .publish("orders.created", Bytes::new(), None)
            .await
            .unwrap_err();
        assert_eq!(error, Error::ConnectionClosed);
        assert_eq!(error.kind(), FailureKind::State);
    }

    #[tokio::test]
    async fn test_silent_sever_closes_without_notifying() {
        let bus = MemoryBus::new();
        let notified = Arc::new(AtomicBool::new(false));
        let lost: ConnectionLostHandler = Arc::new({
            let notified = notified.clone();
            move |_: ConnectionLost| notified.store(true, Ordering::SeqCst)
        });
        let connection = bus.connect(options(Some(lost))).await.unwrap();

        assert_eq!(bus.sever_silently(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!notified.load(Ordering::SeqCst));
        assert!(!connection.is_open());
        assert_matches!(
            connection
                .publish("orders.created", Bytes::new(), None)
                .await,
            Err(Error::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_close_does_not_notify() {
        let bus = MemoryBus::new();
        let (lost_sender, mut lost_receiver) = mpsc::unbounded_channel();
        let lost: ConnectionLostHandler = Arc::new(move |lost: ConnectionLost| {
            let _ = lost_sender.send(lost);
        });
        let connection = bus.connect(options(Some(lost))).await.unwrap();

        connection.close().await.unwrap();

        assert_eq!(bus.open_connections(), 0);
        // the handler is dropped with the connection, so the channel may close
        assert_matches!(
            timeout(Duration::from_millis(100), lost_receiver.recv()).await,
            Err(_) | Ok(None)
        );
    }

    #[tokio::test]
    async fn test_interrupted_ack_is_network_failure() {
        let bus = MemoryBus::new();
        let connection = bus.connect(options(None)).await.unwrap();
        bus.interrupt_next_acks(1);

        let (ack_sender, ack_receiver) = oneshot::channel();
        connection
            .publish(
                "orders.created",
                Bytes::from_static(b"lost"),
                Some(Box::new(move |ack: Ack<Error>| {
                    let _ = ack_sender.send(ack);
                })),
            )
            .await
            .unwrap();

        let ack = timeout(Duration::from_secs(1), ack_receiver)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(ack.result, Err(Error::AckInterrupted));
        assert!(bus.published("orders.created").is_empty());
    }

    #[tokio::test]
    async fn test_rejected_subscription_and_unsubscribe() {
        let bus = MemoryBus::new();
        let connection = bus.connect(options(None)).await.unwrap();
        bus.reject_subscriptions_to("audit");

        let (handler, _receiver) = channel_handler();
        let error = connection
            .subscribe("audit", None, handler.clone(), &MemorySubscriptionOptions)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Protocol);

        bus.accept_subscriptions_to("audit");
        let subscription = connection
            .subscribe("audit", None, handler, &MemorySubscriptionOptions)
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("audit"), 1);
        assert_eq!(bus.subscribe_attempts("audit"), 2);

        subscription.unsubscribe().await.unwrap();
        assert_eq!(bus.subscriber_count("audit"), 0);
    }

    #[tokio::test]
    async fn test_invalid_publish_subject_is_protocol_failure() {
        let bus = MemoryBus::new();
        let connection = bus.connect(options(None)).await.unwrap();

        let error = connection
            .publish("orders.*", Bytes::new(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::InvalidSubject(_));
        assert!(!error.is_transient());
    }
}
