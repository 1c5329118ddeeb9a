use crate::config::{Settings, StreamingConfig};
use crate::error::Error;
use crate::gateway::{AckHandler, DropListener, PublishGateway, ReplayReport, ReplayStats};
use crate::manager::{
    ConnectionManager, ConnectionState, LiveConnection, RecoveryReport, RegistrationStatus,
    ReinstateReport,
};
use crate::registry::SubscriptionSpec;
use crate::{BusErrorOf, SubscriptionOf, SubscriptionOptionsOf};

use std::fmt::{self, Debug};
use std::sync::Arc;

use bytes::Bytes;
use harbor_bus::{Connector, MessageId};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Resilient publish/subscribe client.
///
/// Cloning is cheap; clones share one connection. The client shuts down
/// when [`Self::close`] is called or the last clone is dropped.
pub struct StreamingClient<C>
where
    C: Connector,
{
    manager: Arc<ConnectionManager<C>>,
    gateway: PublishGateway<C>,
    shutdown_guard: Arc<DropGuard>,
}

impl<C> Clone for StreamingClient<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            gateway: self.gateway.clone(),
            shutdown_guard: self.shutdown_guard.clone(),
        }
    }
}

impl<C> Debug for StreamingClient<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("state", &self.state())
            .field("registrations", &self.manager.registrations())
            .field("pending_publishes", &self.gateway.pending())
            .finish_non_exhaustive()
    }
}

impl<C> StreamingClient<C>
where
    C: Connector,
{
    /// Creates a client. Nothing happens until [`Self::connect`].
    pub fn new(connector: C, config: StreamingConfig) -> Self {
        Self::build(connector, config, None)
    }

    /// Like [`Self::new`], reporting every publish given up on to `listener`.
    pub fn with_drop_listener(
        connector: C,
        config: StreamingConfig,
        listener: DropListener,
    ) -> Self {
        Self::build(connector, config, Some(listener))
    }

    fn build(connector: C, config: StreamingConfig, listener: Option<DropListener>) -> Self {
        let settings = Settings::from(config);
        let capacity = settings.replay_capacity;
        let shutdown = CancellationToken::new();

        let manager = Arc::new(ConnectionManager::new(
            connector,
            settings,
            shutdown.clone(),
        ));
        let gateway = PublishGateway::new(manager.clone(), capacity, listener);

        Self {
            manager,
            gateway,
            shutdown_guard: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Connects, retrying until it succeeds, then subscribes everything
    /// registered and replays everything cached so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the client is closed first.
    pub async fn connect(&self) -> Result<RecoveryReport, Error<BusErrorOf<C>>> {
        self.manager.start(&self.gateway).await
    }

    /// Replaces the current connection with a new one, restoring
    /// subscriptions and replaying cached publishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the client is closed first.
    pub async fn reconnect(&self) -> Result<RecoveryReport, Error<BusErrorOf<C>>> {
        self.manager.reconnect(&self.gateway).await
    }

    /// Stops reconnecting and closes the connection. Cached publishes are
    /// discarded.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Receiver observing every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    /// The current connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] between connections and
    /// [`Error::Closed`] after [`Self::close`].
    pub fn connection(&self) -> Result<Arc<LiveConnection<C::Connection>>, Error<BusErrorOf<C>>> {
        self.manager.live()
    }

    /// Publishes `payload` on `subject`.
    ///
    /// # Errors
    ///
    /// Fails if not connected or if the bus rejects the publish.
    pub async fn publish(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<MessageId, Error<BusErrorOf<C>>> {
        self.gateway.publish(subject, payload.into()).await
    }

    /// Publishes `payload` on `subject`, passing the acknowledgement to
    /// `ack_handler` once the bus has stored (or failed to store) it.
    ///
    /// # Errors
    ///
    /// Fails if not connected or if the bus rejects the publish.
    pub async fn publish_with_ack(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        ack_handler: AckHandler<BusErrorOf<C>>,
    ) -> Result<MessageId, Error<BusErrorOf<C>>> {
        self.gateway
            .publish_with_ack(subject, payload.into(), ack_handler)
            .await
    }

    /// Publishes `payload` on `subject`, caching it for replay when the
    /// connection is unavailable instead of failing.
    ///
    /// Returns `Ok(None)` when the publish was cached.
    ///
    /// # Errors
    ///
    /// Only non-transient failures are returned, such as an invalid subject
    /// or a closed client.
    pub async fn safe_publish(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        ack_handler: Option<AckHandler<BusErrorOf<C>>>,
    ) -> Result<Option<MessageId>, Error<BusErrorOf<C>>> {
        self.gateway
            .safe_publish(subject, payload.into(), ack_handler)
            .await
    }

    /// Subscribes on the current connection. The subscription is not
    /// restored after a reconnect; see [`Self::register`].
    ///
    /// # Errors
    ///
    /// Fails if not connected or if the bus rejects the subscription.
    pub async fn subscribe(
        &self,
        spec: SubscriptionSpec<SubscriptionOptionsOf<C>>,
    ) -> Result<SubscriptionOf<C>, Error<BusErrorOf<C>>> {
        self.manager.subscribe(&spec).await
    }

    /// Registers a subscription under `key` that is restored after every
    /// reconnect. Registering an existing key replaces it.
    ///
    /// # Errors
    ///
    /// Fails if the client is closed or the bus rejects the subscription for
    /// a non-transient reason. The registration is kept in the latter case.
    pub async fn register(
        &self,
        key: impl Into<String>,
        spec: SubscriptionSpec<SubscriptionOptionsOf<C>>,
    ) -> Result<RegistrationStatus, Error<BusErrorOf<C>>> {
        self.manager.register(key.into(), spec).await
    }

    /// Gives every registration not yet live on the current connection one
    /// subscribe attempt.
    pub async fn reinstate_all(&self) -> ReinstateReport {
        self.manager.reinstate_all().await
    }

    /// Replays every cached publish once, oldest first.
    pub async fn drain_and_replay_all(&self) -> ReplayReport {
        self.gateway.drain_and_replay_all().await
    }

    /// Number of durable registrations.
    pub fn registrations(&self) -> usize {
        self.manager.registrations()
    }

    /// Number of publishes waiting for replay.
    pub fn pending_publishes(&self) -> usize {
        self.gateway.pending()
    }

    /// Replay cache totals since the client was created.
    pub fn replay_stats(&self) -> ReplayStats {
        self.gateway.stats()
    }
}
