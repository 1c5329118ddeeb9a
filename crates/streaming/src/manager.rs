use crate::config::Settings;
use crate::error::Error;
use crate::gateway::{PublishGateway, ReplayReport};
use crate::registry::{SubscriptionRegistry, SubscriptionSpec};
use crate::{BusErrorOf, SubscriptionOf, SubscriptionOptionsOf};

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use harbor_bus::{
    BusError, ConnectOptions, Connection, ConnectionLost, ConnectionLostHandler, Connector,
    Subscription,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of the client's connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,

    /// Establishing (or re-establishing) a connection.
    Connecting,

    /// A connection is established.
    Connected,

    /// The client was closed. Terminal.
    Closed,
}

/// A connection together with the generation it was opened as.
///
/// Every successful connect gets a new, strictly larger generation.
#[derive(Debug)]
pub struct LiveConnection<T> {
    generation: u64,
    connection: T,
}

impl<T> LiveConnection<T> {
    /// Generation of this connection.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The backend connection.
    pub const fn connection(&self) -> &T {
        &self.connection
    }
}

impl<T> Deref for LiveConnection<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

/// Outcome of registering a durable subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistrationStatus {
    /// Subscribed on the current connection.
    Active,

    /// Recorded, and will be subscribed after the next (re)connect.
    Pending,
}

/// Outcome of re-subscribing every registration on a new connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReinstateReport {
    /// Registrations a subscribe was attempted for.
    pub attempted: usize,

    /// Registrations now active.
    pub reinstated: usize,

    /// Keys whose subscribe failed; retried after the next reconnect.
    pub failed: Vec<String>,
}

/// Outcome of a (re)connect cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Generation of the new connection.
    pub generation: u64,

    /// Subscription restoration.
    pub subscriptions: ReinstateReport,

    /// Cached publish replay.
    pub replay: ReplayReport,
}

struct LostSignal {
    generation: u64,
    cause: String,
}

type Live<C> = Arc<LiveConnection<<C as Connector>::Connection>>;
type Spec<C> = SubscriptionSpec<SubscriptionOptionsOf<C>>;

/// Owns the connection slot, the subscription registry and the reconnect
/// supervisor.
pub(crate) struct ConnectionManager<C>
where
    C: Connector,
{
    connector: C,
    settings: Settings,
    live: ArcSwapOption<LiveConnection<C::Connection>>,
    generations: AtomicU64,
    state: watch::Sender<ConnectionState>,
    registry: SubscriptionRegistry<SubscriptionOptionsOf<C>, SubscriptionOf<C>>,
    subscribe_lock: Mutex<()>,
    recovery_lock: Mutex<()>,
    lost_sender: mpsc::UnboundedSender<LostSignal>,
    lost_receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<LostSignal>>>,
    shutdown: CancellationToken,
}

impl<C> ConnectionManager<C>
where
    C: Connector,
{
    pub(crate) fn new(connector: C, settings: Settings, shutdown: CancellationToken) -> Self {
        let (lost_sender, lost_receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            connector,
            settings,
            live: ArcSwapOption::empty(),
            generations: AtomicU64::new(0),
            state,
            registry: SubscriptionRegistry::new(),
            subscribe_lock: Mutex::new(()),
            recovery_lock: Mutex::new(()),
            lost_sender,
            lost_receiver: parking_lot::Mutex::new(Some(lost_receiver)),
            shutdown,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    pub(crate) fn registrations(&self) -> usize {
        self.registry.len()
    }

    /// The current connection, if any.
    pub(crate) fn live(&self) -> Result<Live<C>, Error<BusErrorOf<C>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        self.live.load_full().ok_or(Error::NotConnected)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live
            .load_full()
            .is_some_and(|live| live.generation == generation)
    }

    fn connect_options(&self, generation: u64) -> ConnectOptions {
        let sender = self.lost_sender.clone();
        let connection_lost: ConnectionLostHandler = Arc::new(move |lost: ConnectionLost| {
            let _ = sender.send(LostSignal {
                generation,
                cause: lost.cause,
            });
        });

        ConnectOptions {
            cluster_id: self.settings.cluster_id.clone(),
            client_id: self.settings.client_id.clone(),
            urls: self.settings.urls.clone(),
            ping_interval: self.settings.ping_interval,
            max_pings_out: self.settings.max_pings_out,
            connection_lost: Some(connection_lost),
        }
    }

    /// Connects, retrying every reconnect interval until it succeeds or the
    /// client is closed.
    #[instrument(skip(self), fields(cluster_id = %self.settings.cluster_id, client_id = %self.settings.client_id))]
    async fn establish(&self) -> Result<Live<C>, Error<BusErrorOf<C>>> {
        self.set_state(ConnectionState::Connecting);
        let mut attempt: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Closed);
            }

            attempt += 1;
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let options = self.connect_options(generation);

            let result = tokio::select! {
                result = self.connector.connect(options) => result,
                () = self.shutdown.cancelled() => return Err(Error::Closed),
            };

            match result {
                Ok(connection) => {
                    let live = Arc::new(LiveConnection {
                        generation,
                        connection,
                    });
                    self.live.store(Some(live.clone()));

                    // close() may have run while connecting
                    if self.shutdown.is_cancelled() {
                        self.release().await;
                        return Err(Error::Closed);
                    }

                    self.set_state(ConnectionState::Connected);
                    info!(generation, attempt, urls = ?self.settings.urls, "connected to message bus");

                    return Ok(live);
                }
                Err(error) => {
                    error!(
                        attempt,
                        %error,
                        retry_in = ?self.settings.reconnect_interval,
                        "failed to connect to message bus, retrying"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(self.settings.reconnect_interval) => {}
                        () = self.shutdown.cancelled() => return Err(Error::Closed),
                    }
                }
            }
        }
    }

    /// Empties the connection slot and closes whatever was in it.
    async fn release(&self) {
        if let Some(live) = self.live.swap(None) {
            debug!(generation = live.generation, "closing connection");

            if let Err(error) = live.connection.close().await {
                debug!(generation = live.generation, %error, "error closing connection, ignoring");
            }
        }
    }

    async fn release_subscription(handle: SubscriptionOf<C>) {
        if let Err(error) = handle.unsubscribe().await {
            debug!(%error, "error releasing subscription, ignoring");
        }
    }

    /// Connects for the first time, restores anything registered or cached
    /// beforehand, and starts watching for connection loss.
    ///
    /// Does nothing if already connected.
    pub(crate) async fn start(
        self: &Arc<Self>,
        gateway: &PublishGateway<C>,
    ) -> Result<RecoveryReport, Error<BusErrorOf<C>>> {
        let _recovery = self.recovery_lock.lock().await;

        if let Ok(live) = self.live() {
            return Ok(RecoveryReport {
                generation: live.generation,
                ..RecoveryReport::default()
            });
        }

        let report = self.recover_locked(gateway).await?;
        self.spawn_supervisor(gateway.clone());

        Ok(report)
    }

    /// Drops the current connection and runs a full recovery cycle. Starts
    /// watching for connection loss if nothing is yet.
    pub(crate) async fn reconnect(
        self: &Arc<Self>,
        gateway: &PublishGateway<C>,
    ) -> Result<RecoveryReport, Error<BusErrorOf<C>>> {
        let _recovery = self.recovery_lock.lock().await;

        let report = self.recover_locked(gateway).await?;
        self.spawn_supervisor(gateway.clone());

        Ok(report)
    }

    async fn recover_locked(
        &self,
        gateway: &PublishGateway<C>,
    ) -> Result<RecoveryReport, Error<BusErrorOf<C>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        self.set_state(ConnectionState::Connecting);
        self.release().await;

        let live = self.establish().await?;
        let subscriptions = self.reinstate_all().await;
        let replay = gateway.drain_and_replay_all().await;

        Ok(RecoveryReport {
            generation: live.generation,
            subscriptions,
            replay,
        })
    }

    fn spawn_supervisor(self: &Arc<Self>, gateway: PublishGateway<C>) {
        let Some(mut receiver) = self.lost_receiver.lock().take() else {
            return;
        };
        let manager = self.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    signal = receiver.recv() => signal,
                    () = manager.shutdown.cancelled() => None,
                };

                let Some(signal) = signal else {
                    break;
                };

                manager.on_connection_lost(signal, &gateway).await;
            }

            debug!("connection supervisor stopped");
        });
    }

    async fn on_connection_lost(&self, signal: LostSignal, gateway: &PublishGateway<C>) {
        let _recovery = self.recovery_lock.lock().await;

        if !self.is_current(signal.generation) {
            debug!(
                generation = signal.generation,
                cause = %signal.cause,
                "ignoring loss of a connection that was already replaced"
            );
            return;
        }

        warn!(
            generation = signal.generation,
            cause = %signal.cause,
            "connection to message bus lost, reconnecting"
        );

        match self.recover_locked(gateway).await {
            Ok(report) => info!(
                generation = report.generation,
                reinstated = report.subscriptions.reinstated,
                failed = report.subscriptions.failed.len(),
                replayed = report.replay.replayed,
                dropped = report.replay.dropped,
                "recovered connection to message bus"
            ),
            Err(Error::Closed) => debug!("client closed during recovery"),
            Err(error) => error!(%error, "failed to recover connection to message bus"),
        }
    }

    /// Subscribes once on the current connection. Not restored on reconnect.
    pub(crate) async fn subscribe(
        &self,
        spec: &Spec<C>,
    ) -> Result<SubscriptionOf<C>, Error<BusErrorOf<C>>> {
        let live = self.live()?;

        live.connection
            .subscribe(
                &spec.subject,
                spec.queue.as_deref(),
                spec.handler.clone(),
                &spec.options,
            )
            .await
            .map_err(Error::Bus)
    }

    /// Records `spec` under `key` so it is restored after every reconnect,
    /// and subscribes it now if connected.
    ///
    /// The registration is kept even when subscribing fails.
    pub(crate) async fn register(
        &self,
        key: String,
        spec: Spec<C>,
    ) -> Result<RegistrationStatus, Error<BusErrorOf<C>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let (revision, replaced) = self.registry.register(key.clone(), spec.clone());
        if let Some(replaced) = replaced {
            Self::release_subscription(replaced).await;
        }

        let _subscribing = self.subscribe_lock.lock().await;

        let live = match self.live() {
            Ok(live) => live,
            Err(Error::NotConnected) => {
                info!(%key, subject = %spec.subject, "registered subscription, will subscribe once connected");
                return Ok(RegistrationStatus::Pending);
            }
            Err(error) => return Err(error),
        };

        if self.registry.is_active(&key, live.generation) {
            return Ok(RegistrationStatus::Active);
        }

        match self.subscribe(&spec).await {
            Ok(handle) => {
                if let Some(stale) = self
                    .registry
                    .activate(&key, revision, live.generation, handle)
                {
                    Self::release_subscription(stale).await;
                }
                info!(%key, subject = %spec.subject, queue = ?spec.queue, "registered subscription");

                Ok(RegistrationStatus::Active)
            }
            Err(error) if error.is_transient() => {
                warn!(%key, subject = %spec.subject, %error, "failed to subscribe, will retry after reconnect");

                Ok(RegistrationStatus::Pending)
            }
            Err(error) => {
                warn!(%key, subject = %spec.subject, %error, "failed to subscribe, registration kept");

                Err(error)
            }
        }
    }

    /// Gives every registration that is not yet live on the current
    /// connection exactly one subscribe attempt. Failures are logged and
    /// left for the next reconnect.
    pub(crate) async fn reinstate_all(&self) -> ReinstateReport {
        let _subscribing = self.subscribe_lock.lock().await;
        let mut report = ReinstateReport::default();

        let Ok(live) = self.live() else {
            return report;
        };

        for registered in self.registry.snapshot() {
            if self.registry.is_active(&registered.key, live.generation) {
                continue;
            }

            report.attempted += 1;
            let spec = &registered.spec;

            match live
                .connection
                .subscribe(
                    &spec.subject,
                    spec.queue.as_deref(),
                    spec.handler.clone(),
                    &spec.options,
                )
                .await
            {
                Ok(handle) => {
                    if let Some(stale) = self.registry.activate(
                        &registered.key,
                        registered.revision,
                        live.generation,
                        handle,
                    ) {
                        Self::release_subscription(stale).await;
                    }
                    report.reinstated += 1;
                    debug!(key = %registered.key, subject = %spec.subject, "reinstated subscription");
                }
                Err(error) => {
                    warn!(
                        key = %registered.key,
                        subject = %spec.subject,
                        %error,
                        "failed to reinstate subscription, will retry after next reconnect"
                    );
                    report.failed.push(registered.key.clone());
                }
            }
        }

        if report.attempted > 0 {
            info!(
                generation = live.generation,
                reinstated = report.reinstated,
                failed = report.failed.len(),
                "reinstated subscriptions"
            );
        }

        report
    }

    /// Stops reconnecting and closes the current connection.
    pub(crate) async fn close(&self) {
        self.shutdown.cancel();
        self.set_state(ConnectionState::Closed);
        self.release().await;

        info!("streaming client closed");
    }
}
