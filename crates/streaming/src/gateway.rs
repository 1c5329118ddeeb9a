use crate::cache::ReplayCache;
use crate::error::Error;
use crate::manager::ConnectionManager;
use crate::BusErrorOf;

use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use harbor_bus::{Ack, AckCallback, BusError, Connection, Connector, MessageId};
use tracing::{debug, error, info, warn};

/// Handler receiving the acknowledgement of a publish.
///
/// Shared so it survives being cached and replayed.
pub type AckHandler<E> = Arc<dyn Fn(Ack<E>) + Send + Sync + 'static>;

/// Why a publish was given up on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// Pushed out of a full replay cache.
    Evicted,

    /// Failed again while being replayed.
    ReplayFailed,
}

/// Called with the subject and payload of every publish that is given up on.
pub type DropListener = Arc<dyn Fn(&str, &Bytes, DropReason) + Send + Sync + 'static>;

/// A publish waiting in the replay cache.
pub struct PendingPublish<E> {
    /// Subject to publish on.
    pub subject: String,

    /// Message body.
    pub payload: Bytes,

    /// Handler to run once the publish is finally acknowledged.
    pub ack_handler: Option<AckHandler<E>>,
}

impl<E> Clone for PendingPublish<E> {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            ack_handler: self.ack_handler.clone(),
        }
    }
}

impl<E> Debug for PendingPublish<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPublish")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("ack_handler", &self.ack_handler.is_some())
            .finish()
    }
}

/// Running totals for the replay cache.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    /// Publishes stored for replay.
    pub cached: u64,

    /// Publishes pushed out of a full cache.
    pub evicted: u64,

    /// Cached publishes accepted by the bus on replay.
    pub replayed: u64,

    /// Cached publishes that failed again on replay.
    pub replay_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cached: AtomicU64,
    evicted: AtomicU64,
    replayed: AtomicU64,
    replay_failed: AtomicU64,
}

/// Outcome of draining the replay cache.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayReport {
    /// Entries the bus accepted.
    pub replayed: usize,

    /// Entries that failed and were dropped.
    pub dropped: usize,
}

struct Buffer<E> {
    cache: ReplayCache<PendingPublish<E>>,
    counters: Counters,
    drop_listener: Option<DropListener>,
}

impl<E> Buffer<E> {
    fn store(&self, pending: PendingPublish<E>) {
        self.counters.cached.fetch_add(1, Ordering::Relaxed);

        for evicted in self.cache.offer(pending) {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.notify(&evicted.subject, &evicted.payload, DropReason::Evicted);
        }
    }

    fn replay_failed(&self, subject: &str, payload: &Bytes) {
        self.counters.replay_failed.fetch_add(1, Ordering::Relaxed);
        self.notify(subject, payload, DropReason::ReplayFailed);
    }

    fn notify(&self, subject: &str, payload: &Bytes, reason: DropReason) {
        if let Some(listener) = &self.drop_listener {
            listener(subject, payload, reason);
        }
    }
}

/// Publishing half of the client: plain, acknowledged and safe publishes,
/// plus replay of whatever safe publishes had to cache.
pub(crate) struct PublishGateway<C>
where
    C: Connector,
{
    manager: Arc<ConnectionManager<C>>,
    buffer: Arc<Buffer<BusErrorOf<C>>>,
}

impl<C> Clone for PublishGateway<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

impl<C> PublishGateway<C>
where
    C: Connector,
{
    pub(crate) fn new(
        manager: Arc<ConnectionManager<C>>,
        capacity: NonZeroUsize,
        drop_listener: Option<DropListener>,
    ) -> Self {
        Self {
            manager,
            buffer: Arc::new(Buffer {
                cache: ReplayCache::new(capacity),
                counters: Counters::default(),
                drop_listener,
            }),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.buffer.cache.len()
    }

    pub(crate) fn stats(&self) -> ReplayStats {
        let counters = &self.buffer.counters;

        ReplayStats {
            cached: counters.cached.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            replayed: counters.replayed.load(Ordering::Relaxed),
            replay_failed: counters.replay_failed.load(Ordering::Relaxed),
        }
    }

    /// Publishes on the current connection. Failures are returned as is.
    pub(crate) async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
    ) -> Result<MessageId, Error<BusErrorOf<C>>> {
        let live = self.manager.live()?;

        live.connection()
            .publish(subject, payload, None)
            .await
            .map_err(Error::Bus)
    }

    /// Publishes on the current connection, handing the acknowledgement to
    /// `ack_handler`. Failures are returned as is.
    pub(crate) async fn publish_with_ack(
        &self,
        subject: &str,
        payload: Bytes,
        ack_handler: AckHandler<BusErrorOf<C>>,
    ) -> Result<MessageId, Error<BusErrorOf<C>>> {
        let live = self.manager.live()?;
        let callback: AckCallback<BusErrorOf<C>> = Box::new(move |ack| ack_handler(ack));

        live.connection()
            .publish(subject, payload, Some(callback))
            .await
            .map_err(Error::Bus)
    }

    /// Publishes, or caches the publish for replay if the connection is
    /// unavailable.
    ///
    /// Returns `Ok(None)` when the publish was cached. A cached publish whose
    /// acknowledgement later reports a transient failure is cached again;
    /// any other acknowledgement goes to `ack_handler`.
    pub(crate) async fn safe_publish(
        &self,
        subject: &str,
        payload: Bytes,
        ack_handler: Option<AckHandler<BusErrorOf<C>>>,
    ) -> Result<Option<MessageId>, Error<BusErrorOf<C>>> {
        let pending = PendingPublish {
            subject: subject.to_string(),
            payload,
            ack_handler,
        };

        match self.attempt(&pending, false).await {
            Ok(message_id) => Ok(Some(message_id)),
            Err(error) if error.is_transient() => {
                warn!(subject, %error, "message bus unavailable, caching publish for replay");
                self.buffer.store(pending);

                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn attempt(
        &self,
        pending: &PendingPublish<BusErrorOf<C>>,
        replaying: bool,
    ) -> Result<MessageId, Error<BusErrorOf<C>>> {
        let live = self.manager.live()?;
        let callback = self.ack_callback(pending.clone(), replaying);

        live.connection()
            .publish(&pending.subject, pending.payload.clone(), Some(callback))
            .await
            .map_err(Error::Bus)
    }

    fn ack_callback(
        &self,
        pending: PendingPublish<BusErrorOf<C>>,
        replaying: bool,
    ) -> AckCallback<BusErrorOf<C>> {
        let buffer = self.buffer.clone();

        Box::new(move |ack: Ack<BusErrorOf<C>>| match ack.result {
            Err(error) if error.is_transient() && replaying => {
                error!(
                    message_id = %ack.message_id,
                    subject = %pending.subject,
                    %error,
                    "replayed publish interrupted in transit, dropping it"
                );
                buffer.replay_failed(&pending.subject, &pending.payload);
            }
            Err(error) if error.is_transient() => {
                warn!(
                    message_id = %ack.message_id,
                    subject = %pending.subject,
                    %error,
                    "publish interrupted in transit, caching for replay"
                );
                buffer.store(pending);
            }
            result => {
                if let Some(handler) = &pending.ack_handler {
                    handler(Ack {
                        message_id: ack.message_id,
                        result,
                    });
                }
            }
        })
    }

    /// Takes every cached publish and gives each one attempt, oldest first.
    ///
    /// Entries that fail again are dropped, reported to the drop listener
    /// and never cached a second time.
    pub(crate) async fn drain_and_replay_all(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let pending = self.buffer.cache.drain();

        if pending.is_empty() {
            return report;
        }

        info!(count = pending.len(), "replaying cached publishes");

        for entry in pending {
            match self.attempt(&entry, true).await {
                Ok(message_id) => {
                    self.buffer.counters.replayed.fetch_add(1, Ordering::Relaxed);
                    report.replayed += 1;
                    debug!(%message_id, subject = %entry.subject, "replayed cached publish");
                }
                Err(error) => {
                    error!(subject = %entry.subject, %error, "failed to replay cached publish, dropping it");
                    self.buffer.replay_failed(&entry.subject, &entry.payload);
                    report.dropped += 1;
                }
            }
        }

        info!(
            replayed = report.replayed,
            dropped = report.dropped,
            "finished replaying cached publishes"
        );

        report
    }
}
