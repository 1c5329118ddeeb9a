use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use harbor_bus::SubscriptionHandler;
use indexmap::IndexMap;
use parking_lot::RwLock;

/// Everything needed to (re)establish a subscription.
pub struct SubscriptionSpec<O> {
    /// Subject, possibly with wildcards.
    pub subject: String,

    /// Queue group; members share deliveries.
    pub queue: Option<String>,

    /// Receives every delivered message.
    pub handler: Arc<dyn SubscriptionHandler>,

    /// Backend specific options.
    pub options: O,
}

impl<O> SubscriptionSpec<O>
where
    O: Default,
{
    /// Creates a spec for `subject` with default options and no queue group.
    pub fn new<H>(subject: impl Into<String>, handler: H) -> Self
    where
        H: SubscriptionHandler,
    {
        Self::with_handler(subject, Arc::new(handler))
    }

    /// Like [`Self::new`], sharing an existing handler.
    pub fn with_handler(subject: impl Into<String>, handler: Arc<dyn SubscriptionHandler>) -> Self {
        Self {
            subject: subject.into(),
            queue: None,
            handler,
            options: O::default(),
        }
    }
}

impl<O> SubscriptionSpec<O> {
    /// Joins the queue group `queue`.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Replaces the backend options.
    #[must_use]
    pub fn options(mut self, options: O) -> Self {
        self.options = options;
        self
    }
}

impl<O> Clone for SubscriptionSpec<O>
where
    O: Clone,
{
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            options: self.options.clone(),
        }
    }
}

impl<O> Debug for SubscriptionSpec<O>
where
    O: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A registration as seen at snapshot time.
#[derive(Debug)]
pub struct RegisteredSpec<O> {
    /// Registration key.
    pub key: String,

    /// Bumped every time the key is registered again.
    pub revision: u64,

    /// The spec to subscribe with.
    pub spec: SubscriptionSpec<O>,
}

struct Registration<O, S> {
    revision: u64,
    spec: SubscriptionSpec<O>,
    active: Option<(u64, S)>,
}

/// Keyed set of subscriptions to restore after every reconnect.
///
/// Registering an existing key replaces its spec but keeps its position;
/// snapshots are returned in first-registration order.
pub struct SubscriptionRegistry<O, S> {
    entries: RwLock<IndexMap<String, Registration<O, S>>>,
    revisions: AtomicU64,
}

impl<O, S> Default for SubscriptionRegistry<O, S> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            revisions: AtomicU64::new(0),
        }
    }
}

impl<O, S> Debug for SubscriptionRegistry<O, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl<O, S> SubscriptionRegistry<O, S>
where
    O: Clone,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `spec` under `key`, replacing any earlier registration.
    ///
    /// Returns the new revision and the handle that was active for the
    /// replaced registration, if any.
    pub fn register(&self, key: impl Into<String>, spec: SubscriptionSpec<O>) -> (u64, Option<S>) {
        let key = key.into();
        let revision = self.revisions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get_mut(&key) {
            existing.revision = revision;
            existing.spec = spec;
            return (revision, existing.active.take().map(|(_, handle)| handle));
        }

        entries.insert(
            key,
            Registration {
                revision,
                spec,
                active: None,
            },
        );

        (revision, None)
    }

    /// Copies every registration so callers can iterate without the lock.
    pub fn snapshot(&self) -> Vec<RegisteredSpec<O>> {
        self.entries
            .read()
            .iter()
            .map(|(key, registration)| RegisteredSpec {
                key: key.clone(),
                revision: registration.revision,
                spec: registration.spec.clone(),
            })
            .collect()
    }
}

impl<O, S> SubscriptionRegistry<O, S> {
    /// Records `handle` as the live subscription of `key` on connection
    /// `generation`, provided `revision` is still current.
    ///
    /// Returns the handle the caller must release: the replaced one on
    /// success, or `handle` itself when the registration moved on.
    pub fn activate(&self, key: &str, revision: u64, generation: u64, handle: S) -> Option<S> {
        let mut entries = self.entries.write();

        match entries.get_mut(key) {
            Some(registration) if registration.revision == revision => registration
                .active
                .replace((generation, handle))
                .map(|(_, previous)| previous),
            _ => Some(handle),
        }
    }

    /// Whether `key` has a live subscription on connection `generation`.
    pub fn is_active(&self, key: &str, generation: u64) -> bool {
        self.entries
            .read()
            .get(key)
            .and_then(|registration| registration.active.as_ref())
            .is_some_and(|(active, _)| *active == generation)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
