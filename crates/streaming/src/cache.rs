use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::num::NonZeroUsize;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Bounded FIFO of items waiting to be replayed.
///
/// Storage is created on first use. When full, the oldest items are evicted
/// to make room and handed back to the caller.
pub struct ReplayCache<T> {
    capacity: NonZeroUsize,
    entries: OnceCell<Mutex<VecDeque<T>>>,
}

impl<T> Debug for ReplayCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ReplayCache<T> {
    /// Creates an empty cache holding at most `capacity` items.
    #[must_use]
    pub const fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            entries: OnceCell::new(),
        }
    }

    fn entries(&self) -> &Mutex<VecDeque<T>> {
        self.entries.get_or_init(|| {
            debug!(capacity = self.capacity.get(), "creating replay cache");
            Mutex::new(VecDeque::new())
        })
    }

    /// Appends `item`, evicting the oldest items while the cache is full.
    ///
    /// Returns the evicted items, oldest first.
    pub fn offer(&self, item: T) -> Vec<T> {
        let mut entries = self.entries().lock();
        let mut evicted = Vec::new();

        while entries.len() >= self.capacity.get() {
            match entries.pop_front() {
                Some(oldest) => evicted.push(oldest),
                None => break,
            }
        }
        entries.push_back(item);

        if !evicted.is_empty() {
            warn!(
                capacity = self.capacity.get(),
                evicted = evicted.len(),
                "replay cache full, discarding oldest entries"
            );
        }

        evicted
    }

    /// Removes and returns the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.entries.get()?.lock().pop_front()
    }

    /// Removes and returns every item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.entries
            .get()
            .map(|entries| entries.lock().drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.entries.get().map_or(0, |entries| entries.lock().len())
    }

    /// Whether the cache holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Whether storage has been created yet.
    pub fn is_initialized(&self) -> bool {
        self.entries.get().is_some()
    }
}
