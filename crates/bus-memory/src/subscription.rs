use crate::{Error, MemoryBus};

use async_trait::async_trait;
use harbor_bus::{Subscription, SubscriptionOptions};

/// Options for in-memory subscriptions (there are none).
#[derive(Clone, Copy, Debug, Default)]
pub struct MemorySubscriptionOptions;

impl SubscriptionOptions for MemorySubscriptionOptions {}

/// A live subscription on a [`MemoryBus`].
#[derive(Debug)]
pub struct MemorySubscription {
    id: u64,
    bus: MemoryBus,
}

impl MemorySubscription {
    pub(crate) const fn new(id: u64, bus: MemoryBus) -> Self {
        Self { id, bus }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    type Error = Error;

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        self.bus.remove_subscription(self.id);
        Ok(())
    }
}
