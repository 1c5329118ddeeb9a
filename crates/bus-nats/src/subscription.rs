use crate::Error;

use async_trait::async_trait;
use harbor_bus::{Subscription, SubscriptionOptions};
use tokio_util::sync::CancellationToken;

/// Options for new NATS subscriptions.
#[derive(Clone, Debug, Default)]
pub struct NatsSubscriptionOptions {
    /// Stop after this many messages have been delivered.
    pub max_messages: Option<u64>,
}

impl SubscriptionOptions for NatsSubscriptionOptions {}

/// A live NATS subscription. Stops when unsubscribed or when its connection
/// is closed.
#[derive(Clone, Debug)]
pub struct NatsSubscription {
    stop: CancellationToken,
}

impl NatsSubscription {
    pub(crate) const fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    type Error = Error;

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        self.stop.cancel();
        Ok(())
    }
}
