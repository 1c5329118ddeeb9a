use crate::subscription::{MemorySubscription, MemorySubscriptionOptions};
use crate::{Error, MemoryBus};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use harbor_bus::{Ack, AckCallback, Connection, MessageId, SubscriptionHandler};

/// A connection to a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    bus: MemoryBus,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub(crate) const fn new(id: u64, bus: MemoryBus, open: Arc<AtomicBool>) -> Self {
        Self { id, bus, open }
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.bus.is_registered(self.id)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;
    type Subscription = MemorySubscription;
    type SubscriptionOptions = MemorySubscriptionOptions;

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        ack: Option<AckCallback<Self::Error>>,
    ) -> Result<MessageId, Self::Error> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let (message_id, interrupted) = self.bus.route(self.id, subject, payload)?;

        if let Some(ack) = ack {
            let ack_id = message_id.clone();
            tokio::spawn(async move {
                if interrupted {
                    ack(Ack::failed(ack_id, Error::AckInterrupted));
                } else {
                    ack(Ack::ok(ack_id));
                }
            });
        }

        Ok(message_id)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: Arc<dyn SubscriptionHandler>,
        _options: &Self::SubscriptionOptions,
    ) -> Result<Self::Subscription, Self::Error> {
        let id = self.bus.add_subscription(self.id, subject, queue, handler)?;

        Ok(MemorySubscription::new(id, self.bus.clone()))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.open.store(false, Ordering::SeqCst);
        self.bus.close_connection(self.id);
        Ok(())
    }
}
