use crate::message::Message;

use async_trait::async_trait;

/// A trait representing a consumer of messages delivered to a subscription.
///
/// Plain closures taking a [`Message`] implement it as well.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles a delivered message.
    async fn handle(&self, message: Message);
}

#[async_trait]
impl<F> SubscriptionHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    async fn handle(&self, message: Message) {
        self(message);
    }
}
