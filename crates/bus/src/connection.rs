use crate::error::BusError;
use crate::message::{AckCallback, MessageId};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::subscription_handler::SubscriptionHandler;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// A trait representing a live session with the bus.
#[async_trait]
pub trait Connection
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: BusError;

    /// Live subscription handles.
    type Subscription: Subscription<Error = Self::Error>;

    /// Backend specific subscription options.
    type SubscriptionOptions: SubscriptionOptions;

    /// Publishes `payload` on `subject`.
    ///
    /// If the publish is accepted the returned identifier is final and `ack`,
    /// when given, is invoked exactly once later with the outcome. If this
    /// returns an error `ack` is never invoked.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        ack: Option<AckCallback<Self::Error>>,
    ) -> Result<MessageId, Self::Error>;

    /// Subscribes `handler` to `subject`, optionally as a member of `queue`.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: Arc<dyn SubscriptionHandler>,
        options: &Self::SubscriptionOptions,
    ) -> Result<Self::Subscription, Self::Error>;

    /// Closes the connection. Does not trigger the connection-lost handler.
    async fn close(&self) -> Result<(), Self::Error>;
}
