use crate::error::BusError;

use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for subscription options
pub trait SubscriptionOptions: Clone + Debug + Default + Send + Sync + 'static {}

/// A trait representing a live subscription.
#[async_trait]
pub trait Subscription
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the subscription.
    type Error: BusError;

    /// Stops delivery to the subscription's handler.
    async fn unsubscribe(&self) -> Result<(), Self::Error>;
}
