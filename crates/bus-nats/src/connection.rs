use crate::subscription::{NatsSubscription, NatsSubscriptionOptions};
use crate::{Error, Link};

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use harbor_bus::{Ack, AckCallback, Connection, Message, MessageId, SubscriptionHandler};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// A connection to a NATS server.
pub struct NatsConnection {
    client: Mutex<Option<Client>>,
    link: Arc<Link>,
    subscriptions: CancellationToken,
}

impl Debug for NatsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsConnection")
            .field("open", &self.client.lock().is_some())
            .field("connected", &self.link.is_connected())
            .finish_non_exhaustive()
    }
}

impl NatsConnection {
    pub(crate) fn new(client: Client, link: Arc<Link>) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            link,
            subscriptions: CancellationToken::new(),
        }
    }

    fn client(&self) -> Result<Client, Error> {
        self.client.lock().clone().ok_or(Error::Closed)
    }

    /// Maps a failure to [`Error::Disconnected`] if the link is down.
    fn classify(&self, error: Error) -> Error {
        if self.link.is_connected() {
            error
        } else {
            Error::Disconnected(error.to_string())
        }
    }
}

#[async_trait]
impl Connection for NatsConnection {
    type Error = Error;
    type Subscription = NatsSubscription;
    type SubscriptionOptions = NatsSubscriptionOptions;

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        ack: Option<AckCallback<Self::Error>>,
    ) -> Result<MessageId, Self::Error> {
        let jetstream = async_nats::jetstream::new(self.client()?);
        let message_id = MessageId::new(Uuid::new_v4().to_string());

        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", message_id.as_str());

        let ack_future = jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| self.classify(Error::Publish(e.kind())))?;

        trace!(%message_id, subject, "published");

        if let Some(ack) = ack {
            let link = self.link.clone();
            let ack_id = message_id.clone();

            tokio::spawn(async move {
                match ack_future.await {
                    Ok(_) => ack(Ack::ok(ack_id)),
                    Err(e) => {
                        let error = Error::Publish(e.kind());
                        let error = if link.is_connected() {
                            error
                        } else {
                            Error::Disconnected(error.to_string())
                        };
                        ack(Ack::failed(ack_id, error));
                    }
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
        options: &Self::SubscriptionOptions,
    ) -> Result<Self::Subscription, Self::Error> {
        let client = self.client()?;
        let subscribe_error = |e: &dyn std::error::Error| Error::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        };

        let mut subscriber = match queue {
            Some(queue) => client
                .queue_subscribe(subject.to_string(), queue.to_string())
                .await
                .map_err(|e| self.classify(subscribe_error(&e)))?,
            None => client
                .subscribe(subject.to_string())
                .await
                .map_err(|e| self.classify(subscribe_error(&e)))?,
        };

        if let Some(max_messages) = options.max_messages {
            subscriber
                .unsubscribe_after(max_messages)
                .await
                .map_err(|e| self.classify(subscribe_error(&e)))?;
        }

        let stop = self.subscriptions.child_token();
        let subscription = NatsSubscription::new(stop.clone());
        let subject = subject.to_string();

        debug!(subject, queue, "subscribed");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            break;
                        };

                        handler
                            .handle(Message {
                                subject: message.subject.to_string(),
                                payload: message.payload,
                                sequence: None,
                            })
                            .await;
                    }
                }
            }

            let _ = subscriber.unsubscribe().await;
            debug!(subject, "subscription stopped");
        });

        Ok(subscription)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.link.mark_closing();
        self.subscriptions.cancel();

        let client = self.client.lock().take();
        let Some(client) = client else {
            return Ok(());
        };

        // flushing blocks until the link is back
        if !self.link.is_connected() {
            debug!("link down, closing without flush");
            return Ok(());
        }

        client
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()))
    }
}
