#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use harbor_bus::Message;
use harbor_bus_memory::{MemoryBus, MemorySubscriptionOptions};
use harbor_streaming::{
    DropListener, DropReason, StreamingClient, StreamingConfig, SubscriptionSpec,
};
use parking_lot::Mutex;

pub type Client = StreamingClient<MemoryBus>;

pub fn config() -> StreamingConfig {
    StreamingConfig {
        cluster_id: "test-cluster".to_string(),
        client_id: "test-client".to_string(),
        urls: vec!["memory://local".to_string()],
        reconnect_interval: Some(Duration::from_millis(20)),
        ..StreamingConfig::default()
    }
}

pub fn client(bus: &MemoryBus) -> Client {
    StreamingClient::new(bus.clone(), config())
}

/// Records the payload of every delivered message.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<Bytes>>>);

impl Received {
    pub fn spec(&self, subject: &str) -> SubscriptionSpec<MemorySubscriptionOptions> {
        let received = self.0.clone();
        SubscriptionSpec::new(subject, move |message: Message| {
            received.lock().push(message.payload);
        })
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Records every publish given up on.
#[derive(Clone, Default)]
pub struct Dropped(Arc<Mutex<Vec<(String, Bytes, DropReason)>>>);

impl Dropped {
    pub fn listener(&self) -> DropListener {
        let dropped = self.0.clone();
        Arc::new(move |subject: &str, payload: &Bytes, reason: DropReason| {
            dropped
                .lock()
                .push((subject.to_string(), payload.clone(), reason));
        })
    }

    pub fn entries(&self) -> Vec<(String, Bytes, DropReason)> {
        self.0.lock().clone()
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn payloads(values: &[&'static str]) -> Vec<Bytes> {
    values.iter().map(|value| Bytes::from_static(value.as_bytes())).collect()
}
