use std::fmt::{self, Debug, Display};

use bytes::Bytes;

/// Identifier the bus assigns to an accepted publish.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new message identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A message delivered to a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The concrete subject the message was published on.
    pub subject: String,

    /// The message body.
    pub payload: Bytes,

    /// Position in the stream, if the backend tracks one.
    pub sequence: Option<u64>,
}

/// The asynchronous outcome of a publish.
#[derive(Debug)]
pub struct Ack<E> {
    /// The identifier returned when the publish was accepted.
    pub message_id: MessageId,

    /// `Ok` once the bus has stored the message, otherwise why it did not.
    pub result: Result<(), E>,
}

impl<E> Ack<E> {
    /// Creates a successful acknowledgement.
    pub const fn ok(message_id: MessageId) -> Self {
        Self {
            message_id,
            result: Ok(()),
        }
    }

    /// Creates a failed acknowledgement.
    pub const fn failed(message_id: MessageId, error: E) -> Self {
        Self {
            message_id,
            result: Err(error),
        }
    }
}

/// Callback invoked exactly once with the acknowledgement of an accepted publish.
pub type AckCallback<E> = Box<dyn FnOnce(Ack<E>) + Send + 'static>;
