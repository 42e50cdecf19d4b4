//! Per-channel message log over a storage connection.

use crate::error::Result;
use crate::storage::{MessageStream, StorageConnection};
use crate::topic::{Predicate, Topic, TopicShape};
use crate::types::{Message, MessageInput, Sequence};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The append-only, totally ordered log of one channel.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct MessageLog {
    channel: Arc<str>,
    shape: TopicShape,
    connection: Arc<dyn StorageConnection>,
}

impl MessageLog {
    /// Bind to `channel`, creating it with `shape` if it doesn't exist.
    pub fn open(
        connection: Arc<dyn StorageConnection>,
        channel: &str,
        shape: TopicShape,
    ) -> Result<Self> {
        let shape = connection.ensure_channel(channel, shape)?;
        Ok(Self {
            channel: Arc::from(channel),
            shape,
            connection,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn shape(&self) -> TopicShape {
        self.shape
    }

    /// Append a message and return its sequence.
    ///
    /// The topic is checked against the channel's shape first; a rejected
    /// topic writes nothing.
    pub fn append(&self, topic: Topic, payload: impl Into<String>) -> Result<Sequence> {
        Ok(self.append_message(topic, payload)?.sequence)
    }

    /// Like [`MessageLog::append`], returning the stored message.
    pub fn append_message(&self, topic: Topic, payload: impl Into<String>) -> Result<Message> {
        topic.conform(self.shape)?;
        let message = self
            .connection
            .append_document(&self.channel, MessageInput::new(topic, payload))?;
        debug!(channel = %self.channel, sequence = message.sequence.0, topic = %message.topic, "published");
        Ok(message)
    }

    /// Every message with sequence `>= from`, blocking at the end of the
    /// log instead of terminating.
    pub fn read_from(&self, from: Sequence) -> Result<MessageStream> {
        self.connection
            .stream_matching(&self.channel, Arc::new(Predicate::always()), from)
    }

    /// [`MessageLog::read_from`] with `predicate` evaluated by storage.
    pub fn read_matching(&self, from: Sequence, predicate: Arc<Predicate>) -> Result<MessageStream> {
        predicate.check_shape(self.shape)?;
        self.connection.stream_matching(&self.channel, predicate, from)
    }

    /// Last assigned sequence (`Sequence::ZERO` for an empty log).
    pub fn tail(&self) -> Result<Sequence> {
        self.connection.tail(&self.channel)
    }

    /// Most recent message published on exactly `topic`.
    ///
    /// Topics compare by canonical form, so tag order and hierarchy
    /// construction order don't matter.
    pub fn latest(&self, topic: &Topic) -> Result<Option<Message>> {
        let messages = self.connection.scan(&self.channel)?;
        Ok(messages.into_iter().rev().find(|m| &m.topic == topic))
    }
}

impl fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLog")
            .field("channel", &self.channel)
            .field("shape", &self.shape)
            .finish()
    }
}
