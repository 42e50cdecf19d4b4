//! The per-channel entry point for publishers and subscribers.

use crate::error::Result;
use crate::log::MessageLog;
use crate::storage::StorageConnection;
use crate::subscription::Queue;
use crate::topic::{Predicate, Topic, TopicShape};
use crate::types::{Message, Sequence};
use std::sync::Arc;
use tracing::info;

/// Binds a channel name to a storage connection.
///
/// Holds no mutable state; clone it freely or open several exchanges on
/// the same channel.
#[derive(Clone, Debug)]
pub struct Exchange {
    log: MessageLog,
}

impl Exchange {
    /// Open `channel`, creating it with `shape` on first use.
    ///
    /// Fails with `ShapeMismatch` if the channel already exists with a
    /// different shape, and `InvalidChannel` for names storage can't hold.
    pub fn open(
        connection: Arc<dyn StorageConnection>,
        channel: &str,
        shape: TopicShape,
    ) -> Result<Self> {
        let log = MessageLog::open(connection, channel, shape)?;
        info!(channel, %shape, "exchange opened");
        Ok(Self { log })
    }

    pub fn name(&self) -> &str {
        self.log.channel()
    }

    pub fn shape(&self) -> TopicShape {
        self.log.shape()
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Address a topic for publishing.
    ///
    /// Fails with `InvalidTopic` if the value doesn't conform to the
    /// channel's shape.
    pub fn topic(&self, topic: impl Into<Topic>) -> Result<TopicHandle> {
        let topic = topic.into();
        topic.conform(self.shape())?;
        Ok(TopicHandle {
            log: self.log.clone(),
            topic,
        })
    }

    /// Create a subscription to messages published from now on whose topic
    /// satisfies `predicate`.
    ///
    /// Fails with `ShapeMismatch` if the predicate targets another shape.
    pub fn queue(&self, predicate: Predicate) -> Result<Queue> {
        predicate.check_shape(self.shape())?;
        let cursor = self.log.tail()?.next();
        Ok(Queue::new(self.log.clone(), predicate, cursor))
    }

    /// Create a subscription starting at an explicit sequence, e.g. to resume
    /// after `ConnectionLost` from [`Subscription::cursor`].
    ///
    /// [`Subscription::cursor`]: crate::Subscription::cursor
    pub fn queue_from(&self, predicate: Predicate, cursor: Sequence) -> Result<Queue> {
        predicate.check_shape(self.shape())?;
        Ok(Queue::new(self.log.clone(), predicate, cursor.max(Sequence(1))))
    }

    /// Most recent message published on exactly `topic`, if any.
    pub fn latest(&self, topic: impl Into<Topic>) -> Result<Option<Message>> {
        let topic = topic.into();
        topic.conform(self.shape())?;
        self.log.latest(&topic)
    }
}

/// A validated topic, ready to publish on.
#[derive(Clone, Debug)]
pub struct TopicHandle {
    log: MessageLog,
    topic: Topic,
}

impl TopicHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Append `payload` under this topic and return its sequence.
    pub fn publish(&self, payload: impl Into<String>) -> Result<Sequence> {
        self.log.append(self.topic.clone(), payload)
    }
}
