//! Process-local storage connection.

use super::feed::{Backlog, Feed, MessageStream};
use super::{validate_channel_name, MessageFilter, StorageConnection};
use crate::error::{BrokerError, Result};
use crate::topic::TopicShape;
use crate::types::{Message, MessageInput, Sequence};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One channel's log and feed.
struct MemoryChannel {
    shape: TopicShape,
    /// Held for the whole append so sequence assignment and broadcast are
    /// a single step.
    messages: Mutex<Vec<Message>>,
    feed: Arc<Feed>,
}

/// Volatile storage connection. Messages live as long as the connection.
pub struct MemoryConnection {
    channels: RwLock<HashMap<String, Arc<MemoryChannel>>>,
    connected: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Drop the connection. Open streams end with `ConnectionLost`, and
    /// every later call fails with it.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels = self.channels.read();
        warn!(channels = channels.len(), "memory connection dropped");
        for channel in channels.values() {
            // Waits out an in-flight append so it is delivered before the close.
            let _messages = channel.messages.lock();
            channel.feed.close("memory connection dropped");
        }
    }

    /// Number of open streams on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, |c| c.feed.listener_count())
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost(
                "memory connection dropped".into(),
            ))
        }
    }

    fn channel(&self, name: &str) -> Result<Arc<MemoryChannel>> {
        self.check_connected()?;
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageConnection for MemoryConnection {
    fn ensure_channel(&self, channel: &str, shape: TopicShape) -> Result<TopicShape> {
        self.check_connected()?;
        validate_channel_name(channel)?;

        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(channel) {
            if existing.shape != shape {
                return Err(BrokerError::ShapeMismatch {
                    expected: existing.shape,
                    got: shape,
                });
            }
            return Ok(existing.shape);
        }

        channels.insert(
            channel.to_string(),
            Arc::new(MemoryChannel {
                shape,
                messages: Mutex::new(Vec::new()),
                feed: Arc::new(Feed::new(channel)),
            }),
        );
        info!(channel, %shape, "channel created");
        Ok(shape)
    }

    fn append_document(&self, channel: &str, input: MessageInput) -> Result<Message> {
        let channel = self.channel(channel)?;

        let mut messages = channel.messages.lock();
        self.check_connected()?;
        let sequence = Sequence(messages.len() as u64 + 1);
        let message = input.into_message(sequence);
        messages.push(message.clone());
        channel.feed.broadcast(&message);

        debug!(channel = %channel.feed.channel(), sequence = sequence.0, "appended");
        Ok(message)
    }

    fn stream_matching(
        &self,
        channel: &str,
        filter: Arc<dyn MessageFilter>,
        from: Sequence,
    ) -> Result<MessageStream> {
        let channel = self.channel(channel)?;

        let messages = channel.messages.lock();
        let start = (from.0.max(1) - 1) as usize;
        let backlog: Vec<Result<Message>> = messages
            .iter()
            .skip(start)
            .filter(|m| filter.accepts(m))
            .cloned()
            .map(Ok)
            .collect();
        let backlog: Backlog = Box::new(backlog.into_iter());
        channel.feed.register(filter, backlog, from)
    }

    fn tail(&self, channel: &str) -> Result<Sequence> {
        let channel = self.channel(channel)?;
        let len = channel.messages.lock().len();
        Ok(Sequence(len as u64))
    }

    fn scan(&self, channel: &str) -> Result<Vec<Message>> {
        let channel = self.channel(channel)?;
        let messages = channel.messages.lock().clone();
        Ok(messages)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
