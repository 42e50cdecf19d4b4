//! Storage connections: where channel logs live.
//!
//! The broker needs two capabilities from storage:
//! - durable, atomic appends that assign the next sequence of a channel
//! - a live query that replays matching messages from a sequence and then
//!   keeps streaming new ones as they are appended
//!
//! Two connections are provided. [`MemoryConnection`] keeps everything in
//! process; [`FileConnection`] keeps one checksummed log file per channel.
//! Both fan live messages out through a [`Feed`].

mod feed;
mod file;
mod log_file;
mod memory;

pub use feed::{Backlog, Feed, ListenerId, MessageStream};
pub use file::{FileConnection, FileConnectionConfig};
pub use log_file::{LogFile, LogReader};
pub use memory::MemoryConnection;

use crate::error::{BrokerError, Result};
use crate::topic::{Predicate, TopicShape};
use crate::types::{Message, MessageInput, Sequence};
use std::sync::Arc;

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LEN: usize = 128;

/// A filter evaluated by storage against each candidate message.
pub trait MessageFilter: Send + Sync {
    fn accepts(&self, message: &Message) -> bool;
}

impl MessageFilter for Predicate {
    fn accepts(&self, message: &Message) -> bool {
        self.matches(&message.topic)
    }
}

/// The capability set the broker requires from a store.
///
/// Implementations must serialize appends per channel into one total order,
/// and must deliver live messages to each stream in that order.
pub trait StorageConnection: Send + Sync {
    /// Create `channel` with `shape`, or verify an existing channel has it.
    ///
    /// Returns the channel's shape. Fails with `ShapeMismatch` when the
    /// channel already exists with another shape.
    fn ensure_channel(&self, channel: &str, shape: TopicShape) -> Result<TopicShape>;

    /// Durably append a message, assigning the channel's next sequence.
    fn append_document(&self, channel: &str, input: MessageInput) -> Result<Message>;

    /// Stream messages accepted by `filter` with sequence `>= from`, in
    /// order, blocking for new ones once the stored backlog is exhausted.
    fn stream_matching(
        &self,
        channel: &str,
        filter: Arc<dyn MessageFilter>,
        from: Sequence,
    ) -> Result<MessageStream>;

    /// Last assigned sequence of `channel` (`Sequence::ZERO` when empty).
    fn tail(&self, channel: &str) -> Result<Sequence>;

    /// Every stored message of `channel`, oldest first.
    fn scan(&self, channel: &str) -> Result<Vec<Message>>;

    fn is_connected(&self) -> bool;
}

/// Channel names are plain identifiers: ASCII letters, digits, `_` and `-`.
pub fn validate_channel_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidChannel(name.to_string()))
    }
}
