//! Live fan-out of appended messages to open streams.

use super::MessageFilter;
use crate::error::{BrokerError, Result};
use crate::types::{Message, Sequence};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stored messages a stream replays before switching to live delivery.
pub type Backlog = Box<dyn Iterator<Item = Result<Message>> + Send>;

/// Identifier of a listener registered on a feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Internal listener state.
struct Listener {
    sender: Sender<Message>,
    filter: Arc<dyn MessageFilter>,
}

/// Fans appended messages of one channel out to its open streams.
///
/// Storage must call [`Feed::broadcast`] and [`Feed::register`] under the
/// same lock that serializes its appends. That makes registration atomic
/// with respect to appends: every message lands either in the backlog the
/// stream was given or in its live receiver, never both or neither.
pub struct Feed {
    channel: String,
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl Feed {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Open a stream over `backlog` followed by every later broadcast.
    pub fn register(
        self: &Arc<Self>,
        filter: Arc<dyn MessageFilter>,
        backlog: Backlog,
        from: Sequence,
    ) -> Result<MessageStream> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionLost(self.reason()));
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = unbounded();
        self.listeners.write().insert(
            id,
            Listener {
                sender,
                filter: Arc::clone(&filter),
            },
        );
        debug!(channel = %self.channel, listener = id.0, from = from.0, "listener registered");

        Ok(MessageStream {
            id,
            feed: Arc::clone(self),
            filter,
            backlog: Some(backlog),
            receiver,
            from,
            last: None,
            done: false,
        })
    }

    /// Remove a listener. Its stream sees no further messages.
    pub fn unregister(&self, id: ListenerId) {
        if self.listeners.write().remove(&id).is_some() {
            debug!(channel = %self.channel, listener = id.0, "listener released");
        }
    }

    /// Deliver a freshly appended message to every accepting listener.
    pub fn broadcast(&self, message: &Message) {
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.filter.accepts(message)
                    && listener.sender.send(message.clone()).is_err()
                {
                    to_remove.push(*id);
                }
            }
        }

        // Receivers dropped without unregistering
        if !to_remove.is_empty() {
            let mut listeners = self.listeners.write();
            for id in to_remove {
                listeners.remove(&id);
            }
        }
    }

    /// Mark the feed lost. Every open stream ends with `ConnectionLost`.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        *self.close_reason.lock() = Some(reason.clone());
        self.closed.store(true, Ordering::SeqCst);

        let dropped = {
            let mut listeners = self.listeners.write();
            let count = listeners.len();
            listeners.clear();
            count
        };
        warn!(channel = %self.channel, listeners = dropped, %reason, "feed closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| format!("channel {} closed", self.channel))
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("channel", &self.channel)
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// How long a stream may block waiting for the next message.
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

/// An ordered, live sequence of matching messages.
///
/// Replays its backlog, then blocks on the feed. Iteration ends only when
/// the stream is closed or the connection is lost; the latter yields one
/// `ConnectionLost` error first. Dropping the stream releases its listener.
pub struct MessageStream {
    id: ListenerId,
    feed: Arc<Feed>,
    filter: Arc<dyn MessageFilter>,
    backlog: Option<Backlog>,
    receiver: Receiver<Message>,
    from: Sequence,
    last: Option<Sequence>,
    done: bool,
}

impl MessageStream {
    /// Next message if one is ready, without blocking.
    ///
    /// `None` means nothing is available yet, or the stream has ended
    /// (see [`MessageStream::is_closed`]).
    pub fn try_next(&mut self) -> Option<Result<Message>> {
        self.poll(Wait::Never)
    }

    /// Block up to `timeout` for the next message.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Result<Message>> {
        self.poll(Wait::Until(Instant::now() + timeout))
    }

    /// Release the listener. No message is delivered afterwards.
    pub fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.backlog = None;
            self.feed.unregister(self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done
    }

    /// Sequence of the last message yielded.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last
    }

    fn eligible(&self, message: &Message) -> bool {
        message.sequence >= self.from
            && self.last.map_or(true, |last| message.sequence > last)
            && self.filter.accepts(message)
    }

    fn deliver(&mut self, message: Message) -> Option<Result<Message>> {
        self.last = Some(message.sequence);
        Some(Ok(message))
    }

    fn fail(&mut self, error: BrokerError) -> Option<Result<Message>> {
        self.close();
        Some(Err(error))
    }

    fn poll(&mut self, wait: Wait) -> Option<Result<Message>> {
        if self.done {
            return None;
        }

        while let Some(backlog) = self.backlog.as_mut() {
            match backlog.next() {
                Some(Ok(message)) => {
                    if self.eligible(&message) {
                        return self.deliver(message);
                    }
                }
                Some(Err(e)) => return self.fail(e),
                None => self.backlog = None,
            }
        }

        loop {
            let received = match wait {
                Wait::Never => match self.receiver.try_recv() {
                    Ok(message) => Ok(message),
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Disconnected) => Err(()),
                },
                Wait::Until(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.receiver.recv_timeout(timeout) {
                        Ok(message) => Ok(message),
                        Err(RecvTimeoutError::Timeout) => return None,
                        Err(RecvTimeoutError::Disconnected) => Err(()),
                    }
                }
                Wait::Forever => self.receiver.recv().map_err(|_| ()),
            };

            match received {
                Ok(message) => {
                    if self.eligible(&message) {
                        return self.deliver(message);
                    }
                }
                Err(()) => {
                    let reason = self.feed.reason();
                    return self.fail(BrokerError::ConnectionLost(reason));
                }
            }
        }
    }
}

impl Iterator for MessageStream {
    type Item = Result<Message>;

    /// Blocks until the next matching message arrives.
    fn next(&mut self) -> Option<Self::Item> {
        self.poll(Wait::Forever)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.feed.unregister(self.id);
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream")
            .field("channel", &self.feed.channel())
            .field("listener", &self.id)
            .field("from", &self.from)
            .field("last", &self.last)
            .field("done", &self.done)
            .finish()
    }
}
