//! Queue and subscription state machine.

use crate::error::Result;
use crate::log::MessageLog;
use crate::storage::MessageStream;
use crate::topic::{Predicate, Topic};
use crate::types::{Message, Sequence};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Cursor and predicate fixed, log not yet read.
    Created,
    /// Stream opened, nothing pulled yet.
    Subscribing,
    /// Last pull yielded a message.
    Delivering,
    /// Blocked (or last timed out) waiting for the next match.
    Waiting,
    /// Released by the consumer or ended by a log error. Terminal.
    Closed,
}

/// A durable subscription definition: a predicate plus a starting cursor.
///
/// A queue itself never leaves [`SubscriptionState::Created`]; each
/// [`Queue::subscribe`] call starts its own state machine.
#[derive(Clone)]
pub struct Queue {
    log: MessageLog,
    predicate: Arc<Predicate>,
    cursor: Sequence,
}

impl Queue {
    pub(crate) fn new(log: MessageLog, predicate: Predicate, cursor: Sequence) -> Self {
        Self {
            log,
            predicate: Arc::new(predicate),
            cursor,
        }
    }

    /// First sequence eligible for delivery.
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Start consuming. Each call opens an independent subscription at the
    /// queue's cursor.
    pub fn subscribe(&self) -> Result<Subscription> {
        let stream = self
            .log
            .read_matching(self.cursor, Arc::clone(&self.predicate))?;

        info!(
            channel = self.log.channel(),
            predicate = %self.predicate,
            cursor = self.cursor.0,
            "subscribed"
        );

        Ok(Subscription {
            channel: self.log.channel().to_string(),
            predicate: Arc::clone(&self.predicate),
            stream: Some(stream),
            cursor: self.cursor,
            state: SubscriptionState::Subscribing,
        })
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("channel", &self.log.channel())
            .field("predicate", &self.predicate.to_string())
            .field("cursor", &self.cursor)
            .finish()
    }
}

enum Wait {
    Never,
    For(Duration),
    Forever,
}

/// A live, blocking sequence of `(topic, payload)` pairs.
///
/// Iteration never ends on its own; it yields a single error and stops if
/// the connection is lost, and stops when closed.
pub struct Subscription {
    channel: String,
    predicate: Arc<Predicate>,
    stream: Option<MessageStream>,
    cursor: Sequence,
    state: SubscriptionState,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Next sequence eligible for delivery; everything before it has
    /// already been delivered or skipped. Pass it to
    /// [`Exchange::queue_from`](crate::Exchange::queue_from) to resume.
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Block until the next matching message.
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        self.advance(Wait::Forever)
    }

    /// Block up to `timeout` for the next match. `None` on timeout or once
    /// closed.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Result<(Topic, String)>> {
        self.advance(Wait::For(timeout)).map(into_pair)
    }

    /// Next match if one is already available.
    pub fn try_next(&mut self) -> Option<Result<(Topic, String)>> {
        self.advance(Wait::Never).map(into_pair)
    }

    /// Stop consuming and release the storage stream.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(channel = %self.channel, cursor = self.cursor.0, "subscription closed");
        }
        self.state = SubscriptionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SubscriptionState::Closed
    }

    fn advance(&mut self, wait: Wait) -> Option<Result<Message>> {
        let stream = self.stream.as_mut()?;

        let item = match stream.try_next() {
            Some(item) => Some(item),
            None if stream.is_closed() => None,
            None => {
                self.state = SubscriptionState::Waiting;
                match wait {
                    Wait::Never => None,
                    Wait::For(timeout) => stream.next_timeout(timeout),
                    Wait::Forever => stream.next(),
                }
            }
        };

        match item {
            Some(Ok(message)) => {
                self.state = SubscriptionState::Delivering;
                self.cursor = message.sequence.next();
                Some(Ok(message))
            }
            Some(Err(e)) => {
                warn!(channel = %self.channel, cursor = self.cursor.0, error = %e, "subscription failed");
                self.close();
                Some(Err(e))
            }
            None => {
                if self.stream.as_ref().map_or(true, MessageStream::is_closed) {
                    self.close();
                }
                None
            }
        }
    }
}

fn into_pair(item: Result<Message>) -> Result<(Topic, String)> {
    item.map(|message| (message.topic, message.payload))
}

impl Iterator for Subscription {
    type Item = Result<(Topic, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().map(into_pair)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("predicate", &self.predicate.to_string())
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::storage::{MemoryConnection, StorageConnection};
    use crate::topic::TopicShape;
    use crate::Exchange;

    fn setup() -> (Arc<MemoryConnection>, Exchange) {
        let conn = Arc::new(MemoryConnection::new());
        let ex = Exchange::open(conn.clone(), "regex_demo", TopicShape::Path).unwrap();
        (conn, ex)
    }

    #[test]
    fn test_state_transitions() {
        let (_conn, ex) = setup();
        let queue = ex.queue(Predicate::always()).unwrap();

        let mut sub = queue.subscribe().unwrap();
        assert_eq!(sub.state(), SubscriptionState::Subscribing);

        assert!(sub.try_next().is_none());
        assert_eq!(sub.state(), SubscriptionState::Waiting);

        ex.topic("a.b").unwrap().publish("x").unwrap();
        assert!(sub.try_next().unwrap().is_ok());
        assert_eq!(sub.state(), SubscriptionState::Delivering);
        assert_eq!(sub.cursor(), Sequence(2));

        sub.close();
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(sub.next().is_none());
    }

    #[test]
    fn test_timeout_keeps_waiting() {
        let (_conn, ex) = setup();
        let mut sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();

        assert!(sub.next_timeout(Duration::from_millis(20)).is_none());
        assert_eq!(sub.state(), SubscriptionState::Waiting);
        assert!(!sub.is_closed());
    }

    #[test]
    fn test_close_releases_stream() {
        let (conn, ex) = setup();
        let mut sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();
        assert_eq!(conn.listener_count("regex_demo"), 1);

        sub.close();
        assert_eq!(conn.listener_count("regex_demo"), 0);

        ex.topic("a.b").unwrap().publish("late").unwrap();
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_drop_releases_stream() {
        let (conn, ex) = setup();
        let sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();
        assert_eq!(conn.listener_count("regex_demo"), 1);
        drop(sub);
        assert_eq!(conn.listener_count("regex_demo"), 0);
    }

    #[test]
    fn test_connection_lost_is_fatal() {
        let (conn, ex) = setup();
        let mut sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();

        conn.disconnect();

        assert!(matches!(sub.next(), Some(Err(BrokerError::ConnectionLost(_)))));
        assert!(sub.is_closed());
        assert!(sub.next().is_none());
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_independent_subscriptions_from_one_queue() {
        let (_conn, ex) = setup();
        let queue = ex.queue(Predicate::pattern(r"^fights\.").unwrap()).unwrap();
        let mut first = queue.subscribe().unwrap();

        ex.topic("fights.superheroes.Batman").unwrap().publish("1").unwrap();
        ex.topic("events.sidekicks.Robin").unwrap().publish("2").unwrap();

        // Second subscriber on the same queue still starts at the queue's cursor.
        let mut second = queue.subscribe().unwrap();

        let a = first.try_next().unwrap().unwrap();
        let b = second.try_next().unwrap().unwrap();
        assert_eq!(a, b);
        assert!(first.try_next().is_none());
        assert!(second.try_next().is_none());
    }
}
