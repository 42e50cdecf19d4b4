//! # repubsub
//!
//! A publish/subscribe broker layered over an append-only, live-queryable
//! message log.
//!
//! ## Core Concepts
//!
//! - **Exchange**: A named channel bound to a storage connection
//! - **Topics**: Dotted paths, tag sets, or category hierarchies, fixed per channel
//! - **Queues**: A predicate plus a starting cursor, subscribed to on demand
//! - **Subscriptions**: Blocking, ordered iterators of matching `(topic, payload)` pairs
//!
//! ## Example
//!
//! ```ignore
//! use repubsub::{Exchange, FileConnection, FileConnectionConfig, Predicate, TopicShape};
//! use std::sync::Arc;
//!
//! let connection = Arc::new(FileConnection::open_or_create(FileConnectionConfig {
//!     path: "./broker".into(),
//!     ..Default::default()
//! })?);
//!
//! let exchange = Exchange::open(connection, "regex_demo", TopicShape::Path)?;
//! let queue = exchange.queue(Predicate::pattern(r"^fights\.(.+)\.Batman$")?)?;
//! let mut subscription = queue.subscribe()?;
//!
//! exchange.topic("fights.superheroes.Batman")?.publish("Batman vs Superman")?;
//!
//! let (topic, payload) = subscription.next().unwrap()?;
//! ```

pub mod error;
pub mod exchange;
pub mod log;
pub mod storage;
pub mod subscription;
pub mod topic;
pub mod types;

// Re-exports
pub use error::{BrokerError, Result};
pub use exchange::{Exchange, TopicHandle};
pub use log::MessageLog;
pub use storage::{
    FileConnection, FileConnectionConfig, MemoryConnection, MessageFilter, MessageStream,
    StorageConnection,
};
pub use subscription::{Queue, Subscription, SubscriptionState};
pub use topic::{
    Hierarchy, HierarchyPattern, Predicate, Segment, TagSet, Topic, TopicPath, TopicPattern,
    TopicShape,
};
pub use types::*;
