//! Subscriptions: predicate-filtered live views over a channel's log.
//!
//! A [`Queue`] fixes a starting cursor and a predicate; nothing is read
//! until [`Queue::subscribe`] opens a [`Subscription`]:
//!
//! ```text
//! Created -> Subscribing -> { Delivering <-> Waiting } -> Closed
//! ```
//!
//! Delivery is an order-preserving filter of the log from the cursor on.
//! Waiting blocks on a channel receive; nothing spins. Closing or dropping
//! the subscription releases its storage stream.
//!
//! # Example
//!
//! ```ignore
//! let queue = exchange.queue(Predicate::pattern(r"^fights\.(.+)\.Batman$")?)?;
//!
//! for item in queue.subscribe()? {
//!     let (topic, payload) = item?;
//!     println!("Received on {}: {}", topic, payload);
//! }
//! ```

mod queue;

pub use queue::{Queue, Subscription, SubscriptionState};
