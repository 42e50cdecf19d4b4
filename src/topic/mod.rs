//! Topic model: the addressing value attached to every message.
//!
//! A channel carries exactly one of three topic shapes:
//! - **String** topics: dotted paths such as `fights.superheroes.Batman`,
//!   matched by regular expression
//! - **Tag-set** topics: unordered tag sets, matched by containment
//! - **Hierarchy** topics: `category -> sub-category -> leaves`, matched
//!   structurally
//!
//! Predicates are plain data ([`Predicate`]) evaluated by an interpreter, so
//! the same value can be checked on the publishing side, pushed into
//! storage, or logged.

mod predicate;
mod value;

pub use predicate::{HierarchyPattern, Predicate, Segment, TopicPattern};
pub use value::{Hierarchy, TagSet, Topic, TopicPath, TopicShape, PATH_DELIMITER};
