//! Topic values and their canonical forms.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Separator between segments of a string topic.
pub const PATH_DELIMITER: char = '.';

/// The addressing scheme of a channel. Fixed when the channel is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicShape {
    /// Dotted string topics matched by regex.
    #[serde(rename = "string")]
    Path,
    /// Tag-set topics matched by containment.
    #[serde(rename = "tags")]
    Tags,
    /// Nested hierarchy topics matched structurally.
    #[serde(rename = "hierarchy")]
    Hierarchy,
}

impl fmt::Display for TopicShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicShape::Path => "string",
            TopicShape::Tags => "tags",
            TopicShape::Hierarchy => "hierarchy",
        };
        f.write_str(name)
    }
}

/// An ordered list of path segments, stored as dot-joined text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TopicPath {
    segments: Vec<String>,
}

impl TopicPath {
    /// Split dotted text into segments. Not validated until published.
    pub fn parse(text: &str) -> Self {
        Self {
            segments: text.split(PATH_DELIMITER).map(str::to_string).collect(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The dot-joined form that regex predicates run against.
    pub fn as_dotted(&self) -> String {
        self.segments.join(".")
    }

    fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(BrokerError::InvalidTopic("string topic has no segments".into()));
        }
        for segment in &self.segments {
            if segment.is_empty() {
                return Err(BrokerError::InvalidTopic(format!(
                    "empty segment in {:?}",
                    self.as_dotted()
                )));
            }
            if segment.contains(PATH_DELIMITER) {
                return Err(BrokerError::InvalidTopic(format!(
                    "segment {:?} contains the path delimiter",
                    segment
                )));
            }
        }
        Ok(())
    }
}

impl From<String> for TopicPath {
    fn from(text: String) -> Self {
        TopicPath::parse(&text)
    }
}

impl From<TopicPath> for String {
    fn from(path: TopicPath) -> Self {
        path.as_dotted()
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_dotted())
    }
}

/// A set of tags. Sorted and deduplicated, so insertion order never
/// changes the stored identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagSet(tags.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// Conjunctive containment: every requested tag is present.
    pub fn contains_all<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        tags.into_iter().all(|tag| self.0.contains(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(BrokerError::InvalidTopic("tag set is empty".into()));
        }
        if self.0.iter().any(String::is_empty) {
            return Err(BrokerError::InvalidTopic("tag set contains an empty tag".into()));
        }
        Ok(())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self.0.iter().map(|t| format!("#{}", t)).collect();
        f.write_str(&tags.join(" "))
    }
}

/// `category -> sub-category -> leaves`, a tree of depth 3.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hierarchy(BTreeMap<String, BTreeMap<String, BTreeSet<String>>>);

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Hierarchy::insert`] for a batch of leaves.
    pub fn with<I, S>(
        mut self,
        category: impl Into<String>,
        subcategory: impl Into<String>,
        leaves: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self
            .0
            .entry(category.into())
            .or_default()
            .entry(subcategory.into())
            .or_default();
        set.extend(leaves.into_iter().map(Into::into));
        self
    }

    pub fn insert(
        &mut self,
        category: impl Into<String>,
        subcategory: impl Into<String>,
        leaf: impl Into<String>,
    ) -> &mut Self {
        self.0
            .entry(category.into())
            .or_default()
            .entry(subcategory.into())
            .or_default()
            .insert(leaf.into());
        self
    }

    pub fn get(&self, category: &str) -> Option<&BTreeMap<String, BTreeSet<String>>> {
        self.0.get(category)
    }

    /// Nested lookup followed by a set-contains on the leaves.
    pub fn contains(&self, category: &str, subcategory: &str, leaf: &str) -> bool {
        self.0
            .get(category)
            .and_then(|subs| subs.get(subcategory))
            .is_some_and(|leaves| leaves.contains(leaf))
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every `(category, sub-category, leaf)` triple, in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.0.iter().flat_map(|(category, subs)| {
            subs.iter().flat_map(move |(sub, leaves)| {
                leaves
                    .iter()
                    .map(move |leaf| (category.as_str(), sub.as_str(), leaf.as_str()))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(BrokerError::InvalidTopic("hierarchy is empty".into()));
        }
        for (category, subs) in &self.0 {
            if category.is_empty() {
                return Err(BrokerError::InvalidTopic("empty category name".into()));
            }
            if subs.is_empty() {
                return Err(BrokerError::InvalidTopic(format!(
                    "category {:?} has no sub-categories",
                    category
                )));
            }
            for (sub, leaves) in subs {
                if sub.is_empty() {
                    return Err(BrokerError::InvalidTopic(format!(
                        "empty sub-category under {:?}",
                        category
                    )));
                }
                if leaves.is_empty() || leaves.iter().any(String::is_empty) {
                    return Err(BrokerError::InvalidTopic(format!(
                        "{}.{} needs at least one non-empty leaf",
                        category, sub
                    )));
                }
            }
        }
        Ok(())
    }
}

impl From<BTreeMap<String, BTreeMap<String, BTreeSet<String>>>> for Hierarchy {
    fn from(tree: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>) -> Self {
        Hierarchy(tree)
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (category, subs) in &self.0 {
            for (sub, leaves) in subs {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                let leaves: Vec<&str> = leaves.iter().map(String::as_str).collect();
                write!(f, "{}/{}: {}", category, sub, leaves.join(", "))?;
            }
        }
        Ok(())
    }
}

/// A message topic.
///
/// Serialized untagged, so the stored document carries a string, an array
/// of strings, or a nested map.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Topic {
    Path(TopicPath),
    Tags(TagSet),
    Hierarchy(Hierarchy),
}

impl Topic {
    /// String topic from dotted text.
    pub fn path(text: &str) -> Self {
        Topic::Path(TopicPath::parse(text))
    }

    /// Tag-set topic. Order and duplicates are irrelevant.
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Topic::Tags(TagSet::new(tags))
    }

    pub fn hierarchy(hierarchy: Hierarchy) -> Self {
        Topic::Hierarchy(hierarchy)
    }

    pub fn shape(&self) -> TopicShape {
        match self {
            Topic::Path(_) => TopicShape::Path,
            Topic::Tags(_) => TopicShape::Tags,
            Topic::Hierarchy(_) => TopicShape::Hierarchy,
        }
    }

    /// Check structural well-formedness (no empty names, no delimiter in
    /// path segments, at least one tag or leaf).
    pub fn validate(&self) -> Result<()> {
        match self {
            Topic::Path(path) => path.validate(),
            Topic::Tags(tags) => tags.validate(),
            Topic::Hierarchy(hierarchy) => hierarchy.validate(),
        }
    }

    /// Validate and check the topic conforms to a channel's shape.
    pub fn conform(&self, shape: TopicShape) -> Result<()> {
        if self.shape() != shape {
            return Err(BrokerError::InvalidTopic(format!(
                "{} topic published on a {} channel",
                self.shape(),
                shape
            )));
        }
        self.validate()
    }

    /// Canonical identity: equal for topics naming the same tags or tree
    /// regardless of construction order.
    pub fn identity(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&str> for Topic {
    fn from(text: &str) -> Self {
        Topic::path(text)
    }
}

impl From<String> for Topic {
    fn from(text: String) -> Self {
        Topic::path(&text)
    }
}

impl From<TopicPath> for Topic {
    fn from(path: TopicPath) -> Self {
        Topic::Path(path)
    }
}

impl From<TagSet> for Topic {
    fn from(tags: TagSet) -> Self {
        Topic::Tags(tags)
    }
}

impl From<Hierarchy> for Topic {
    fn from(hierarchy: Hierarchy) -> Self {
        Topic::Hierarchy(hierarchy)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Path(path) => fmt::Display::fmt(path, f),
            Topic::Tags(tags) => fmt::Display::fmt(tags, f),
            Topic::Hierarchy(hierarchy) => fmt::Display::fmt(hierarchy, f),
        }
    }
}
