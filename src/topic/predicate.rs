//! Predicates over topics.
//!
//! Each predicate targets one topic shape. Shape compatibility is checked
//! when a predicate is composed or attached to a channel, never while
//! matching.

use super::value::{Hierarchy, TagSet, Topic, TopicShape};
use crate::error::{BrokerError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// A compiled regex tested against the dot-joined form of a string topic.
///
/// Matching is a search, not a full match: anchor with `^...$` to pin the
/// whole path.
#[derive(Clone, Debug)]
pub struct TopicPattern(Regex);

impl TopicPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(TopicPattern(Regex::new(pattern)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, dotted: &str) -> bool {
        self.0.is_match(dotted)
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TopicPattern {}

/// One level of a hierarchy pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Any name at this level.
    Any,
    /// Exactly this name.
    Exact(String),
}

impl Segment {
    fn accepts(&self, name: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(expected) => expected == name,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Any => f.write_str("*"),
            Segment::Exact(name) => write!(f, "'{}'", name),
        }
    }
}

impl From<&str> for Segment {
    fn from(name: &str) -> Self {
        Segment::Exact(name.to_string())
    }
}

impl From<String> for Segment {
    fn from(name: String) -> Self {
        Segment::Exact(name)
    }
}

/// Structural containment over `category -> sub-category -> leaf`.
///
/// Matches when at least one path in the topic satisfies all three levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HierarchyPattern {
    pub category: Segment,
    pub subcategory: Segment,
    pub leaf: Segment,
}

impl HierarchyPattern {
    /// Every level a wildcard.
    pub fn any() -> Self {
        Self {
            category: Segment::Any,
            subcategory: Segment::Any,
            leaf: Segment::Any,
        }
    }

    /// `topic[category][subcategory].contains(leaf)`.
    pub fn exact(
        category: impl Into<String>,
        subcategory: impl Into<String>,
        leaf: impl Into<String>,
    ) -> Self {
        Self {
            category: Segment::Exact(category.into()),
            subcategory: Segment::Exact(subcategory.into()),
            leaf: Segment::Exact(leaf.into()),
        }
    }

    pub fn category(mut self, segment: impl Into<Segment>) -> Self {
        self.category = segment.into();
        self
    }

    pub fn subcategory(mut self, segment: impl Into<Segment>) -> Self {
        self.subcategory = segment.into();
        self
    }

    pub fn leaf(mut self, segment: impl Into<Segment>) -> Self {
        self.leaf = segment.into();
        self
    }

    pub fn matches(&self, hierarchy: &Hierarchy) -> bool {
        // All-exact patterns are a direct lookup.
        if let (Segment::Exact(c), Segment::Exact(s), Segment::Exact(l)) =
            (&self.category, &self.subcategory, &self.leaf)
        {
            return hierarchy.contains(c, s, l);
        }
        hierarchy.paths().any(|(c, s, l)| {
            self.category.accepts(c) && self.subcategory.accepts(s) && self.leaf.accepts(l)
        })
    }
}

impl fmt::Display for HierarchyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}].contains({})",
            self.category, self.subcategory, self.leaf
        )
    }
}

/// A pure boolean function over a topic, as data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Matches every topic of any shape.
    Always,
    /// Regex over a string topic.
    Pattern(TopicPattern),
    /// Tag set contains every listed tag.
    ContainsTags(BTreeSet<String>),
    /// Structural match over a hierarchy topic.
    Hierarchy(HierarchyPattern),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::Always
    }

    /// Compile a regex predicate. Fails with `InvalidPattern`.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Predicate::Pattern(TopicPattern::new(pattern)?))
    }

    /// Conjunctive tag containment. An empty list matches every tag set.
    pub fn contains_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::ContainsTags(tags.into_iter().map(Into::into).collect())
    }

    pub fn hierarchy(pattern: HierarchyPattern) -> Self {
        Predicate::Hierarchy(pattern)
    }

    /// All of `predicates` must match. They must agree on shape.
    pub fn all_of(predicates: Vec<Predicate>) -> Result<Self> {
        common_shape(&predicates)?;
        Ok(Predicate::And(predicates))
    }

    /// Any of `predicates` must match. They must agree on shape.
    pub fn any_of(predicates: Vec<Predicate>) -> Result<Self> {
        common_shape(&predicates)?;
        Ok(Predicate::Or(predicates))
    }

    pub fn and(self, other: Predicate) -> Result<Self> {
        Predicate::all_of(vec![self, other])
    }

    pub fn or(self, other: Predicate) -> Result<Self> {
        Predicate::any_of(vec![self, other])
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// The topic shape this predicate reads, or `None` if it reads none.
    pub fn shape(&self) -> Option<TopicShape> {
        match self {
            Predicate::Always => None,
            Predicate::Pattern(_) => Some(TopicShape::Path),
            Predicate::ContainsTags(_) => Some(TopicShape::Tags),
            Predicate::Hierarchy(_) => Some(TopicShape::Hierarchy),
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().find_map(Predicate::shape)
            }
            Predicate::Not(inner) => inner.shape(),
        }
    }

    /// Fail with `ShapeMismatch` unless every leaf of the predicate can run
    /// on `shape`.
    pub fn check_shape(&self, shape: TopicShape) -> Result<()> {
        match self {
            Predicate::Always => Ok(()),
            Predicate::And(children) | Predicate::Or(children) => children
                .iter()
                .try_for_each(|child| child.check_shape(shape)),
            Predicate::Not(inner) => inner.check_shape(shape),
            leaf => match leaf.shape() {
                Some(got) if got != shape => Err(BrokerError::ShapeMismatch {
                    expected: shape,
                    got,
                }),
                _ => Ok(()),
            },
        }
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        match (self, topic) {
            (Predicate::Always, _) => true,
            (Predicate::Pattern(pattern), Topic::Path(path)) => {
                pattern.is_match(&path.as_dotted())
            }
            (Predicate::ContainsTags(wanted), Topic::Tags(tags)) => tags_contain(tags, wanted),
            (Predicate::Hierarchy(pattern), Topic::Hierarchy(tree)) => pattern.matches(tree),
            (Predicate::And(children), _) => children.iter().all(|p| p.matches(topic)),
            (Predicate::Or(children), _) => children.iter().any(|p| p.matches(topic)),
            (Predicate::Not(inner), _) => !inner.matches(topic),
            _ => false,
        }
    }
}

fn tags_contain(tags: &TagSet, wanted: &BTreeSet<String>) -> bool {
    tags.contains_all(wanted)
}

fn common_shape(predicates: &[Predicate]) -> Result<Option<TopicShape>> {
    let mut shape: Option<TopicShape> = None;
    for predicate in predicates {
        if let Some(got) = predicate.shape() {
            predicate.check_shape(got)?;
        }
        match (shape, predicate.shape()) {
            (Some(expected), Some(got)) if expected != got => {
                return Err(BrokerError::ShapeMismatch { expected, got });
            }
            (None, Some(got)) => shape = Some(got),
            _ => {}
        }
    }
    Ok(shape)
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => f.write_str("*"),
            Predicate::Pattern(pattern) => write!(f, "/{}/", pattern.as_str()),
            Predicate::ContainsTags(tags) => {
                let tags: Vec<String> = tags.iter().map(|t| format!("#{}", t)).collect();
                write!(f, "contains({})", tags.join(" "))
            }
            Predicate::Hierarchy(pattern) => fmt::Display::fmt(pattern, f),
            Predicate::And(children) | Predicate::Or(children) => {
                let joiner = if matches!(self, Predicate::And(_)) {
                    " && "
                } else {
                    " || "
                };
                let parts: Vec<String> = children.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
            Predicate::Not(inner) => write!(f, "!{}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_matches_dotted_path() {
        let topic = Topic::path("fights.superheroes.Batman");

        let hit = Predicate::pattern(r"^fights\.(.+)\.Batman$").unwrap();
        assert!(hit.matches(&topic));

        let miss = Predicate::pattern(r"^events\..*$").unwrap();
        assert!(!miss.matches(&topic));

        let wide = Predicate::pattern(r"^(.+)\.(.+)$").unwrap();
        assert!(wide.matches(&topic));
    }

    #[test]
    fn test_invalid_regex() {
        let result = Predicate::pattern("fights.(");
        assert!(matches!(result, Err(BrokerError::InvalidPattern(_))));
    }

    #[test]
    fn test_tag_containment_is_conjunctive() {
        let topic = Topic::tags(["teamups", "superheroes"]);

        assert!(Predicate::contains_tags(["superheroes"]).matches(&topic));
        assert!(Predicate::contains_tags(["superheroes", "teamups"]).matches(&topic));
        assert!(!Predicate::contains_tags(["fights"]).matches(&topic));
        assert!(!Predicate::contains_tags(["superheroes", "fights"]).matches(&topic));
        assert!(Predicate::contains_tags(Vec::<String>::new()).matches(&topic));
    }

    #[test]
    fn test_hierarchy_exact() {
        let topic = Topic::hierarchy(
            Hierarchy::new().with("teamups", "superheroes", ["Batman", "Superman"]),
        );

        let hit = Predicate::hierarchy(HierarchyPattern::exact("teamups", "superheroes", "Batman"));
        assert!(hit.matches(&topic));

        let miss = Predicate::hierarchy(HierarchyPattern::exact("teamups", "sidekicks", "Batman"));
        assert!(!miss.matches(&topic));
    }

    #[test]
    fn test_hierarchy_wildcards() {
        let topic = Topic::hierarchy(
            Hierarchy::new()
                .with("fights", "supervillains", ["Joker"])
                .with("events", "sidekicks", ["Robin"]),
        );

        let any_category = HierarchyPattern::any().subcategory("sidekicks").leaf("Robin");
        assert!(Predicate::hierarchy(any_category).matches(&topic));

        let any_leaf = HierarchyPattern::any().category("fights").subcategory("supervillains");
        assert!(Predicate::hierarchy(any_leaf).matches(&topic));

        // Levels must line up on the same path.
        let crossed = HierarchyPattern::any().category("fights").leaf("Robin");
        assert!(!Predicate::hierarchy(crossed).matches(&topic));
    }

    #[test]
    fn test_shape_checks() {
        let tags = Predicate::contains_tags(["a"]);
        assert!(tags.check_shape(TopicShape::Tags).is_ok());
        assert!(matches!(
            tags.check_shape(TopicShape::Path),
            Err(BrokerError::ShapeMismatch {
                expected: TopicShape::Path,
                got: TopicShape::Tags
            })
        ));
        assert!(Predicate::always().check_shape(TopicShape::Hierarchy).is_ok());
    }

    #[test]
    fn test_composition() {
        let topic = Topic::tags(["fights", "superheroes"]);

        let both = Predicate::contains_tags(["fights"])
            .and(Predicate::contains_tags(["superheroes"]))
            .unwrap();
        assert!(both.matches(&topic));

        let not_villains = Predicate::contains_tags(["supervillains"]).negate();
        assert!(not_villains.matches(&topic));

        let either = Predicate::contains_tags(["events"])
            .or(Predicate::contains_tags(["fights"]))
            .unwrap();
        assert!(either.matches(&topic));
        assert_eq!(either.shape(), Some(TopicShape::Tags));
    }

    #[test]
    fn test_mixed_shape_composition_fails() {
        let result = Predicate::pattern("^a$")
            .unwrap()
            .and(Predicate::contains_tags(["a"]));
        assert!(matches!(result, Err(BrokerError::ShapeMismatch { .. })));

        // Shape-agnostic members compose with anything.
        assert!(Predicate::always().and(Predicate::contains_tags(["a"])).is_ok());
    }

    #[test]
    fn test_shape_check_walks_nested_variants() {
        let mixed = Predicate::And(vec![
            Predicate::pattern("^fights").unwrap(),
            Predicate::contains_tags(["superheroes"]),
        ]);
        assert!(matches!(
            mixed.check_shape(TopicShape::Path),
            Err(BrokerError::ShapeMismatch {
                expected: TopicShape::Path,
                got: TopicShape::Tags
            })
        ));

        let nested = Predicate::Not(Box::new(Predicate::Or(vec![
            Predicate::always(),
            Predicate::hierarchy(HierarchyPattern::any()),
        ])));
        assert!(nested.check_shape(TopicShape::Path).is_err());
        assert!(nested.check_shape(TopicShape::Hierarchy).is_ok());

        // A mixed subtree is rejected when composed as well.
        let result = Predicate::any_of(vec![mixed, Predicate::pattern("x").unwrap()]);
        assert!(matches!(result, Err(BrokerError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_other_shape_never_matches() {
        let predicate = Predicate::contains_tags(["Batman"]);
        assert!(!predicate.matches(&Topic::path("fights.superheroes.Batman")));
    }

    #[test]
    fn test_display() {
        let p = Predicate::hierarchy(HierarchyPattern::exact("teamups", "superheroes", "Batman"));
        assert_eq!(p.to_string(), "['teamups']['superheroes'].contains('Batman')");
        assert_eq!(
            Predicate::contains_tags(["b", "a"]).to_string(),
            "contains(#a #b)"
        );
    }
}
