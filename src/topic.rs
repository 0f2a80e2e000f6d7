//! # Topic Paths and Patterns
//!
//! Topics are `/`-delimited paths whose first segment is the *main topic*,
//! the unit of ownership. Repeated or leading separators collapse, so
//! `"a//b/"` and `"a/b"` name the same node.
//!
//! Subscription patterns may end in one wildcard segment:
//!
//! - `a/*` matches every topic strictly below `a`
//! - `a/**` matches `a` itself and every topic below it
//!
//! Publish paths never contain `*`.

use std::fmt;

pub const SEPARATOR: char = '/';
pub const DESCENDANTS: &str = "*";
pub const SUBTREE: &str = "**";

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty()).collect()
}

pub fn normalize(path: &str) -> String {
    segments(path).join("/")
}

/// First segment of a path, if any.
pub fn main_topic(path: &str) -> Option<&str> {
    path.split(SEPARATOR).find(|s| !s.is_empty())
}

pub fn is_wildcard(segment: &str) -> bool {
    segment == DESCENDANTS || segment == SUBTREE
}


/// Why a topic or pattern was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRejection {
    /// No segments at all.
    Empty,
    /// A subscription without a concrete main topic, e.g. `*` or `/**`.
    MissingMainTopic,
    /// A publish path containing `*`.
    WildcardInPublish,
    /// A wildcard somewhere other than the final segment, or a segment that
    /// mixes `*` with other characters.
    MisplacedWildcard,
}

impl fmt::Display for TopicRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic is empty"),
            Self::MissingMainTopic => write!(f, "pattern has no main topic"),
            Self::WildcardInPublish => write!(f, "publish topics may not contain wildcards"),
            Self::MisplacedWildcard => write!(f, "wildcards are only allowed as the final segment"),
        }
    }
}

impl std::error::Error for TopicRejection {}


/// Validate a publish path and return its normalised form.
pub fn validate_publish(topic: &str) -> Result<String, TopicRejection> {
    if topic.contains('*') {
        return Err(TopicRejection::WildcardInPublish);
    }
    let normalized = normalize(topic);
    if normalized.is_empty() {
        return Err(TopicRejection::Empty);
    }
    Ok(normalized)
}

/// Parse a subscription pattern; unlike [`Pattern::parse`] this requires a
/// concrete main topic.
pub fn validate_subscribe(pattern: &str) -> Result<Pattern, TopicRejection> {
    let parsed = Pattern::parse(pattern)?;
    if parsed.main_topic().is_none() {
        return Err(TopicRejection::MissingMainTopic);
    }
    Ok(parsed)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wildcard {
    /// `*`: strict descendants of the prefix.
    Descendants,
    /// `**`: the prefix node and all its descendants.
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    prefix: Vec<String>,
    wildcard: Option<Wildcard>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicRejection> {
        let segs = segments(pattern);
        let Some((last, init)) = segs.split_last() else {
            return Err(TopicRejection::Empty);
        };
        if init.iter().any(|s| s.contains('*')) {
            return Err(TopicRejection::MisplacedWildcard);
        }

        let wildcard = match *last {
            DESCENDANTS => Some(Wildcard::Descendants),
            SUBTREE => Some(Wildcard::Subtree),
            s if s.contains('*') => return Err(TopicRejection::MisplacedWildcard),
            _ => None,
        };

        let mut prefix: Vec<String> = init.iter().map(|s| s.to_string()).collect();
        if wildcard.is_none() {
            prefix.push(last.to_string());
        }
        Ok(Self { prefix, wildcard })
    }

    /// Concrete segments before any wildcard.
    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    pub fn wildcard(&self) -> Option<Wildcard> {
        self.wildcard
    }

    pub fn main_topic(&self) -> Option<&str> {
        self.prefix.first().map(String::as_str)
    }

    /// Whether `topic` falls under this pattern. Segments of `topic` are
    /// compared literally, so a stored pattern such as `a/*` can itself be
    /// matched by `a/**`.
    pub fn matches(&self, topic: &str) -> bool {
        self.matches_segments(&segments(topic))
    }

    pub fn matches_segments(&self, topic: &[&str]) -> bool {
        let has_prefix = topic.len() >= self.prefix.len()
            && self.prefix.iter().zip(topic).all(|(p, t)| p == t);
        if !has_prefix {
            return false;
        }
        match self.wildcard {
            None => topic.len() == self.prefix.len(),
            Some(Wildcard::Descendants) => topic.len() > self.prefix.len(),
            Some(Wildcard::Subtree) => true,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = match self.wildcard {
            None => None,
            Some(Wildcard::Descendants) => Some(DESCENDANTS),
            Some(Wildcard::Subtree) => Some(SUBTREE),
        };
        let parts: Vec<&str> = self.prefix.iter().map(String::as_str).chain(tail).collect();
        write!(f, "{}", parts.join("/"))
    }
}
