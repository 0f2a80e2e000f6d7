//! # Topic Trie Cache
//!
//! A bounded store indexed by topic path. Each trie node owns its children and
//! a FIFO list of values; when a node's list grows past the cache bound the
//! oldest value is dropped. Eviction is per node, there is no global ordering
//! across topics.
//!
//! The broker runs two instances: one for published content and one for
//! subscriber records, which are kept on the main-topic node.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::topic::{self, Pattern, Wildcard};

/// Per-node bound of the content cache.
pub const DEFAULT_CONTENT_BOUND: usize = 8;

/// Per-node bound of the subscriber cache.
pub const DEFAULT_SUBSCRIBER_BOUND: usize = 250_000;


#[derive(Debug, Clone)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    values: VecDeque<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            values: VecDeque::new(),
        }
    }
}

impl<T: Clone> Node<T> {
    /// Depth-first walk collecting every node below `self`.
    fn collect(&self, path: &mut Vec<String>, out: &mut BTreeMap<String, Vec<T>>) {
        for (segment, child) in &self.children {
            path.push(segment.clone());
            if !child.values.is_empty() {
                out.insert(path.join("/"), child.values.iter().cloned().collect());
            }
            child.collect(path, out);
            path.pop();
        }
    }
}


#[derive(Debug, Clone)]
pub struct TopicCache<T> {
    root: Node<T>,
    bound: usize,
}

impl<T: Clone> TopicCache<T> {
    pub fn new(bound: usize) -> Self {
        Self {
            root: Node::default(),
            bound: bound.max(1),
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Store `value` at `path`, creating intermediate nodes as needed.
    ///
    /// `None` only creates the node, which marks the topic as known before any
    /// content arrives. Paths containing a wildcard segment are refused and
    /// `false` is returned.
    pub fn put(&mut self, path: &str, value: Option<T>) -> bool {
        let segs = topic::segments(path);
        if segs.is_empty() || segs.iter().any(|s| topic::is_wildcard(s)) {
            return false;
        }

        let mut node = &mut self.root;
        for seg in segs {
            node = node.children.entry(seg.to_string()).or_default();
        }
        if let Some(value) = value {
            node.values.push_back(value);
            while node.values.len() > self.bound {
                node.values.pop_front();
            }
        }
        true
    }

    /// Values stored exactly at `path`, oldest first.
    pub fn get(&self, path: &str) -> Vec<T> {
        self.node(path)
            .map(|n| n.values.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut VecDeque<T>> {
        let mut node = &mut self.root;
        for seg in topic::segments(path) {
            node = node.children.get_mut(seg)?;
        }
        Some(&mut node.values)
    }

    /// Resolve a pattern into concrete paths and their values.
    ///
    /// Without a wildcard this is [`get`](Self::get) keyed by the normalised
    /// path. With `*` every descendant of the prefix node is returned, with
    /// `**` the prefix node's own values are included as well. Empty lists are
    /// pruned from wildcard results. Patterns with more than one wildcard, or
    /// a wildcard before the last segment, yield an empty map.
    pub fn get_matching(&self, pattern: &str) -> BTreeMap<String, Vec<T>> {
        let mut out = BTreeMap::new();
        let Ok(pattern) = Pattern::parse(pattern) else {
            return out;
        };

        let prefix = pattern.prefix().join("/");
        let Some(wildcard) = pattern.wildcard() else {
            out.insert(prefix.clone(), self.get(&prefix));
            return out;
        };

        let Some(start) = self.node(&prefix) else {
            return out;
        };
        if wildcard == Wildcard::Subtree && !start.values.is_empty() {
            out.insert(prefix.clone(), start.values.iter().cloned().collect());
        }
        let mut path: Vec<String> = pattern.prefix().to_vec();
        start.collect(&mut path, &mut out);
        out
    }

    /// Remove the first value equal to `value` from the main-topic node.
    pub fn remove_one(&mut self, main_topic: &str, value: &T) -> bool
    where
        T: PartialEq,
    {
        let Some(node) = self.root.children.get_mut(main_topic) else {
            return false;
        };
        match node.values.iter().position(|v| v == value) {
            Some(idx) => {
                node.values.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn list_top_level_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.root.children.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn has_top_level(&self, main_topic: &str) -> bool {
        self.root.children.contains_key(main_topic)
    }

    fn node(&self, path: &str) -> Option<&Node<T>> {
        let mut node = &self.root;
        for seg in topic::segments(path) {
            node = node.children.get(seg)?;
        }
        Some(node)
    }
}
