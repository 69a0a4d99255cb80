//! Topic-prefix subscription set.

use bytes::Bytes;
use std::collections::BTreeSet;

/// Set of topic prefixes a subscriber has asked for.
///
/// An empty prefix matches every topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    topics: BTreeSet<Bytes>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prefix. Returns `false` if it was already present.
    pub fn subscribe(&mut self, topic: impl Into<Bytes>) -> bool {
        self.topics.insert(topic.into())
    }

    /// Remove a prefix. Returns `false` if it was not present.
    pub fn cancel(&mut self, topic: &[u8]) -> bool {
        self.topics.remove(topic)
    }

    /// Whether `topic` starts with any subscribed prefix.
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.topics.iter().any(|prefix| topic.starts_with(prefix))
    }

    pub fn contains(&self, topic: &[u8]) -> bool {
        self.topics.contains(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &Bytes> {
        self.topics.iter()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        let mut subs = SubscriptionSet::new();
        assert!(!subs.matches(b"A"));

        assert!(subs.subscribe(Bytes::from_static(b"A")));
        assert!(subs.matches(b"A"));
        assert!(subs.matches(b"AB"));
        assert!(!subs.matches(b"B"));
    }

    #[test]
    fn test_empty_prefix_matches_all() {
        let mut subs = SubscriptionSet::new();
        subs.subscribe(Bytes::new());
        assert!(subs.matches(b""));
        assert!(subs.matches(b"anything"));
    }

    #[test]
    fn test_subscribe_cancel() {
        let mut subs = SubscriptionSet::new();
        assert!(subs.subscribe(Bytes::from_static(b"x")));
        assert!(!subs.subscribe(Bytes::from_static(b"x")));
        assert_eq!(subs.len(), 1);
        assert!(subs.cancel(b"x"));
        assert!(!subs.cancel(b"x"));
        assert!(subs.is_empty());
    }
}
