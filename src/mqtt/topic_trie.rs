use std::collections::HashMap;

use super::BrokerError;

/// Checks a subscription filter: `+` and `#` must fill a whole level and
/// `#` may only be the last level.
pub fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.is_empty() {
        return Err(BrokerError::InvalidTopic(pattern.to_string(), "empty filter"));
    }
    let levels: Vec<&str> = pattern.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(BrokerError::InvalidTopic(pattern.to_string(), "'#' must be the last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(BrokerError::InvalidTopic(pattern.to_string(), "'+' must fill a whole level"));
        }
    }
    Ok(())
}

/// Checks a publish topic: no wildcards, not empty.
pub fn validate_topic(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() {
        return Err(BrokerError::InvalidTopic(topic.to_string(), "empty topic"));
    }
    if topic.contains(['+', '#']) {
        return Err(BrokerError::InvalidTopic(topic.to_string(), "wildcards are not allowed in topics"));
    }
    Ok(())
}

#[derive(Debug)]
struct Entry<H> {
    seq: u64,
    handler: H,
}

#[derive(Debug)]
struct Node<H> {
    children: HashMap<String, Node<H>>,
    entries: Vec<Entry<H>>,
}

impl<H> Node<H> {
    fn new() -> Self {
        return Node { children: HashMap::new(), entries: Vec::new() };
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.children.is_empty()
    }
}

/// Subscription filters keyed by level. Matching returns the handlers of
/// every matching filter in the order they were inserted.
#[derive(Debug)]
pub struct TopicTrie<H> {
    root: Node<H>,
    next_seq: u64,
}

impl<H: Clone> TopicTrie<H> {
    pub fn new() -> Self {
        return TopicTrie { root: Node::new(), next_seq: 0 };
    }

    pub fn insert(&mut self, pattern: &str, handler: H) -> Result<(), BrokerError> {
        validate_pattern(pattern)?;

        let mut node = &mut self.root;
        for level in pattern.split('/') {
            node = node.children.entry(level.to_string()).or_insert_with(Node::new);
        }
        node.entries.push(Entry { seq: self.next_seq, handler });
        self.next_seq += 1;
        Ok(())
    }

    /// Drops every handler of `pattern`, returns how many were removed.
    pub fn remove(&mut self, pattern: &str) -> usize {
        let levels: Vec<&str> = pattern.split('/').collect();
        Self::remove_at(&mut self.root, &levels)
    }

    fn remove_at(node: &mut Node<H>, levels: &[&str]) -> usize {
        let Some((first, rest)) = levels.split_first() else {
            let removed = node.entries.len();
            node.entries.clear();
            return removed;
        };

        let Some(child) = node.children.get_mut(*first) else {
            return 0;
        };
        let removed = Self::remove_at(child, rest);
        if child.is_empty() {
            node.children.remove(*first);
        }
        removed
    }

    pub fn matches(&self, topic: &str) -> Vec<H> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut found: Vec<&Entry<H>> = Vec::new();
        Self::collect(&self.root, &levels, true, &mut found);
        found.sort_by_key(|e| e.seq);
        found.into_iter().map(|e| e.handler.clone()).collect()
    }

    fn collect<'a>(node: &'a Node<H>, levels: &[&str], top: bool, found: &mut Vec<&'a Entry<H>>) {
        /* Wildcards at the first level never match $SYS style topics */
        let hidden = top && levels.first().map_or(false, |l| l.starts_with('$'));

        if let Some(multi) = node.children.get("#") {
            if !hidden {
                found.extend(multi.entries.iter());
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            found.extend(node.entries.iter());
            return;
        };

        if let Some(child) = node.children.get(*first) {
            Self::collect(child, rest, false, found);
        }
        if let Some(single) = node.children.get("+") {
            if !hidden {
                Self::collect(single, rest, false, found);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_dispatch_order() {
        let mut trie = TopicTrie::new();
        trie.insert("a/+/c", "X").unwrap();
        trie.insert("a/b/#", "Y").unwrap();
        trie.insert("a/b/d", "Z").unwrap();

        assert_eq!(trie.matches("a/b/c"), vec!["X", "Y"]);
        assert_eq!(trie.matches("a/b/d"), vec!["Y", "Z"]);
        assert_eq!(trie.matches("a/x/c"), vec!["X"]);
        assert!(trie.matches("b/b/c").is_empty());
    }

    #[test]
    fn test_registration_order_across_patterns() {
        let mut trie = TopicTrie::new();
        trie.insert("a/b/#", 1).unwrap();
        trie.insert("a/+/c", 2).unwrap();
        trie.insert("a/b/#", 3).unwrap();
        assert_eq!(trie.matches("a/b/c"), vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_level_matches_parent() {
        let mut trie = TopicTrie::new();
        trie.insert("sport/tennis/#", 1).unwrap();
        trie.insert("#", 2).unwrap();
        assert_eq!(trie.matches("sport/tennis"), vec![1, 2]);
        assert_eq!(trie.matches("sport/tennis/player1/ranking"), vec![1, 2]);
        assert_eq!(trie.matches("sport"), vec![2]);
    }

    #[test]
    fn test_single_level_does_not_span_levels() {
        let mut trie = TopicTrie::new();
        trie.insert("sensors/+/temp", 1).unwrap();
        assert_eq!(trie.matches("sensors/kitchen/temp"), vec![1]);
        assert!(trie.matches("sensors/kitchen/left/temp").is_empty());
        assert!(trie.matches("sensors/temp").is_empty());
        assert_eq!(trie.matches("sensors//temp"), vec![1]);
    }

    #[test]
    fn test_system_topics_hidden_from_leading_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1).unwrap();
        trie.insert("+/broker/uptime", 2).unwrap();
        trie.insert("$SYS/#", 3).unwrap();
        assert_eq!(trie.matches("$SYS/broker/uptime"), vec![3]);
    }

    #[test]
    fn test_remove_pattern() {
        let mut trie = TopicTrie::new();
        trie.insert("a/+/c", 1).unwrap();
        trie.insert("a/+/c", 2).unwrap();
        trie.insert("a/b/c", 3).unwrap();
        assert_eq!(trie.remove("a/+/c"), 2);
        assert_eq!(trie.remove("a/+/c"), 0);
        assert_eq!(trie.matches("a/b/c"), vec![3]);
        assert_eq!(trie.remove("a/b/c"), 1);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_pattern_validation() {
        assert!(validate_pattern("a/+/c").is_ok());
        assert!(validate_pattern("#").is_ok());
        assert!(validate_pattern("a/#").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("a/#/c").is_err());
        assert!(validate_pattern("a/b#").is_err());
        assert!(validate_pattern("a/b+/c").is_err());
        assert!(validate_topic("a/b/c").is_ok());
        assert!(validate_topic("a/+/c").is_err());
        assert!(validate_topic("").is_err());
    }
}
