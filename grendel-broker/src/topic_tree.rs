//! Wildcard-capable subscription index.
//!
//! A trie keyed by topic level. Subscribers attach at the node their
//! filter ends on; matching walks literal, `+`, and `#` children. The
//! whole tree sits behind one `RwLock`: writes are rare and O(levels),
//! reads never observe a partially inserted branch.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use smallvec::SmallVec;

use grendel_core::{topic, QoS};

#[derive(Debug)]
struct TreeNode<K, V> {
    subscribers: HashMap<K, V>,
    children: HashMap<String, TreeNode<K, V>>,
}

impl<K, V> TreeNode<K, V> {
    fn new() -> Self {
        TreeNode {
            subscribers: HashMap::new(),
            children: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }
}

/// Trie from topic filters to subscriber entries.
///
/// `K` identifies the subscriber (client id, or `(username, rule id)` for
/// ACL indexes); `V` is the attached payload (QoS, rule reference).
#[derive(Debug)]
pub struct TopicTree<K, V> {
    root: RwLock<TreeNode<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for TopicTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> TopicTree<K, V> {
    pub fn new() -> Self {
        TopicTree {
            root: RwLock::new(TreeNode::new()),
        }
    }

    /// Attach a subscriber at the filter's node. A repeated insert for the
    /// same `(filter, key)` replaces the value (latest QoS wins).
    pub fn insert(&self, filter: &str, key: K, value: V) {
        let mut root = self.root.write().expect("topic tree lock poisoned");
        let mut node = &mut *root;

        for level in filter.split('/') {
            node = node
                .children
                .entry(level.to_string())
                .or_insert_with(TreeNode::new);
        }

        node.subscribers.insert(key, value);
    }

    /// Detach a subscriber from a filter; prunes branches left empty.
    /// Returns whether an entry was removed.
    pub fn remove(&self, filter: &str, key: &K) -> bool {
        let mut root = self.root.write().expect("topic tree lock poisoned");
        let levels: Vec<&str> = filter.split('/').collect();
        Self::remove_rec(&mut root, &levels, key)
    }

    fn remove_rec(node: &mut TreeNode<K, V>, levels: &[&str], key: &K) -> bool {
        match levels.split_first() {
            None => node.subscribers.remove(key).is_some(),
            Some((level, rest)) => {
                let Some(child) = node.children.get_mut(*level) else {
                    return false;
                };
                let removed = Self::remove_rec(child, rest, key);
                if child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// All subscriber entries whose filter matches the topic. A key that
    /// matches through several filters appears once per filter; use
    /// [`TopicTree::match_clients`] where highest-value dedup is wanted.
    pub fn matches(&self, topic_name: &str) -> Vec<(K, V)> {
        let root = self.root.read().expect("topic tree lock poisoned");
        let levels: SmallVec<[&str; 8]> = topic_name.split('/').collect();
        let target_depth = levels.len();

        let mut out = Vec::new();
        let mut stack: SmallVec<[(&TreeNode<K, V>, usize); 8]> = SmallVec::new();
        stack.push((&*root, 0));

        while let Some((node, depth)) = stack.pop() {
            if depth == target_depth {
                for (key, value) in &node.subscribers {
                    out.push((key.clone(), value.clone()));
                }
                // A `#` child also covers "zero remaining levels".
                if let Some(hash) = node.children.get(topic::WILDCARD_MULTI) {
                    for (key, value) in &hash.subscribers {
                        out.push((key.clone(), value.clone()));
                    }
                }
                continue;
            }

            let level = levels[depth];

            if let Some(child) = node.children.get(level) {
                stack.push((child, depth + 1));
            }
            if let Some(child) = node.children.get(topic::WILDCARD_SINGLE) {
                stack.push((child, depth + 1));
            }
            if let Some(child) = node.children.get(topic::WILDCARD_MULTI) {
                for (key, value) in &child.subscribers {
                    out.push((key.clone(), value.clone()));
                }
            }
        }

        out
    }

    /// Enumerate every stored `(filter, key, value)`.
    pub fn iter_entries(&self) -> Vec<(String, K, V)> {
        let root = self.root.read().expect("topic tree lock poisoned");
        let mut out = Vec::new();
        Self::collect(&root, &mut Vec::new(), &mut out);
        out
    }

    fn collect(node: &TreeNode<K, V>, path: &mut Vec<String>, out: &mut Vec<(String, K, V)>) {
        for (key, value) in &node.subscribers {
            out.push((path.join("/"), key.clone(), value.clone()));
        }
        for (level, child) in &node.children {
            path.push(level.clone());
            Self::collect(child, path, out);
            path.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().expect("topic tree lock poisoned").is_empty()
    }
}

/// The broker's subscription index: client id to subscription QoS.
pub type SubscriptionTree = TopicTree<String, QoS>;

impl SubscriptionTree {
    /// Matching clients, deduplicated: overlapping filters from the same
    /// client collapse to one delivery at the highest granted QoS.
    pub fn match_clients(&self, topic_name: &str) -> Vec<(String, QoS)> {
        let mut best: HashMap<String, QoS> = HashMap::new();
        for (client, qos) in self.matches(topic_name) {
            best.entry(client)
                .and_modify(|q| {
                    if qos > *q {
                        *q = qos;
                    }
                })
                .or_insert(qos);
        }
        best.into_iter().collect()
    }
}
