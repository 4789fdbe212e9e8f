//! Explicit string-keyed metadata tree.
//!
//! Datasets carry arbitrary acquisition metadata (detector settings,
//! calibration provenance, ...). We store it as a plain tree of
//! string-to-node mappings with path-based access, so nothing depends on
//! dynamic attribute dispatch and the whole tree serializes cleanly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// One node of the metadata tree: either a leaf value or a subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataNode {
    Value(MetadataValue),
    Tree(BTreeMap<String, MetadataNode>),
}

impl Default for MetadataNode {
    fn default() -> Self {
        MetadataNode::Tree(BTreeMap::new())
    }
}

impl MetadataNode {
    /// Look up a node by dotted path (`"acquisition.detector.gain"`).
    pub fn get(&self, path: &str) -> Option<&MetadataNode> {
        let mut node = self;
        for key in path.split('.') {
            match node {
                MetadataNode::Tree(children) => node = children.get(key)?,
                MetadataNode::Value(_) => return None,
            }
        }
        Some(node)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a leaf value by dotted path, creating intermediate subtrees.
    ///
    /// Replaces any existing node at the path, including subtrees.
    pub fn set(&mut self, path: &str, value: MetadataValue) {
        let mut node = self;
        let mut keys = path.split('.').peekable();
        while let Some(key) = keys.next() {
            if !matches!(*node, MetadataNode::Tree(_)) {
                *node = MetadataNode::default();
            }
            let MetadataNode::Tree(children) = node else {
                unreachable!("node was just made a tree")
            };
            if keys.peek().is_none() {
                children.insert(key.to_string(), MetadataNode::Value(value));
                return;
            }
            node = children
                .entry(key.to_string())
                .or_insert_with(MetadataNode::default);
        }
    }

    /// Leaf value at the path, if the path exists and ends at a leaf.
    pub fn value(&self, path: &str) -> Option<&MetadataValue> {
        match self.get(path)? {
            MetadataNode::Value(v) => Some(v),
            MetadataNode::Tree(_) => None,
        }
    }

    pub fn number(&self, path: &str) -> Option<f64> {
        match self.value(path)? {
            MetadataValue::Number(x) => Some(*x),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_nested_paths() {
        let mut root = MetadataNode::default();
        root.set("acquisition.detector.gain", MetadataValue::Number(1.5));
        root.set("acquisition.detector.name", MetadataValue::Text("ccd".into()));

        assert!(root.has("acquisition.detector"));
        assert_eq!(root.number("acquisition.detector.gain"), Some(1.5));
        assert_eq!(root.number("acquisition.detector.name"), None);
        assert!(!root.has("acquisition.stage"));
    }

    #[test]
    fn set_replaces_existing_subtree() {
        let mut root = MetadataNode::default();
        root.set("a.b.c", MetadataValue::Bool(true));
        root.set("a.b", MetadataValue::Number(2.0));

        assert_eq!(root.number("a.b"), Some(2.0));
        assert!(!root.has("a.b.c"));
    }
}
