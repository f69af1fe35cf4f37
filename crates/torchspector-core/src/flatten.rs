//! Flattening checkpoints into a browsable display tree.
//!
//! [`flatten`] walks a checkpoint depth-first and emits one [`DisplayNode`]
//! per entry, in pre-order. Every node carries a display key that the tree
//! uses to address it. Names are deduplicated with a single occurrence
//! counter shared by the whole traversal, not one counter per parent: the
//! second `weight` anywhere in the checkpoint becomes `weight_1`, the third
//! `weight_2`, even when the entries live in unrelated branches. A suffixed
//! name that is already taken (say by a literal `weight_1` key) is skipped, so
//! display keys are unique across the tree. The label shown to users keeps
//! the bare name.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::{Mapping, Value};

/// Traversal-wide naming state: occurrence counts per bare name and every
/// display key handed out so far.
#[derive(Debug, Clone, Default)]
pub struct KeysSeen {
    counts: HashMap<String, usize>,
    emitted: HashSet<String>,
}

impl KeysSeen {
    /// Empty naming state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `display_key` has been handed out.
    pub fn contains(&self, display_key: &str) -> bool {
        self.emitted.contains(display_key)
    }
}

/// One row of the display tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayNode {
    /// Display key of the parent node, `None` for top-level entries.
    pub parent: Option<String>,
    /// Display key addressing this node.
    pub key: String,
    /// Label shown to the user (the unsuffixed name).
    pub text: String,
    /// Zero values for branches, one for leaves.
    pub values: Vec<String>,
}

impl DisplayNode {
    fn branch(parent: Option<&str>, key: String, text: &str) -> Self {
        Self {
            parent: parent.map(str::to_string),
            key,
            text: text.to_string(),
            values: Vec::new(),
        }
    }

    fn leaf(parent: Option<&str>, key: String, text: &str, value: String) -> Self {
        Self {
            parent: parent.map(str::to_string),
            key,
            text: text.to_string(),
            values: vec![value],
        }
    }

    /// Whether this node is a leaf (tensor or scalar).
    pub fn is_leaf(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Flatten a checkpoint into pre-ordered display nodes.
pub fn flatten(checkpoint: &Mapping) -> Vec<DisplayNode> {
    let mut keys_seen = KeysSeen::new();
    let mut nodes = Vec::new();
    for (key, value) in checkpoint {
        visit(None, key, value, &mut keys_seen, &mut nodes);
    }
    nodes
}

/// Pick the display key for `key` and record the occurrence.
///
/// The first occurrence keeps the bare name; occurrence `n` (counting from
/// zero) becomes `key_n`. When that name was already handed out, the counter
/// keeps advancing until a free `key_m` is found.
pub fn dedup_key(key: &str, keys_seen: &mut KeysSeen) -> String {
    let count = keys_seen.counts.entry(key.to_string()).or_insert(0);
    let mut display_key = if *count == 0 {
        key.to_string()
    } else {
        format!("{key}_{count}")
    };
    *count += 1;
    while keys_seen.emitted.contains(&display_key) {
        display_key = format!("{key}_{count}");
        *count += 1;
    }
    keys_seen.emitted.insert(display_key.clone());
    display_key
}

fn visit(
    parent: Option<&str>,
    key: &str,
    value: &Value,
    keys_seen: &mut KeysSeen,
    nodes: &mut Vec<DisplayNode>,
) {
    let display_key = dedup_key(key, keys_seen);
    match value {
        Value::Mapping(map) => {
            nodes.push(DisplayNode::branch(parent, display_key.clone(), key));
            for (child_key, child) in map {
                visit(Some(&display_key), child_key, child, keys_seen, nodes);
            }
        }
        Value::Sequence(items) => {
            nodes.push(DisplayNode::branch(parent, display_key.clone(), key));
            for (index, item) in items.iter().enumerate() {
                // Elements are named after the original key, not the display key.
                let element_key = format!("{key}_{index}");
                visit(Some(&display_key), &element_key, item, keys_seen, nodes);
            }
        }
        Value::Tensor(tensor) => {
            nodes.push(DisplayNode::leaf(parent, display_key, key, tensor.shape_string()));
        }
        Value::Scalar(scalar) => {
            nodes.push(DisplayNode::leaf(parent, display_key, key, scalar.to_string()));
        }
    }
}

/// A flattened checkpoint with lookups by display key.
#[derive(Debug, Clone, Default)]
pub struct DisplayTree {
    nodes: Vec<DisplayNode>,
    by_key: HashMap<String, usize>,
}

impl DisplayTree {
    /// Flatten `checkpoint` and index the result.
    pub fn build(checkpoint: &Mapping) -> Self {
        Self::from_nodes(flatten(checkpoint))
    }

    /// Index already flattened nodes.
    pub fn from_nodes(nodes: Vec<DisplayNode>) -> Self {
        let mut by_key = HashMap::with_capacity(nodes.len());
        for (pos, node) in nodes.iter().enumerate() {
            by_key.entry(node.key.clone()).or_insert(pos);
        }
        Self { nodes, by_key }
    }

    /// All nodes in pre-order.
    pub fn nodes(&self) -> &[DisplayNode] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by display key.
    pub fn get(&self, key: &str) -> Option<&DisplayNode> {
        self.by_key.get(key).map(|&pos| &self.nodes[pos])
    }

    /// Direct children of `parent` (`None` for top-level nodes), in order.
    pub fn children<'a>(&'a self, parent: Option<&'a str>) -> impl Iterator<Item = &'a DisplayNode> {
        self.nodes
            .iter()
            .filter(move |node| node.parent.as_deref() == parent)
    }

    /// Render as an indented outline, one node per line.
    ///
    /// Nodes deeper than `max_depth` (top level is depth 0) are skipped.
    pub fn render_text(&self, max_depth: Option<usize>) -> String {
        let mut depths: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut out = String::new();
        for node in &self.nodes {
            let depth = node
                .parent
                .as_deref()
                .and_then(|parent| depths.get(parent))
                .map_or(0, |d| d + 1);
            depths.entry(node.key.as_str()).or_insert(depth);
            if max_depth.is_some_and(|max| depth > max) {
                continue;
            }
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.text);
            if let Some(value) = node.values.first() {
                out.push_str(": ");
                out.push_str(value);
            }
            out.push('\n');
        }
        out
    }

    /// Render the nodes as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.nodes)
    }
}
