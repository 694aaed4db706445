//! Full/diff reconciliation of topic snapshots.
//!
//! A [`Snapshot`] holds the merged value of one topic as a tree of [`Node`]s.
//! Change provenance lives on the leaves and structural parent links live in
//! a side index keyed by path, so the value graph carries no bookkeeping
//! fields.
//!
//! Diff rules, per key:
//! - `null` deletes the key, its provenance and every index entry below it
//! - an object recurses, creating the child if needed and recording its
//!   parent (the grandparent when the container is a map, else the container)
//! - anything else overwrites the leaf, recording `{previous, changedAt}`
//!   when the value differs and change tracking is on

mod node;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub use node::{Change, Node, NodeKind, ObjectNode};

/// Path of keys from the snapshot root.
pub type NodePath = Vec<String>;

/// Merged state of one topic.
#[derive(Clone, Debug)]
pub struct Snapshot {
    root: Node,
    parents: HashMap<NodePath, NodePath>,
    track_changes: bool,
}

impl Snapshot {
    /// Empty object snapshot.
    pub fn new(track_changes: bool) -> Self {
        Self {
            root: Node::Object(ObjectNode::default()),
            parents: HashMap::new(),
            track_changes,
        }
    }

    /// Snapshot replaced wholesale by `value`, with no change history.
    pub fn from_value(value: Value, track_changes: bool) -> Self {
        let mut parents = HashMap::new();
        let mut path = NodePath::new();
        let root = build(value, &mut path, &mut parents);
        Self {
            root,
            parents,
            track_changes,
        }
    }

    /// Merge `diff` into this snapshot. A non-object diff is ignored.
    pub fn merge(&mut self, diff: &Value) {
        let Value::Object(diff) = diff else {
            tracing::debug!("ignoring non-object diff");
            return;
        };
        if !matches!(self.root, Node::Object(_)) {
            self.root = Node::Object(ObjectNode::default());
            self.parents.clear();
        }
        let Node::Object(root) = &mut self.root else {
            return;
        };
        let mut ctx = MergeCtx {
            parents: &mut self.parents,
            track: self.track_changes,
            now: Utc::now(),
        };
        merge_object(root, &mut NodePath::new(), diff, &mut ctx);
    }

    /// Whether diffs record change provenance.
    pub fn track_changes(&self) -> bool {
        self.track_changes
    }

    /// Root node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Node at `path`; the empty path is the root.
    pub fn get(&self, path: &[&str]) -> Option<&Node> {
        path.iter()
            .try_fold(&self.root, |node, key| node.as_object()?.get(key))
    }

    /// Change provenance of the leaf at `path`.
    pub fn change(&self, path: &[&str]) -> Option<&Change> {
        self.get(path)?.change()
    }

    /// Structural parent of the object at `path`. `None` for the root, for
    /// leaves, and for children of a root-level map.
    pub fn parent_of(&self, path: &[&str]) -> Option<&[String]> {
        let key: NodePath = path.iter().map(|s| (*s).to_owned()).collect();
        self.parents.get(&key).map(Vec::as_slice)
    }

    /// Sorted list view of the object at `path`; empty if it is not an object.
    pub fn list_view(&self, path: &[&str]) -> Vec<(&str, &ObjectNode)> {
        self.get(path)
            .and_then(Node::as_object)
            .map(ObjectNode::list_view)
            .unwrap_or_default()
    }

    /// Plain JSON value.
    pub fn to_value(&self) -> Value {
        self.root.to_value()
    }

    /// JSON value with `_<key>Change` provenance siblings.
    pub fn to_annotated_value(&self) -> Value {
        self.root.to_annotated_value()
    }
}

/// Merge `diff` into `snapshot` in place.
pub fn merge_into(snapshot: &mut Snapshot, diff: &Value) {
    snapshot.merge(diff);
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge internals
// ─────────────────────────────────────────────────────────────────────────────

struct MergeCtx<'a> {
    parents: &'a mut HashMap<NodePath, NodePath>,
    track: bool,
    now: DateTime<Utc>,
}

impl MergeCtx<'_> {
    fn forget_subtree(&mut self, path: &[String]) {
        self.parents.retain(|k, _| !k.starts_with(path));
    }

    fn change(&self, previous: Value) -> Option<Change> {
        self.track.then(|| Change {
            previous,
            changed_at: self.now,
        })
    }
}

/// Parent of the child at `child_path` inside a container of `kind`.
fn parent_for(kind: NodeKind, child_path: &[String]) -> Option<NodePath> {
    let container = child_path.split_last()?.1;
    match kind {
        NodeKind::Struct => Some(container.to_vec()),
        NodeKind::Map => container.split_last().map(|(_, grand)| grand.to_vec()),
    }
}

fn record_parent(
    parents: &mut HashMap<NodePath, NodePath>,
    kind: NodeKind,
    child_path: &[String],
) {
    match parent_for(kind, child_path) {
        Some(parent) => {
            let _ = parents.insert(child_path.to_vec(), parent);
        }
        None => {
            let _ = parents.remove(child_path);
        }
    }
}

fn merge_object(
    node: &mut ObjectNode,
    path: &mut NodePath,
    diff: &Map<String, Value>,
    ctx: &mut MergeCtx<'_>,
) {
    node.invalidate_list();
    if let Some(kind) = NodeKind::from_markers(diff) {
        node.kind = kind;
    }

    for (key, value) in diff {
        path.push(key.clone());
        match value {
            Value::Null => {
                if node.fields.shift_remove(key).is_some() {
                    ctx.forget_subtree(path);
                }
            }
            Value::Object(child_diff) => {
                let entry = node
                    .fields
                    .entry(key.clone())
                    .or_insert_with(|| Node::Object(ObjectNode::default()));
                if !matches!(entry, Node::Object(_)) {
                    *entry = Node::Object(ObjectNode::default());
                }
                record_parent(ctx.parents, node.kind, path);
                if let Some(Node::Object(child)) = node.fields.get_mut(key) {
                    merge_object(child, path, child_diff, ctx);
                }
            }
            scalar => match node.fields.get_mut(key) {
                Some(Node::Leaf {
                    value: current,
                    change,
                }) => {
                    if *current != *scalar {
                        if let Some(c) = ctx.change(current.clone()) {
                            *change = Some(c);
                        }
                        current.clone_from(scalar);
                    }
                }
                Some(existing) => {
                    let previous = existing.to_value();
                    ctx.forget_subtree(path);
                    *existing = Node::Leaf {
                        value: scalar.clone(),
                        change: ctx.change(previous),
                    };
                }
                None => {
                    let _ = node.fields.insert(key.clone(), Node::leaf(scalar.clone()));
                }
            },
        }
        let _ = path.pop();
    }
}

fn build(value: Value, path: &mut NodePath, parents: &mut HashMap<NodePath, NodePath>) -> Node {
    let Value::Object(fields) = value else {
        return Node::leaf(value);
    };
    let mut obj = ObjectNode::with_kind(NodeKind::from_markers(&fields).unwrap_or_default());
    for (key, child) in fields {
        path.push(key.clone());
        if child.is_object() {
            record_parent(parents, obj.kind, path);
        }
        let node = build(child, path, parents);
        let _ = obj.fields.insert(key, node);
        let _ = path.pop();
    }
    Node::Object(obj)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
