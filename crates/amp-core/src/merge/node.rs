//! Snapshot graph nodes.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};

/// Key marking an object as a map container.
pub(crate) const MAP_MARKER: &str = "_isMap";
/// Key marking an object as a struct container.
pub(crate) const STRUCT_MARKER: &str = "_isStruct";

/// Provenance of the last change to a scalar leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    /// Value before the change.
    pub previous: Value,
    /// When the change was merged.
    pub changed_at: DateTime<Utc>,
}

/// Container discriminator, taken from `_isMap` / `_isStruct` markers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeKind {
    /// Fixed set of named fields.
    #[default]
    Struct,
    /// Keyed collection of homogeneous children.
    Map,
}

impl NodeKind {
    pub(crate) fn from_markers(fields: &Map<String, Value>) -> Option<Self> {
        if fields.get(MAP_MARKER).and_then(Value::as_bool) == Some(true) {
            Some(Self::Map)
        } else if fields.get(STRUCT_MARKER).and_then(Value::as_bool) == Some(true) {
            Some(Self::Struct)
        } else {
            None
        }
    }
}

/// A value in the snapshot graph.
#[derive(Clone, Debug)]
pub enum Node {
    /// Scalar or array value, with the provenance of its last change.
    Leaf {
        /// Current value.
        value: Value,
        /// Set when a diff changed the value and change tracking is on.
        change: Option<Change>,
    },
    /// Object value.
    Object(ObjectNode),
}

impl Node {
    pub(crate) fn leaf(value: Value) -> Self {
        Self::Leaf {
            value,
            change: None,
        }
    }

    /// The object behind this node, if any.
    pub fn as_object(&self) -> Option<&ObjectNode> {
        match self {
            Self::Object(obj) => Some(obj),
            Self::Leaf { .. } => None,
        }
    }

    /// The scalar behind this node, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Leaf { value, .. } => Some(value),
            Self::Object(_) => None,
        }
    }

    /// Change provenance of a leaf.
    pub fn change(&self) -> Option<&Change> {
        match self {
            Self::Leaf { change, .. } => change.as_ref(),
            Self::Object(_) => None,
        }
    }

    /// Plain JSON projection without provenance.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Leaf { value, .. } => value.clone(),
            Self::Object(obj) => Value::Object(
                obj.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }

    /// JSON projection with `_<key>Change` siblings next to changed leaves.
    pub fn to_annotated_value(&self) -> Value {
        let Self::Object(obj) = self else {
            return self.to_value();
        };
        let mut out = Map::new();
        for (key, child) in &obj.fields {
            let _ = out.insert(key.clone(), child.to_annotated_value());
            if let Some(change) = child.change() {
                let _ = out.insert(
                    format!("_{key}Change"),
                    json!({
                        "previous": change.previous,
                        "changedAt": change.changed_at.timestamp_millis(),
                    }),
                );
            }
        }
        Value::Object(out)
    }
}

/// An object node: ordered fields plus a cached sorted list of its children.
#[derive(Clone, Debug, Default)]
pub struct ObjectNode {
    pub(crate) kind: NodeKind,
    pub(crate) fields: IndexMap<String, Node>,
    list: OnceLock<Vec<String>>,
}

impl ObjectNode {
    pub(crate) fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Container discriminator.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Field by key.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.fields.get(key)
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the object has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Object-valued children whose key does not start with `_`, sorted by
    /// `order` (default 0) then `name`. The ordering is computed once and
    /// reused until the node is merged again.
    pub fn list_view(&self) -> Vec<(&str, &ObjectNode)> {
        self.list
            .get_or_init(|| self.sorted_children())
            .iter()
            .filter_map(|key| match self.fields.get_key_value(key)? {
                (k, Node::Object(child)) => Some((k.as_str(), child)),
                (_, Node::Leaf { .. }) => None,
            })
            .collect()
    }

    pub(crate) fn invalidate_list(&mut self) {
        let _ = self.list.take();
    }

    fn sorted_children(&self) -> Vec<String> {
        let mut children: Vec<(&String, &ObjectNode)> = self
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .filter_map(|(k, v)| v.as_object().map(|o| (k, o)))
            .collect();
        children.sort_by(|(ka, a), (kb, b)| {
            a.sort_order()
                .total_cmp(&b.sort_order())
                .then_with(|| a.sort_name().cmp(b.sort_name()))
                .then_with(|| ka.cmp(kb))
        });
        children.into_iter().map(|(k, _)| k.clone()).collect()
    }

    fn sort_order(&self) -> f64 {
        self.fields
            .get("order")
            .and_then(Node::as_value)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    fn sort_name(&self) -> &str {
        self.fields
            .get("name")
            .and_then(Node::as_value)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}
