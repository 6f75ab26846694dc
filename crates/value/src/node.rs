//! The opaque value tree.
//!
//! A [`Node`] is one of six kinds (`null`, `bool`, `number`, `string`,
//! `array`, `object`) plus a free-form `tag` string. The tag is a semantic
//! side channel: the patch engine reads operator tags off diff nodes, the
//! match engine exposes a tag predicate, and everything else carries tags
//! through untouched.
//!
//! Nodes are plain values; the storage layers treat them as immutable once
//! published (shared behind `Arc` where it matters). There are no parent
//! pointers.

use std::collections::BTreeMap;
use std::fmt;

use crate::path::{KindedPath, PathSeg};

/// The introspectable kind of a [`Node`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Array => "array",
            Kind::Object => "object",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Node>),
    /// Object fields are kept sorted by key so that identity, equality and
    /// the binary encoding are all insertion-order agnostic.
    Object(BTreeMap<String, Node>),
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Node {
    tag: String,
    value: Value,
}

impl Node {
    pub fn null() -> Self {
        Node::default()
    }

    pub fn bool(val: bool) -> Self {
        Value::Bool(val).into()
    }

    pub fn int(val: i64) -> Self {
        Value::Int(val).into()
    }

    pub fn float(val: f64) -> Self {
        Value::Float(val).into()
    }

    pub fn string(val: impl Into<String>) -> Self {
        Value::String(val.into()).into()
    }

    pub fn array(elems: impl IntoIterator<Item = Node>) -> Self {
        Value::Array(elems.into_iter().collect()).into()
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Node)>) -> Self {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect()).into()
    }

    pub fn from_value(value: Value) -> Self {
        Node { tag: String::new(), value }
    }

    /// Attach a tag, consuming self. Builder-style.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    pub fn clear_tag(&mut self) {
        self.tag.clear();
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn kind(&self) -> Kind {
        match &self.value {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) | Value::Float(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            Value::Float(f) => Some(f),
            Value::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Node]> {
        match &self.value {
            Value::Array(elems) => Some(elems),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.value {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match &mut self.value {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Field of an object node, if both exist.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Element of an array node, if both exist.
    pub fn get_index(&self, index: usize) -> Option<&Node> {
        self.as_array().and_then(|elems| elems.get(index))
    }

    /// Resolve one path segment against this node.
    ///
    /// `Keyed(k)` selects, within an array, the first element carrying a
    /// field `"id"` whose string value equals `k`; against an object it
    /// falls back to the field named `k`.
    pub fn get_seg(&self, seg: &PathSeg) -> Option<&Node> {
        match seg {
            PathSeg::Key(key) => self.get(key),
            PathSeg::Index(index) => self.get_index(*index),
            PathSeg::Keyed(key) => match &self.value {
                Value::Array(elems) => elems
                    .iter()
                    .find(|elem| elem.get("id").and_then(Node::as_str) == Some(key.as_str())),
                Value::Object(fields) => fields.get(key.as_str()),
                _ => None,
            },
        }
    }

    /// Navigate a whole path. Returns `None` as soon as a segment does not
    /// resolve.
    pub fn at_path(&self, path: &KindedPath) -> Option<&Node> {
        path.segs().iter().try_fold(self, |node, seg| node.get_seg(seg))
    }

    /// Structural equality ignoring tags on every node.
    pub fn value_eq(&self, other: &Node) -> bool {
        match (&self.value, &other.value) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.value_eq(vb))
            }
            (a, b) => a == b,
        }
    }

    /// Rough in-memory footprint, used by the state cache for sizing.
    pub fn estimated_size(&self) -> usize {
        let inner = match &self.value {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => 0,
            Value::String(s) => s.len(),
            Value::Array(elems) => elems.iter().map(Node::estimated_size).sum(),
            Value::Object(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.estimated_size())
                .sum(),
        };
        std::mem::size_of::<Node>() + self.tag.len() + inner
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Node::from_value(value)
    }
}

impl From<bool> for Node {
    fn from(val: bool) -> Self {
        Node::bool(val)
    }
}

impl From<i64> for Node {
    fn from(val: i64) -> Self {
        Node::int(val)
    }
}

impl From<f64> for Node {
    fn from(val: f64) -> Self {
        Node::float(val)
    }
}

impl From<&str> for Node {
    fn from(val: &str) -> Self {
        Node::string(val)
    }
}

impl fmt::Display for Node {
    /// Compact JSON-ish rendering for logs and error messages. Tags are
    /// shown as a `#tag` prefix; this is not a serialisation format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tag.is_empty() {
            write!(f, "#{} ", self.tag)?;
        }
        match &self.value {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(elems) => {
                write!(f, "[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (key, val)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{key:?}:{val}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_introspection() {
        assert_eq!(Node::null().kind(), Kind::Null);
        assert_eq!(Node::int(3).kind(), Kind::Number);
        assert_eq!(Node::float(3.5).kind(), Kind::Number);
        assert_eq!(Node::array([Node::int(1)]).kind(), Kind::Array);
        assert_eq!(Node::object([("a", Node::int(1))]).kind(), Kind::Object);
    }

    #[test]
    fn value_eq_ignores_tags() {
        let plain = Node::object([("a", Node::int(1))]);
        let tagged = Node::object([("a", Node::int(1).with_tag("weird"))]).with_tag("outer");
        assert_ne!(plain, tagged);
        assert!(plain.value_eq(&tagged));
    }

    #[test]
    fn keyed_segment_resolution() {
        let rows = Node::array([
            Node::object([("id", Node::string("a")), ("n", Node::int(1))]),
            Node::object([("id", Node::string("b")), ("n", Node::int(2))]),
        ]);
        let hit = rows.get_seg(&PathSeg::Keyed("b".into())).unwrap();
        assert_eq!(hit.get("n").unwrap().as_int(), Some(2));
        assert!(rows.get_seg(&PathSeg::Keyed("c".into())).is_none());
    }
}
