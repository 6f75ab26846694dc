//! Structural merge of diff trees into base trees.
//!
//! A diff is an ordinary [`Node`] whose tags may name operators. Operators
//! form a closed set ([`OpTag`]); unknown tags are plain data and flow
//! through untouched. Application never mutates its inputs.
//!
//! The same diff can be applied three ways:
//!
//! - [`apply`] -- tree against tree, the reference semantics;
//! - [`project`] -- restrict a root-anchored diff to a sub-path, so a read
//!   at that path can replay only what concerns it;
//! - [`apply_events`] -- stream a base event buffer through the diff,
//!   copying untouched subtrees byte-for-byte (the snapshot build path).

use std::collections::BTreeMap;

use crate::buffer::DecodeError;
use crate::event::{Event, EventReader, EventWriter};
use crate::matcher;
use crate::node::{Node, Value};
use crate::path::{KindedPath, PathSeg};

pub const TAG_PATCH_ROOT: &str = "patch-root";

/// The operator vocabulary of diff tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpTag {
    /// Transaction boundary marker on a participant's contribution.
    PatchRoot,
    /// Remove the base value.
    Delete,
    /// Insert this value (array splice position, or object set).
    Insert,
    /// Replace the base value wholesale.
    Replace,
    /// Keep the base value (array splice position, or explicit no-op).
    Retain,
    /// Replace the base value with null.
    Nullify,
    /// Conditional: `{cond, then, else?}` -- apply a branch depending on a
    /// match against the base.
    If,
    /// Descend by dotted-path keys: `{"a.b": diff, ...}`.
    Dive,
    /// Apply the diff value to every element of the base array.
    All,
    /// Apply an array of diffs in sequence.
    Pipe,
    /// RFC 6902 style `[{op, path, value}]` operations.
    JsonPatch,
}

impl OpTag {
    pub fn parse(tag: &str) -> Option<OpTag> {
        Some(match tag {
            TAG_PATCH_ROOT => OpTag::PatchRoot,
            "delete" => OpTag::Delete,
            "insert" => OpTag::Insert,
            "replace" => OpTag::Replace,
            "retain" => OpTag::Retain,
            "nullify" => OpTag::Nullify,
            "if" => OpTag::If,
            "dive" => OpTag::Dive,
            "all" => OpTag::All,
            "pipe" => OpTag::Pipe,
            "json-patch" => OpTag::JsonPatch,
            _ => return None,
        })
    }
}

fn op_of(node: &Node) -> Option<OpTag> {
    OpTag::parse(node.tag())
}

/// Clone a diff node with its (consumed) operator tag cleared.
fn strip_op(diff: &Node) -> Node {
    let mut node = diff.clone();
    node.clear_tag();
    node
}

/// Apply `diff` to `base`. `None` is the absent value on both sides.
pub fn apply(base: Option<Node>, diff: &Node) -> Option<Node> {
    match op_of(diff) {
        Some(OpTag::Delete) => None,
        Some(OpTag::Nullify) => Some(Node::null()),
        Some(OpTag::Retain) => base,
        Some(OpTag::Replace) | Some(OpTag::Insert) => Some(strip_op(diff)),
        Some(OpTag::PatchRoot) => apply_untagged(base, &strip_op(diff)),
        Some(OpTag::If) => {
            let cond = diff.get("cond");
            let hit = cond.map_or(false, |cond| matcher::matches(base.as_ref(), cond));
            let branch = if hit { diff.get("then") } else { diff.get("else") };
            match branch {
                Some(branch) => apply(base, branch),
                None => base,
            }
        }
        Some(OpTag::Pipe) => match diff.as_array() {
            Some(steps) => steps.iter().fold(base, |acc, step| apply(acc, step)),
            None => base,
        },
        Some(OpTag::All) => {
            let each = strip_op(diff);
            match base {
                Some(node) if node.kind() == crate::node::Kind::Array => {
                    let tag = node.tag().to_string();
                    let elems = match node.into_value() {
                        Value::Array(elems) => elems,
                        _ => unreachable!(),
                    };
                    let mut out = Node::array(
                        elems
                            .into_iter()
                            .filter_map(|elem| apply(Some(elem), &each)),
                    );
                    if !tag.is_empty() {
                        out.set_tag(tag);
                    }
                    Some(out)
                }
                other => other,
            }
        }
        Some(OpTag::Dive) => {
            let mut acc = base;
            if let Some(fields) = diff.as_object() {
                for (raw_path, sub) in fields {
                    if let Ok(path) = KindedPath::parse(raw_path) {
                        acc = apply_at_path(acc, &path, sub);
                    }
                }
            }
            acc
        }
        Some(OpTag::JsonPatch) => apply_json_patch(base, diff),
        None => apply_untagged(base, diff),
    }
}

fn apply_untagged(base: Option<Node>, diff: &Node) -> Option<Node> {
    match diff.value() {
        Value::Object(diff_fields) => {
            // Recursive object merge. A non-object base is discarded.
            let (tag, mut fields) = match base {
                Some(node) if node.kind() == crate::node::Kind::Object => {
                    let tag = node.tag().to_string();
                    match node.into_value() {
                        Value::Object(fields) => (tag, fields),
                        _ => unreachable!(),
                    }
                }
                _ => (String::new(), BTreeMap::new()),
            };
            for (key, sub) in diff_fields {
                match apply(fields.remove(key), sub) {
                    Some(merged) => {
                        fields.insert(key.clone(), merged);
                    }
                    None => {}
                }
            }
            let mut out = Node::from_value(Value::Object(fields));
            let out_tag = if diff.tag().is_empty() { tag } else { diff.tag().to_string() };
            if !out_tag.is_empty() {
                out.set_tag(out_tag);
            }
            Some(out)
        }
        Value::Array(diff_elems) => {
            let base_elems = match base {
                Some(node) if node.kind() == crate::node::Kind::Array => {
                    match node.into_value() {
                        Value::Array(elems) => elems,
                        _ => unreachable!(),
                    }
                }
                _ => Vec::new(),
            };
            Some(apply_array(base_elems, diff_elems, diff.tag()))
        }
        // Scalars overwrite.
        _ => Some(diff.clone()),
    }
}

/// `true` if any element carries a splice operator, switching the array
/// into op mode.
fn is_splice(diff_elems: &[Node]) -> bool {
    diff_elems.iter().any(|elem| {
        matches!(
            op_of(elem),
            Some(OpTag::Insert) | Some(OpTag::Delete) | Some(OpTag::Retain)
        )
    })
}

fn apply_array(base: Vec<Node>, diff_elems: &[Node], tag: &str) -> Node {
    let mut out = Vec::with_capacity(base.len().max(diff_elems.len()));
    if is_splice(diff_elems) {
        let mut iter = base.into_iter();
        for elem in diff_elems {
            match op_of(elem) {
                Some(OpTag::Retain) => {
                    let count = elem.as_int().unwrap_or(1).max(0) as usize;
                    out.extend(iter.by_ref().take(count));
                }
                Some(OpTag::Delete) => {
                    let count = elem.as_int().unwrap_or(1).max(0) as usize;
                    for _ in iter.by_ref().take(count) {}
                }
                Some(OpTag::Insert) => {
                    // An insert-tagged array splices its elements; anything
                    // else inserts as a single value.
                    match elem.value() {
                        Value::Array(values) => out.extend(values.iter().cloned()),
                        _ => out.push(strip_op(elem)),
                    }
                }
                _ => {
                    if let Some(patched) = apply(iter.next(), elem) {
                        out.push(patched);
                    }
                }
            }
        }
        // Unconsumed base elements are retained.
        out.extend(iter);
    } else {
        let mut iter = base.into_iter();
        for elem in diff_elems {
            if let Some(patched) = apply(iter.next(), elem) {
                out.push(patched);
            }
        }
        out.extend(iter);
    }
    let mut node = Node::array(out);
    if !tag.is_empty() {
        node.set_tag(tag);
    }
    node
}

/// Apply `diff` at a nested `path` of `base`, creating intermediate
/// objects as needed.
pub fn apply_at_path(base: Option<Node>, path: &KindedPath, diff: &Node) -> Option<Node> {
    let Some((seg, rest)) = path.segs().split_first() else {
        return apply(base, diff);
    };
    let rest: KindedPath = rest.iter().cloned().collect();
    match seg {
        PathSeg::Key(key) => {
            let (tag, mut fields) = match base {
                Some(node) if node.kind() == crate::node::Kind::Object => {
                    let tag = node.tag().to_string();
                    match node.into_value() {
                        Value::Object(fields) => (tag, fields),
                        _ => unreachable!(),
                    }
                }
                _ => (String::new(), BTreeMap::new()),
            };
            match apply_at_path(fields.remove(key.as_str()), &rest, diff) {
                Some(child) => {
                    fields.insert(key.clone(), child);
                }
                None => {}
            }
            let mut out = Node::from_value(Value::Object(fields));
            if !tag.is_empty() {
                out.set_tag(tag);
            }
            Some(out)
        }
        PathSeg::Index(index) => {
            let (tag, mut elems) = match base {
                Some(node) if node.kind() == crate::node::Kind::Array => {
                    let tag = node.tag().to_string();
                    match node.into_value() {
                        Value::Array(elems) => (tag, elems),
                        _ => unreachable!(),
                    }
                }
                _ => (String::new(), Vec::new()),
            };
            while elems.len() <= *index {
                elems.push(Node::null());
            }
            match apply_at_path(Some(elems[*index].clone()), &rest, diff) {
                Some(child) => elems[*index] = child,
                None => {
                    elems.remove(*index);
                }
            }
            let mut out = Node::array(elems);
            if !tag.is_empty() {
                out.set_tag(tag);
            }
            Some(out)
        }
        PathSeg::Keyed(key) => {
            let (tag, mut elems) = match base {
                Some(node) if node.kind() == crate::node::Kind::Array => {
                    let tag = node.tag().to_string();
                    match node.into_value() {
                        Value::Array(elems) => (tag, elems),
                        _ => unreachable!(),
                    }
                }
                _ => (String::new(), Vec::new()),
            };
            let pos = elems
                .iter()
                .position(|elem| elem.get("id").and_then(Node::as_str) == Some(key.as_str()));
            match pos {
                Some(pos) => match apply_at_path(Some(elems[pos].clone()), &rest, diff) {
                    Some(child) => elems[pos] = child,
                    None => {
                        elems.remove(pos);
                    }
                },
                None => {
                    // Create the keyed element on first write.
                    let seeded = Node::object([("id", Node::string(key.clone()))]);
                    if let Some(child) = apply_at_path(Some(seeded), &rest, diff) {
                        elems.push(child);
                    }
                }
            }
            let mut out = Node::array(elems);
            if !tag.is_empty() {
                out.set_tag(tag);
            }
            Some(out)
        }
    }
}

fn apply_json_patch(base: Option<Node>, diff: &Node) -> Option<Node> {
    let Some(ops) = diff.as_array() else { return base };
    let mut acc = base;
    for op in ops {
        let Some(name) = op.get("op").and_then(Node::as_str) else { continue };
        let Some(path) = op
            .get("path")
            .and_then(Node::as_str)
            .and_then(|raw| KindedPath::parse(raw).ok())
        else {
            continue;
        };
        acc = match name {
            "add" | "replace" => match op.get("value") {
                Some(value) => {
                    apply_at_path(acc, &path, &value.clone().with_tag("replace"))
                }
                None => acc,
            },
            "remove" => apply_at_path(acc, &path, &Node::null().with_tag("delete")),
            _ => acc,
        };
    }
    acc
}

/// The effect of a root-anchored diff on one sub-path.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    /// The diff does not touch this path.
    Unchanged,
    /// The diff removes this path (or an ancestor).
    Removed,
    /// Apply this sub-diff to the state at the path.
    Apply(Node),
    /// The diff crosses an operator that cannot be projected; the caller
    /// must reconstruct from the root.
    NeedsRoot,
}

/// Restrict a root-anchored `diff` to the subtree at `path`.
pub fn project(diff: &Node, path: &KindedPath) -> Projection {
    let mut cur = diff;
    for (depth, seg) in path.segs().iter().enumerate() {
        match op_of(cur) {
            Some(OpTag::Delete) | Some(OpTag::Nullify) => return Projection::Removed,
            Some(OpTag::Retain) => return Projection::Unchanged,
            Some(OpTag::Replace) | Some(OpTag::Insert) => {
                // Everything below a replacement is plain data.
                let rest: KindedPath = path.segs()[depth..].iter().cloned().collect();
                return match cur.at_path(&rest) {
                    Some(found) => Projection::Apply(found.clone().with_tag("replace")),
                    None => Projection::Removed,
                };
            }
            Some(OpTag::PatchRoot) | None => match cur.value() {
                Value::Object(fields) => {
                    let PathSeg::Key(key) = seg else { return Projection::NeedsRoot };
                    match fields.get(key.as_str()) {
                        Some(sub) => cur = sub,
                        None => return Projection::Unchanged,
                    }
                }
                Value::Array(elems) => {
                    if is_splice(elems) {
                        return Projection::NeedsRoot;
                    }
                    let PathSeg::Index(index) = seg else { return Projection::NeedsRoot };
                    match elems.get(*index) {
                        Some(sub) => cur = sub,
                        None => return Projection::Unchanged,
                    }
                }
                // A scalar replaces the base here; below it nothing exists.
                _ => return Projection::Removed,
            },
            Some(_) => return Projection::NeedsRoot,
        }
    }
    let mut out = cur.clone();
    if matches!(op_of(&out), Some(OpTag::PatchRoot)) {
        out.clear_tag();
    }
    Projection::Apply(out)
}

/// Stream the value under `base` through `diff` into `out`.
///
/// Object merges are streamed: fields untouched by the diff are copied
/// byte-for-byte, touched fields are materialised, patched and re-emitted.
/// Every other combination materialises the (sub)tree it covers. An
/// exhausted base is the absent value; a deleted result emits nothing.
pub fn apply_events(
    base: &mut EventReader<'_>,
    diff: &Node,
    out: &mut EventWriter,
) -> Result<(), DecodeError> {
    let streamable = matches!(op_of(diff), None | Some(OpTag::PatchRoot))
        && matches!(diff.value(), Value::Object(_));
    if !streamable {
        let before = apply(base.read_node()?, diff);
        if let Some(node) = before {
            out.write_node(&node);
        }
        return Ok(());
    }

    let mut probe = base.clone();
    match probe.next_event()? {
        Some(Event::BeginObject { tag }) => {
            *base = probe;
            let diff_fields = diff.as_object().expect("checked above");
            let out_tag = if diff.tag().is_empty() || op_of(diff).is_some() {
                tag
            } else {
                diff.tag().to_string()
            };
            out.write_event(&Event::BeginObject { tag: out_tag });
            let mut seen: Vec<String> = Vec::new();
            loop {
                match base.next_event()? {
                    Some(Event::Field(name)) => match diff_fields.get(name.as_str()) {
                        None => {
                            out.write_event(&Event::Field(name));
                            base.copy_value(out)?;
                        }
                        Some(sub) => {
                            seen.push(name.clone());
                            // Emit the field marker only if the value
                            // survives: a deleting diff produces no bytes.
                            let mut nested = EventWriter::new();
                            apply_events(base, sub, &mut nested)?;
                            let nested = nested.into_bytes();
                            if !nested.is_empty() {
                                out.write_event(&Event::Field(name));
                                out.append_raw(&nested);
                            }
                        }
                    },
                    Some(Event::End) | None => break,
                    _ => {
                        return Err(DecodeError::InvalidTag {
                            byte: 0,
                            kind: "expected field or end inside object",
                        })
                    }
                }
            }
            // Diff-only fields, in key order.
            for (key, sub) in diff_fields {
                if seen.iter().any(|name| name == key) {
                    continue;
                }
                if let Some(node) = apply(None, sub) {
                    out.write_event(&Event::Field(key.clone()));
                    out.write_node(&node);
                }
            }
            out.write_event(&Event::End);
            Ok(())
        }
        _ => {
            // Base is absent or not an object: fall back to tree semantics.
            if let Some(node) = apply(base.read_node()?, diff) {
                out.write_node(&node);
            }
            Ok(())
        }
    }
}

/// Collect the `patch-root` tagged participant roots of a merged patch,
/// with the kinded path each one sits at.
pub fn collect_patch_roots(diff: &Node) -> Vec<(KindedPath, &Node)> {
    let mut found = Vec::new();
    walk_patch_roots(diff, &mut KindedPath::root(), &mut found);
    found
}

fn walk_patch_roots<'n>(
    node: &'n Node,
    path: &mut KindedPath,
    found: &mut Vec<(KindedPath, &'n Node)>,
) {
    match op_of(node) {
        Some(OpTag::PatchRoot) => {
            found.push((path.clone(), node));
            return;
        }
        // Other operator nodes are opaque: their keys are not path
        // segments. Entries rooted in one index at the root instead.
        Some(_) => return,
        None => {}
    }
    if let Value::Object(fields) = node.value() {
        for (key, sub) in fields {
            let mut child = path.clone();
            child.push(PathSeg::Key(key.clone()));
            walk_patch_roots(sub, &mut child, found);
        }
    }
}

/// Nest `body` under `path` inside the merged patch being built for one
/// transaction. An untagged body is marked `patch-root`; a body carrying
/// its own operator tag keeps it (the operator *is* the contribution).
///
/// Paths made purely of map keys nest structurally. Paths with array or
/// keyed segments cannot be expressed as an object merge; those route
/// through a `dive` node at the root (several such contributions share
/// one `dive`), stacked over any structural part with `pipe`.
pub fn graft(root: &mut Node, path: &KindedPath, body: Node) {
    let body = if body.tag().is_empty() {
        body.with_tag(TAG_PATCH_ROOT)
    } else {
        body
    };

    if !path.segs().iter().all(|seg| matches!(seg, PathSeg::Key(_))) {
        return graft_dive(root, path, body);
    }

    let mut slot = root;
    for seg in path.segs() {
        let PathSeg::Key(key) = seg else { unreachable!("checked above") };
        if slot.kind() != crate::node::Kind::Object || op_of(slot).is_some() {
            *slot = Node::object::<String>([]);
        }
        slot = slot
            .as_object_mut()
            .expect("just coerced to object")
            .entry(key.clone())
            .or_insert_with(|| Node::object::<String>([]));
    }
    match (slot.as_object_mut(), body.as_object()) {
        // Two participants at the same path merge field-wise.
        (Some(existing), Some(incoming)) if !existing.is_empty() => {
            for (key, val) in incoming {
                existing.insert(key.clone(), val.clone());
            }
        }
        _ => *slot = body,
    }
}

fn graft_dive(root: &mut Node, path: &KindedPath, body: Node) {
    let key = path.to_string();
    match op_of(root) {
        // An existing dive absorbs further non-key contributions.
        Some(OpTag::Dive) => {
            if let Some(fields) = root.as_object_mut() {
                fields.insert(key, body);
                return;
            }
        }
        // An existing pipe gets one more step.
        Some(OpTag::Pipe) => {
            if let Value::Array(steps) = root.value_mut() {
                steps.push(Node::object([(key, body)]).with_tag("dive"));
                return;
            }
        }
        _ => {}
    }
    let dive = Node::object([(key, body)]).with_tag("dive");
    if root.as_object().is_some_and(|fields| fields.is_empty()) && root.tag().is_empty() {
        *root = dive;
    } else {
        // Stack the dive over the structural part already grafted.
        let structural = std::mem::take(root);
        *root = Node::array([structural, dive]).with_tag("pipe");
    }
}

/// Recursively clear `patch-root` tags from a materialised state.
pub fn strip_patch_root_tags(node: &mut Node) {
    if node.tag() == TAG_PATCH_ROOT {
        node.clear_tag();
    }
    match node.value_mut() {
        Value::Array(elems) => elems.iter_mut().for_each(strip_patch_root_tags),
        Value::Object(fields) => fields.values_mut().for_each(strip_patch_root_tags),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::node_to_events;
    use pretty_assertions::assert_eq;

    fn obj<const N: usize>(fields: [(&str, Node); N]) -> Node {
        Node::object(fields)
    }

    #[test]
    fn object_merge_add_replace_delete() {
        let base = obj([("a", Node::int(1)), ("b", Node::int(2))]);
        let diff = obj([
            ("b", Node::int(20)),
            ("c", Node::int(3)),
            ("a", Node::null().with_tag("delete")),
        ]);
        let out = apply(Some(base), &diff).unwrap();
        assert_eq!(out, obj([("b", Node::int(20)), ("c", Node::int(3))]));
    }

    #[test]
    fn scalar_overwrites_and_merge_into_absent() {
        assert_eq!(apply(Some(Node::int(1)), &Node::string("x")), Some(Node::string("x")));
        assert_eq!(
            apply(None, &obj([("n", Node::int(1))])),
            Some(obj([("n", Node::int(1))]))
        );
    }

    #[test]
    fn delete_of_absent_stays_absent() {
        assert_eq!(apply(None, &Node::null().with_tag("delete")), None);
    }

    #[test]
    fn replace_does_not_merge() {
        let base = obj([("keep", Node::int(1))]);
        let diff = obj([("new", Node::int(2))]).with_tag("replace");
        let out = apply(Some(base), &diff).unwrap();
        assert_eq!(out, obj([("new", Node::int(2))]));
        assert_eq!(out.tag(), "");
    }

    #[test]
    fn nullify_and_retain() {
        let base = Node::int(7);
        assert_eq!(
            apply(Some(base.clone()), &Node::int(0).with_tag("nullify")),
            Some(Node::null())
        );
        assert_eq!(
            apply(Some(base.clone()), &Node::null().with_tag("retain")),
            Some(base)
        );
    }

    #[test]
    fn array_positional_overwrite() {
        let base = Node::array([Node::int(1), Node::int(2), Node::int(3)]);
        let diff = Node::array([Node::int(10), Node::int(20)]);
        assert_eq!(
            apply(Some(base), &diff).unwrap(),
            Node::array([Node::int(10), Node::int(20), Node::int(3)])
        );
    }

    #[test]
    fn array_splice_ops() {
        let base = Node::array([Node::int(1), Node::int(2), Node::int(3)]);
        let diff = Node::array([
            Node::int(1).with_tag("retain"),
            Node::int(1).with_tag("delete"),
            Node::int(99).with_tag("insert"),
        ]);
        assert_eq!(
            apply(Some(base), &diff).unwrap(),
            Node::array([Node::int(1), Node::int(99), Node::int(3)])
        );
    }

    #[test]
    fn splice_insert_of_array_splices_elements() {
        let base = Node::array([Node::int(1)]);
        let diff = Node::array([
            Node::int(1).with_tag("retain"),
            Node::array([Node::int(2), Node::int(3)]).with_tag("insert"),
        ]);
        assert_eq!(
            apply(Some(base), &diff).unwrap(),
            Node::array([Node::int(1), Node::int(2), Node::int(3)])
        );
    }

    #[test]
    fn if_operator_branches_on_match() {
        let base = obj([("state", Node::string("on"))]);
        let diff = obj([
            ("cond", obj([("state", Node::string("on"))])),
            ("then", obj([("state", Node::string("off"))])),
            ("else", obj([("error", Node::bool(true))])),
        ])
        .with_tag("if");
        assert_eq!(
            apply(Some(base.clone()), &diff).unwrap(),
            obj([("state", Node::string("off"))])
        );
        let other = obj([("state", Node::string("idle"))]);
        assert_eq!(
            apply(Some(other), &diff).unwrap(),
            obj([("error", Node::bool(true)), ("state", Node::string("idle"))])
        );
    }

    #[test]
    fn pipe_applies_in_sequence() {
        let diff = Node::array([
            obj([("n", Node::int(1))]),
            obj([("n", Node::null().with_tag("delete")), ("m", Node::int(2))]),
        ])
        .with_tag("pipe");
        assert_eq!(apply(None, &diff).unwrap(), obj([("m", Node::int(2))]));
    }

    #[test]
    fn dive_descends_dotted_paths() {
        let base = obj([("a", obj([("b", Node::int(1))]))]);
        let diff = obj([("a.b", Node::int(9))]).with_tag("dive");
        assert_eq!(
            apply(Some(base), &diff).unwrap(),
            obj([("a", obj([("b", Node::int(9))]))])
        );
    }

    #[test]
    fn all_maps_over_elements() {
        let base = Node::array([
            obj([("v", Node::int(1))]),
            obj([("v", Node::int(2))]),
        ]);
        let diff = obj([("seen", Node::bool(true))]).with_tag("all");
        let out = apply(Some(base), &diff).unwrap();
        assert_eq!(
            out,
            Node::array([
                obj([("seen", Node::bool(true)), ("v", Node::int(1))]),
                obj([("seen", Node::bool(true)), ("v", Node::int(2))]),
            ])
        );
    }

    #[test]
    fn json_patch_ops() {
        let base = obj([("a", Node::int(1)), ("b", Node::int(2))]);
        let diff = Node::array([
            obj([("op", Node::string("replace")), ("path", Node::string("/a")), ("value", Node::int(10))]),
            obj([("op", Node::string("remove")), ("path", Node::string("/b"))]),
            obj([("op", Node::string("add")), ("path", Node::string("/c")), ("value", Node::int(3))]),
        ])
        .with_tag("json-patch");
        assert_eq!(
            apply(Some(base), &diff).unwrap(),
            obj([("a", Node::int(10)), ("c", Node::int(3))])
        );
    }

    #[test]
    fn project_simple_merge() {
        let diff = obj([("u", obj([("a", obj([("name", Node::string("B"))]))]))]);
        let path = KindedPath::parse("/u/a").unwrap();
        assert_eq!(
            project(&diff, &path),
            Projection::Apply(obj([("name", Node::string("B"))]))
        );
        assert_eq!(
            project(&diff, &KindedPath::parse("/u/zzz").unwrap()),
            Projection::Unchanged
        );
    }

    #[test]
    fn project_through_delete_and_replace() {
        let diff = obj([("u", Node::null().with_tag("delete"))]);
        assert_eq!(
            project(&diff, &KindedPath::parse("/u/a").unwrap()),
            Projection::Removed
        );

        let diff = obj([("u", obj([("x", Node::int(1))]).with_tag("replace"))]);
        assert_eq!(
            project(&diff, &KindedPath::parse("/u/x").unwrap()),
            Projection::Apply(Node::int(1).with_tag("replace"))
        );
        assert_eq!(
            project(&diff, &KindedPath::parse("/u/gone").unwrap()),
            Projection::Removed
        );
    }

    #[test]
    fn project_flags_hard_operators() {
        let diff = obj([("u", obj([("a.b", Node::int(1))]).with_tag("dive"))]);
        assert_eq!(
            project(&diff, &KindedPath::parse("/u/a").unwrap()),
            Projection::NeedsRoot
        );
    }

    #[test]
    fn graft_and_collect_roots() {
        let mut merged = Node::object::<String>([]);
        graft(
            &mut merged,
            &KindedPath::parse("/x").unwrap(),
            obj([("n", Node::int(1))]),
        );
        graft(
            &mut merged,
            &KindedPath::parse("/y").unwrap(),
            obj([("n", Node::int(2))]),
        );
        let roots = collect_patch_roots(&merged);
        let paths: Vec<String> = roots.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["/x", "/y"]);
        assert!(roots.iter().all(|(_, node)| node.tag() == TAG_PATCH_ROOT));
    }

    #[test]
    fn apply_events_streams_object_merge() {
        let base = obj([
            ("keep", obj([("deep", Node::int(1))])),
            ("change", Node::int(2)),
            ("drop", Node::int(3)),
        ]);
        let diff = obj([
            ("change", Node::int(20)),
            ("drop", Node::null().with_tag("delete")),
            ("fresh", Node::string("new")),
        ]);

        let bytes = node_to_events(&base);
        let mut reader = EventReader::new(&bytes);
        let mut writer = EventWriter::new();
        apply_events(&mut reader, &diff, &mut writer).unwrap();

        let out_bytes = writer.into_bytes();
        let mut out_reader = EventReader::new(&out_bytes);
        let streamed = out_reader.read_node().unwrap().unwrap();
        let reference = apply(Some(base), &diff).unwrap();
        assert_eq!(streamed, reference);
    }

    #[test]
    fn apply_events_from_empty_base() {
        let diff = obj([("n", Node::int(1))]);
        let mut reader = EventReader::new(&[]);
        let mut writer = EventWriter::new();
        apply_events(&mut reader, &diff, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(
            EventReader::new(&bytes).read_node().unwrap().unwrap(),
            obj([("n", Node::int(1))])
        );
    }

    #[test]
    fn strip_patch_root_tags_recurses() {
        let mut node = obj([("x", obj([("n", Node::int(1))]).with_tag(TAG_PATCH_ROOT))]);
        strip_patch_root_tags(&mut node);
        assert_eq!(node, obj([("x", obj([("n", Node::int(1))]))]));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_base() -> impl Strategy<Value = Node> {
            let leaf = prop_oneof![
                any::<i64>().prop_map(Node::int),
                "[a-z]{0,6}".prop_map(Node::string),
                Just(Node::null()),
            ];
            leaf.prop_recursive(3, 16, 4, |inner| {
                prop::collection::btree_map("[a-e]", inner, 0..4)
                    .prop_map(|m| Node::from_value(crate::node::Value::Object(m)))
            })
        }

        fn arb_diff() -> impl Strategy<Value = Node> {
            let leaf = prop_oneof![
                any::<i64>().prop_map(Node::int),
                Just(Node::null().with_tag("delete")),
                Just(Node::int(0).with_tag("nullify")),
                "[a-z]{0,6}".prop_map(|s| Node::string(s).with_tag("replace")),
            ];
            leaf.prop_recursive(3, 16, 4, |inner| {
                prop::collection::btree_map("[a-e]", inner, 0..4)
                    .prop_map(|m| Node::from_value(crate::node::Value::Object(m)))
            })
        }

        proptest! {
            /// The streaming applier and the tree applier agree on every
            /// object-merge diff.
            #[test]
            fn streaming_matches_tree_semantics(base in arb_base(), diff in arb_diff()) {
                let bytes = node_to_events(&base);
                let mut reader = EventReader::new(&bytes);
                let mut writer = EventWriter::new();
                apply_events(&mut reader, &diff, &mut writer).unwrap();

                let out = writer.into_bytes();
                let streamed = EventReader::new(&out).read_node().unwrap();
                let reference = apply(Some(base), &diff);
                prop_assert_eq!(streamed, reference);
            }

            /// Projection at a top-level key agrees with applying the whole
            /// diff at the root and navigating.
            #[test]
            fn projection_matches_navigation(base in arb_base(), diff in arb_diff(), key in "[a-e]") {
                let path = KindedPath::parse(&key).unwrap();
                let whole = apply(Some(base.clone()), &diff);
                let navigated = whole.as_ref().and_then(|node| node.at_path(&path).cloned());

                let projected = match project(&diff, &path) {
                    Projection::Unchanged => base.at_path(&path).cloned(),
                    Projection::Removed => None,
                    Projection::Apply(sub) => apply(base.at_path(&path).cloned(), &sub),
                    Projection::NeedsRoot => whole.as_ref().and_then(|n| n.at_path(&path).cloned()),
                };
                prop_assert_eq!(projected, navigated);
            }
        }
    }
}
