//! Predicate trees evaluated against base trees.
//!
//! A match tree is a [`Node`] whose tags select combinators and
//! predicates; untagged nodes match structurally. Evaluation is pure and
//! never touches I/O. Conditional commits, the `if` patch operator and
//! read-side filters all share this.

use glob::Pattern;

use crate::node::{Node, Value};

/// Evaluate `m` against `base`. `None` is the absent value: nothing but an
/// explicitly negated predicate matches it.
pub fn matches(base: Option<&Node>, m: &Node) -> bool {
    match m.tag() {
        "and" => match m.as_array() {
            Some(children) => children.iter().all(|child| matches(base, child)),
            None => matches_untagged(base, m),
        },
        "or" => match m.as_array() {
            Some(children) => children.iter().any(|child| matches(base, child)),
            None => matches_untagged(base, m),
        },
        "not" => {
            let inner = match m.as_array() {
                Some([single]) => single,
                _ => m,
            };
            // `not` over an array of one child negates the child; a bare
            // tagged value negates its own structural match.
            if m.as_array().map(<[Node]>::len) == Some(1) {
                !matches(base, inner)
            } else {
                !matches_untagged(base, m)
            }
        }
        "subtree" => {
            let inner = match m.as_array() {
                Some([single]) => single,
                _ => m,
            };
            matches_anywhere(base, inner)
        }
        "type" => match (base, m.as_str()) {
            (Some(node), Some(want)) => kind_matches(node, want),
            _ => false,
        },
        "glob" => match (base.and_then(Node::as_str), m.as_str()) {
            (Some(text), Some(raw)) => Pattern::new(raw)
                .map(|pattern| pattern.matches(text))
                .unwrap_or(false),
            _ => false,
        },
        "field" => match (base.and_then(Node::as_object), m.as_str()) {
            (Some(fields), Some(name)) => fields.contains_key(name),
            _ => false,
        },
        "tag" => match (base, m.as_str()) {
            (Some(node), Some(want)) => node.tag() == want,
            _ => false,
        },
        _ => matches_untagged(base, m),
    }
}

fn matches_untagged(base: Option<&Node>, m: &Node) -> bool {
    let Some(base) = base else { return false };
    match (m.value(), base.value()) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, sub)| {
            // Tagged children evaluate even against a missing field, so
            // `not`/`or` can assert absence.
            matches(have.get(key), sub)
        }),
        (Value::Object(_), _) => false,
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have).all(|(sub, elem)| matches(Some(elem), sub))
        }
        (Value::Array(_), _) => false,
        // Scalar equality ignores tags on both sides.
        (want, have) => scalar_eq(want, have),
    }
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn matches_anywhere(base: Option<&Node>, m: &Node) -> bool {
    if matches(base, m) {
        return true;
    }
    let Some(base) = base else { return false };
    match base.value() {
        Value::Array(elems) => elems.iter().any(|elem| matches_anywhere(Some(elem), m)),
        Value::Object(fields) => fields.values().any(|val| matches_anywhere(Some(val), m)),
        _ => false,
    }
}

fn kind_matches(node: &Node, want: &str) -> bool {
    match want {
        "int" => matches!(node.value(), Value::Int(_)),
        "float" => matches!(node.value(), Value::Float(_)),
        other => node.kind().name() == other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj<const N: usize>(fields: [(&str, Node); N]) -> Node {
        Node::object(fields)
    }

    fn base() -> Node {
        obj([
            ("name", Node::string("alice")),
            ("age", Node::int(30)),
            (
                "pets",
                Node::array([obj([("kind", Node::string("cat"))])]),
            ),
        ])
    }

    #[test]
    fn structural_match() {
        let base = base();
        assert!(matches(Some(&base), &obj([("name", Node::string("alice"))])));
        assert!(!matches(Some(&base), &obj([("name", Node::string("bob"))])));
        assert!(!matches(Some(&base), &obj([("missing", Node::int(1))])));
        assert!(!matches(None, &obj([("name", Node::string("alice"))])));
    }

    #[test]
    fn arrays_require_same_length() {
        let base = Node::array([Node::int(1), Node::int(2)]);
        assert!(matches(Some(&base), &Node::array([Node::int(1), Node::int(2)])));
        assert!(!matches(Some(&base), &Node::array([Node::int(1)])));
    }

    #[test]
    fn combinators() {
        let base = base();
        let young = obj([("age", Node::int(30))]);
        let named_bob = obj([("name", Node::string("bob"))]);
        assert!(matches(
            Some(&base),
            &Node::array([young.clone(), named_bob.clone()]).with_tag("or")
        ));
        assert!(!matches(
            Some(&base),
            &Node::array([young.clone(), named_bob.clone()]).with_tag("and")
        ));
        assert!(matches(
            Some(&base),
            &Node::array([named_bob]).with_tag("not")
        ));
    }

    #[test]
    fn not_asserts_absence_of_field() {
        let base = base();
        let m = obj([("email", Node::array([obj([])]).with_tag("not"))]);
        // "email" is absent, the inner {} cannot match the absent value,
        // so the negation holds.
        assert!(matches(Some(&base), &m));
    }

    #[test]
    fn subtree_searches_descendants() {
        let base = base();
        let m = Node::array([obj([("kind", Node::string("cat"))])]).with_tag("subtree");
        assert!(matches(Some(&base), &m));
        let miss = Node::array([obj([("kind", Node::string("fish"))])]).with_tag("subtree");
        assert!(!matches(Some(&base), &miss));
    }

    #[test]
    fn predicates() {
        let base = base();
        assert!(matches(Some(&base), &Node::string("object").with_tag("type")));
        assert!(matches(
            Some(base.get("age").unwrap()),
            &Node::string("int").with_tag("type")
        ));
        assert!(matches(
            Some(base.get("name").unwrap()),
            &Node::string("al*").with_tag("glob")
        ));
        assert!(matches(Some(&base), &Node::string("pets").with_tag("field")));
        assert!(!matches(Some(&base), &Node::string("email").with_tag("field")));

        let tagged = Node::int(1).with_tag("int-keyed-map");
        assert!(matches(Some(&tagged), &Node::string("int-keyed-map").with_tag("tag")));
    }

    #[test]
    fn numbers_compare_across_int_float() {
        assert!(matches(Some(&Node::float(30.0)), &Node::int(30)));
        assert!(!matches(Some(&Node::float(30.5)), &Node::int(30)));
    }
}
