//! Deterministic binary encoding of value trees.
//!
//! This is part of the durable log format: two processes must produce
//! byte-identical encodings for equal trees. Determinism comes from the
//! sorted object representation and from the fixed field order below.
//!
//! ```text
//! node   := varint(tag_len) tag_bytes kind:u8 payload
//! kind   := 0 null | 1 false | 2 true | 3 int | 4 float
//!         | 5 string | 6 array | 7 object
//! int    := zigzag varint
//! float  := f64 bits, little endian
//! string := varint(len) bytes
//! array  := varint(count) node*
//! object := varint(count) (varint(key_len) key node)*   -- keys ascending
//! ```

use std::collections::BTreeMap;

use crate::buffer::{BufReader, BufWriter, DecodeError};
use crate::node::{Node, Value};
use crate::varint::{decode_varint, decode_varint_signed, encode_varint, encode_varint_signed};

const KIND_NULL: u8 = 0;
const KIND_FALSE: u8 = 1;
const KIND_TRUE: u8 = 2;
const KIND_INT: u8 = 3;
const KIND_FLOAT: u8 = 4;
const KIND_STRING: u8 = 5;
const KIND_ARRAY: u8 = 6;
const KIND_OBJECT: u8 = 7;

pub fn encode_node(node: &Node, out: &mut impl BufWriter) {
    encode_str(node.tag(), out);
    match node.value() {
        Value::Null => out.put_u8(KIND_NULL),
        Value::Bool(false) => out.put_u8(KIND_FALSE),
        Value::Bool(true) => out.put_u8(KIND_TRUE),
        Value::Int(i) => {
            out.put_u8(KIND_INT);
            encode_varint_signed(*i, out);
        }
        Value::Float(x) => {
            out.put_u8(KIND_FLOAT);
            out.put_u64(x.to_bits());
        }
        Value::String(s) => {
            out.put_u8(KIND_STRING);
            encode_str(s, out);
        }
        Value::Array(elems) => {
            out.put_u8(KIND_ARRAY);
            encode_varint(elems.len() as u64, out);
            for elem in elems {
                encode_node(elem, out);
            }
        }
        Value::Object(fields) => {
            out.put_u8(KIND_OBJECT);
            encode_varint(fields.len() as u64, out);
            for (key, val) in fields {
                encode_str(key, out);
                encode_node(val, out);
            }
        }
    }
}

pub fn decode_node<'a>(reader: &mut impl BufReader<'a>) -> Result<Node, DecodeError> {
    let tag = decode_str(reader, "node tag")?;
    let kind = reader.get_u8()?;
    let value = match kind {
        KIND_NULL => Value::Null,
        KIND_FALSE => Value::Bool(false),
        KIND_TRUE => Value::Bool(true),
        KIND_INT => Value::Int(decode_varint_signed(reader)?),
        KIND_FLOAT => Value::Float(f64::from_bits(reader.get_u64()?)),
        KIND_STRING => Value::String(decode_str(reader, "string value")?.to_string()),
        KIND_ARRAY => {
            let count = decode_varint(reader)? as usize;
            let mut elems = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                elems.push(decode_node(reader)?);
            }
            Value::Array(elems)
        }
        KIND_OBJECT => {
            let count = decode_varint(reader)? as usize;
            let mut fields = BTreeMap::new();
            for _ in 0..count {
                let key = decode_str(reader, "object key")?.to_string();
                fields.insert(key, decode_node(reader)?);
            }
            Value::Object(fields)
        }
        byte => return Err(DecodeError::InvalidTag { byte, kind: "node kind" }),
    };
    let mut node = Node::from_value(value);
    if !tag.is_empty() {
        node.set_tag(tag);
    }
    Ok(node)
}

pub(crate) fn encode_str(s: &str, out: &mut impl BufWriter) {
    encode_varint(s.len() as u64, out);
    out.put_slice(s.as_bytes());
}

pub(crate) fn decode_str<'a>(
    reader: &mut impl BufReader<'a>,
    context: &'static str,
) -> Result<&'a str, DecodeError> {
    let len = decode_varint(reader)? as usize;
    reader.get_str(len, context)
}

/// Convenience: encode to a fresh buffer.
pub fn node_to_bytes(node: &Node) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_node(node, &mut buf);
    buf
}

/// Convenience: decode a node that fills `bytes` exactly.
pub fn node_from_bytes(bytes: &[u8]) -> Result<Node, DecodeError> {
    let mut reader = bytes;
    let node = decode_node(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(DecodeError::InvalidTag {
            byte: reader.get_u8()?,
            kind: "trailing bytes after node",
        });
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_nested() {
        let node = Node::object([
            ("name", Node::string("alice")),
            ("age", Node::int(30)),
            ("score", Node::float(-0.5)),
            (
                "tags",
                Node::array([Node::string("a"), Node::null(), Node::bool(true)]),
            ),
            ("meta", Node::object([("k", Node::string("v"))]).with_tag("int-keyed-map")),
        ]);
        assert_eq!(node_from_bytes(&node_to_bytes(&node)).unwrap(), node);
    }

    #[test]
    fn deterministic_across_insertion_order() {
        let forward = Node::object([("a", Node::int(1)), ("b", Node::int(2))]);
        let backward = Node::object([("b", Node::int(2)), ("a", Node::int(1))]);
        assert_eq!(node_to_bytes(&forward), node_to_bytes(&backward));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = node_to_bytes(&Node::int(1));
        buf.push(0);
        assert!(node_from_bytes(&buf).is_err());
    }

    fn arb_node() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            Just(Node::null()),
            any::<bool>().prop_map(Node::bool),
            any::<i64>().prop_map(Node::int),
            // NaN breaks PartialEq-based comparison, keep floats finite.
            (-1e9f64..1e9).prop_map(Node::float),
            "[a-z]{0,8}".prop_map(Node::string),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Node::array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Node::from_value(Value::Object(m))),
            ]
        })
    }

    proptest! {
        #[test]
        fn roundtrip_any(node in arb_node()) {
            prop_assert_eq!(node_from_bytes(&node_to_bytes(&node)).unwrap(), node);
        }
    }
}
