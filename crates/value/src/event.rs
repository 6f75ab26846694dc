//! Pre-order stream events over value trees.
//!
//! Snapshot payloads store a value tree as a flat event stream so that a
//! reader can be positioned at any subtree by byte offset and stream from
//! there without decoding the rest of the tree. The event form carries the
//! same information as the node encoding, rearranged for streaming:
//!
//! ```text
//! event  := END
//!         | scalar-op varint(tag_len) tag payload      -- null/bool/int/float/string
//!         | BEGIN_ARRAY varint(tag_len) tag
//!         | BEGIN_OBJECT varint(tag_len) tag
//!         | FIELD varint(name_len) name
//! ```
//!
//! A value is one scalar event, or a `BEGIN_*` event followed by its
//! contents and a matching `END`. Object contents are `FIELD` + value
//! pairs, fields in ascending key order.

use std::collections::BTreeMap;

use crate::buffer::{BufReader, BufWriter, DecodeError};
use crate::encode::{decode_str, encode_str};
use crate::node::{Node, Value};
use crate::varint::{decode_varint_signed, encode_varint_signed};

const OP_END: u8 = 0;
const OP_NULL: u8 = 1;
const OP_FALSE: u8 = 2;
const OP_TRUE: u8 = 3;
const OP_INT: u8 = 4;
const OP_FLOAT: u8 = 5;
const OP_STRING: u8 = 6;
const OP_BEGIN_ARRAY: u8 = 7;
const OP_BEGIN_OBJECT: u8 = 8;
const OP_FIELD: u8 = 9;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A complete scalar value (null, bool, number or string), with tag.
    Scalar(Node),
    BeginArray { tag: String },
    BeginObject { tag: String },
    Field(String),
    End,
}

/// Writes events into a growing buffer, tracking byte offsets so callers
/// can index the positions of subtrees (the snapshot path-offset table).
#[derive(Debug, Default)]
pub struct EventWriter {
    buf: Vec<u8>,
}

impl EventWriter {
    pub fn new() -> Self {
        EventWriter::default()
    }

    /// Byte offset the next event will be written at.
    pub fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Splice pre-encoded event bytes (as produced by another writer or by
    /// [`EventReader::copy_value`]) into the stream.
    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_event(&mut self, event: &Event) {
        match event {
            Event::Scalar(node) => self.write_scalar(node),
            Event::BeginArray { tag } => {
                self.buf.put_u8(OP_BEGIN_ARRAY);
                encode_str(tag, &mut self.buf);
            }
            Event::BeginObject { tag } => {
                self.buf.put_u8(OP_BEGIN_OBJECT);
                encode_str(tag, &mut self.buf);
            }
            Event::Field(name) => {
                self.buf.put_u8(OP_FIELD);
                encode_str(name, &mut self.buf);
            }
            Event::End => self.buf.put_u8(OP_END),
        }
    }

    fn write_scalar(&mut self, node: &Node) {
        let op = match node.value() {
            Value::Null => OP_NULL,
            Value::Bool(false) => OP_FALSE,
            Value::Bool(true) => OP_TRUE,
            Value::Int(_) => OP_INT,
            Value::Float(_) => OP_FLOAT,
            Value::String(_) => OP_STRING,
            Value::Array(_) | Value::Object(_) => unreachable!("scalar event with container value"),
        };
        self.buf.put_u8(op);
        encode_str(node.tag(), &mut self.buf);
        match node.value() {
            Value::Int(i) => encode_varint_signed(*i, &mut self.buf),
            Value::Float(x) => self.buf.put_u64(x.to_bits()),
            Value::String(s) => encode_str(s, &mut self.buf),
            _ => {}
        }
    }

    /// Write a whole node as events, pre-order.
    pub fn write_node(&mut self, node: &Node) {
        match node.value() {
            Value::Array(elems) => {
                self.write_event(&Event::BeginArray { tag: node.tag().to_string() });
                for elem in elems {
                    self.write_node(elem);
                }
                self.write_event(&Event::End);
            }
            Value::Object(fields) => {
                self.write_event(&Event::BeginObject { tag: node.tag().to_string() });
                for (key, val) in fields {
                    self.write_event(&Event::Field(key.clone()));
                    self.write_node(val);
                }
                self.write_event(&Event::End);
            }
            _ => self.write_scalar(node),
        }
    }
}

/// Streaming reader over an event buffer.
#[derive(Clone, Debug)]
pub struct EventReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EventReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        EventReader { buf, pos: 0 }
    }

    /// A reader positioned at `offset` (as previously reported by
    /// [`EventWriter::offset`]).
    pub fn at_offset(buf: &'a [u8], offset: u32) -> Self {
        EventReader { buf, pos: offset as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    /// Decode the next event, or `None` at the end of the buffer.
    pub fn next_event(&mut self) -> Result<Option<Event>, DecodeError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut reader = self.rest();
        let op = reader.get_u8()?;
        let event = match op {
            OP_END => Event::End,
            OP_NULL | OP_FALSE | OP_TRUE | OP_INT | OP_FLOAT | OP_STRING => {
                let tag = decode_str(&mut reader, "event tag")?;
                let value = match op {
                    OP_NULL => Value::Null,
                    OP_FALSE => Value::Bool(false),
                    OP_TRUE => Value::Bool(true),
                    OP_INT => Value::Int(decode_varint_signed(&mut reader)?),
                    OP_FLOAT => Value::Float(f64::from_bits(reader.get_u64()?)),
                    _ => Value::String(decode_str(&mut reader, "event string")?.to_string()),
                };
                let mut node = Node::from_value(value);
                if !tag.is_empty() {
                    node.set_tag(tag);
                }
                Event::Scalar(node)
            }
            OP_BEGIN_ARRAY => Event::BeginArray {
                tag: decode_str(&mut reader, "event tag")?.to_string(),
            },
            OP_BEGIN_OBJECT => Event::BeginObject {
                tag: decode_str(&mut reader, "event tag")?.to_string(),
            },
            OP_FIELD => Event::Field(decode_str(&mut reader, "field name")?.to_string()),
            byte => return Err(DecodeError::InvalidTag { byte, kind: "event opcode" }),
        };
        self.pos = self.buf.len() - reader.remaining();
        Ok(Some(event))
    }

    /// Materialise the next value into a [`Node`]. Returns `None` at end
    /// of stream (the empty stream encodes the absent value).
    pub fn read_node(&mut self) -> Result<Option<Node>, DecodeError> {
        let Some(event) = self.next_event()? else {
            return Ok(None);
        };
        self.finish_node(event).map(Some)
    }

    fn finish_node(&mut self, head: Event) -> Result<Node, DecodeError> {
        match head {
            Event::Scalar(node) => Ok(node),
            Event::BeginArray { tag } => {
                let mut elems = Vec::new();
                loop {
                    match self.expect_event("array element")? {
                        Event::End => break,
                        event => elems.push(self.finish_node(event)?),
                    }
                }
                Ok(attach_tag(Node::array(elems), tag))
            }
            Event::BeginObject { tag } => {
                let mut fields = BTreeMap::new();
                loop {
                    match self.expect_event("object field")? {
                        Event::End => break,
                        Event::Field(name) => {
                            let head = self.expect_event("field value")?;
                            fields.insert(name, self.finish_node(head)?);
                        }
                        _ => {
                            return Err(DecodeError::InvalidTag {
                                byte: OP_FIELD,
                                kind: "expected field or end inside object",
                            })
                        }
                    }
                }
                Ok(attach_tag(Node::from_value(Value::Object(fields)), tag))
            }
            Event::Field(_) | Event::End => Err(DecodeError::InvalidTag {
                byte: OP_END,
                kind: "value cannot start with field/end",
            }),
        }
    }

    fn expect_event(&mut self, context: &'static str) -> Result<Event, DecodeError> {
        self.next_event()?.ok_or(DecodeError::BufferLength {
            wanted: 1,
            have: 0,
        })
        .map_err(|_| DecodeError::InvalidTag { byte: OP_END, kind: context })
    }

    /// Skip over the next complete value without materialising it.
    pub fn skip_value(&mut self) -> Result<(), DecodeError> {
        let mut depth = 0usize;
        loop {
            match self.expect_event("value to skip")? {
                Event::BeginArray { .. } | Event::BeginObject { .. } => depth += 1,
                Event::End => match depth {
                    0 => {
                        return Err(DecodeError::InvalidTag {
                            byte: OP_END,
                            kind: "end marker where a value was expected",
                        })
                    }
                    1 => return Ok(()),
                    _ => depth -= 1,
                },
                Event::Field(_) => {}
                Event::Scalar(_) => {
                    if depth == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// `true` if the next event starts a value (not `End`, not end of
    /// stream). Does not consume anything.
    fn peek_is_value(&self) -> Result<bool, DecodeError> {
        let mut probe = self.clone();
        Ok(!matches!(probe.next_event()?, Some(Event::End) | None))
    }

    /// Byte-copy the next complete value into `out`.
    pub fn copy_value(&mut self, out: &mut EventWriter) -> Result<(), DecodeError> {
        let start = self.pos;
        self.skip_value()?;
        out.buf.extend_from_slice(&self.buf[start..self.pos]);
        Ok(())
    }

    /// Position this reader at the value of `path` below the current value.
    ///
    /// Consumes events up to (not including) the target value. Returns
    /// `false` -- leaving the position unspecified -- if the path does not
    /// resolve; callers treat that as the absent value.
    pub fn seek_path(&mut self, path: &crate::path::KindedPath) -> Result<bool, DecodeError> {
        use crate::path::PathSeg;

        'segs: for seg in path.segs() {
            match self.next_event()? {
                Some(Event::BeginObject { .. }) => {
                    let PathSeg::Key(want) = seg else { return Ok(false) };
                    loop {
                        match self.expect_event("object field")? {
                            Event::Field(name) if name == *want => continue 'segs,
                            Event::Field(_) => self.skip_value()?,
                            _ => return Ok(false),
                        }
                    }
                }
                Some(Event::BeginArray { .. }) => match seg {
                    PathSeg::Index(want) => {
                        for _ in 0..*want {
                            if !self.peek_is_value()? {
                                return Ok(false);
                            }
                            self.skip_value()?;
                        }
                        if !self.peek_is_value()? {
                            return Ok(false);
                        }
                        continue 'segs;
                    }
                    // Keyed lookups need to inspect elements; not resolvable
                    // by pure seeking. Callers fall back to materialising.
                    _ => return Ok(false),
                },
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

fn attach_tag(mut node: Node, tag: String) -> Node {
    if !tag.is_empty() {
        node.set_tag(tag);
    }
    node
}

/// Encode a node as a standalone event buffer.
pub fn node_to_events(node: &Node) -> Vec<u8> {
    let mut writer = EventWriter::new();
    writer.write_node(node);
    writer.into_bytes()
}
