//! Log entry framing.
//!
//! The entry format is the durable contract of the store: independent
//! implementations must produce byte-identical entries. Each entry is
//! self-delimited and checksummed:
//!
//! ```text
//! entry  := len:u32 body crc32c(body):u32
//! body   := commit:u64 tx_seq:u64 last_commit:u64
//!           varint(ts_len) ts_rfc3339
//!           flags:u8
//!           [varint(scope_len) scope]           -- flags & SCOPE
//!           [schema_state:u8 varint(len) name]  -- flags & SCHEMA
//!           payload
//! payload := node                               -- patch entries
//!          | varint(count) (varint(len) path u32:offset)*
//!            varint(events_len) events          -- snapshot entries
//! ```
//!
//! All integers little endian; varints base-128. `decode_from` returns
//! `Ok(None)` at a clean end of file.

use std::fmt;
use std::io::{self, Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use logd_value::encode::{decode_node, encode_node};
use logd_value::varint::{decode_varint, encode_varint};
use logd_value::{BufReader, BufWriter, DecodeError, KindedPath, Node};

use crate::error::ChecksumMismatch;

const FLAG_SCOPE: u8 = 0b0000_0001;
const FLAG_SNAPSHOT: u8 = 0b0000_0010;
const FLAG_SCHEMA: u8 = 0b0000_0100;

/// Upper bound on a single entry; a longer length prefix indicates
/// corruption, not a real entry.
pub const MAX_ENTRY_LEN: u32 = 1 << 30;

/// Identifier of a copy-on-write scope. The baseline is the absence of
/// one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        ScopeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaState {
    Pending,
    Active,
    Aborted,
}

impl SchemaState {
    fn to_byte(self) -> u8 {
        match self {
            SchemaState::Pending => 0,
            SchemaState::Active => 1,
            SchemaState::Aborted => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(match byte {
            0 => SchemaState::Pending,
            1 => SchemaState::Active,
            2 => SchemaState::Aborted,
            byte => return Err(DecodeError::InvalidTag { byte, kind: "schema state" }),
        })
    }
}

/// A schema lifecycle marker riding on a snapshot entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMarker {
    pub schema: String,
    pub state: SchemaState,
}

/// A snapshot payload: a path-offset table over a pre-order event stream
/// of the full state.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotPayload {
    /// Byte offsets of indexed subtrees within `events`, ascending by
    /// offset. Always contains the root at offset 0.
    pub offsets: Vec<(KindedPath, u32)>,
    pub events: Vec<u8>,
}

impl SnapshotPayload {
    /// Offset of the deepest indexed ancestor of `path`, with the
    /// remainder still to be walked.
    pub fn locate(&self, path: &KindedPath) -> (u32, KindedPath) {
        let mut best: (u32, KindedPath) = (0, path.clone());
        let mut best_len = 0usize;
        for (indexed, offset) in &self.offsets {
            if indexed.len() >= best_len && indexed.is_prefix_of(path) {
                if let Some(rest) = indexed.strip_prefix(path) {
                    best = (*offset, rest);
                    best_len = indexed.len();
                }
            }
        }
        best
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryBody {
    /// The merged patch of one transaction.
    Patch(Node),
    /// A materialised full state.
    Snapshot(SnapshotPayload),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub commit: u64,
    pub tx_seq: u64,
    pub last_commit: u64,
    pub timestamp: DateTime<Utc>,
    pub scope: Option<ScopeId>,
    pub schema: Option<SchemaMarker>,
    pub body: EntryBody,
}

impl LogEntry {
    pub fn is_snapshot(&self) -> bool {
        matches!(self.body, EntryBody::Snapshot(_))
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.put_u64(self.commit);
        out.put_u64(self.tx_seq);
        out.put_u64(self.last_commit);
        put_str(
            out,
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        );

        let mut flags = 0u8;
        if self.scope.is_some() {
            flags |= FLAG_SCOPE;
        }
        if self.is_snapshot() {
            flags |= FLAG_SNAPSHOT;
        }
        if self.schema.is_some() {
            flags |= FLAG_SCHEMA;
        }
        out.put_u8(flags);

        if let Some(scope) = &self.scope {
            put_str(out, scope.as_str());
        }
        if let Some(marker) = &self.schema {
            out.put_u8(marker.state.to_byte());
            put_str(out, &marker.schema);
        }

        match &self.body {
            EntryBody::Patch(patch) => encode_node(patch, out),
            EntryBody::Snapshot(snapshot) => {
                encode_varint(snapshot.offsets.len() as u64, out);
                for (path, offset) in &snapshot.offsets {
                    put_str(out, &path.to_string());
                    out.put_u32(*offset);
                }
                encode_varint(snapshot.events.len() as u64, out);
                out.put_slice(&snapshot.events);
            }
        }
    }

    fn decode_body(mut reader: &[u8]) -> Result<Self, DecodeError> {
        let commit = reader.get_u64()?;
        let tx_seq = reader.get_u64()?;
        let last_commit = reader.get_u64()?;
        let raw_ts = get_str(&mut reader, "entry timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|_| DecodeError::InvalidUtf8 { context: "entry timestamp" })?
            .with_timezone(&Utc);

        let flags = reader.get_u8()?;
        let scope = if flags & FLAG_SCOPE != 0 {
            Some(ScopeId::new(get_str(&mut reader, "entry scope")?))
        } else {
            None
        };
        let schema = if flags & FLAG_SCHEMA != 0 {
            let state = SchemaState::from_byte(reader.get_u8()?)?;
            let name = get_str(&mut reader, "schema name")?;
            Some(SchemaMarker { schema: name.to_string(), state })
        } else {
            None
        };

        let body = if flags & FLAG_SNAPSHOT != 0 {
            let count = decode_varint(&mut reader)? as usize;
            let mut offsets = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let raw_path = get_str(&mut reader, "snapshot offset path")?;
                let path = KindedPath::parse(raw_path).map_err(|_| DecodeError::InvalidTag {
                    byte: 0,
                    kind: "snapshot offset path",
                })?;
                let offset = reader.get_u32()?;
                offsets.push((path, offset));
            }
            let events_len = decode_varint(&mut reader)? as usize;
            let events = reader.get_slice(events_len)?.to_vec();
            EntryBody::Snapshot(SnapshotPayload { offsets, events })
        } else {
            EntryBody::Patch(decode_node(&mut reader)?)
        };

        if reader.remaining() != 0 {
            return Err(DecodeError::InvalidTag {
                byte: 0,
                kind: "trailing bytes after entry body",
            });
        }

        Ok(LogEntry {
            commit,
            tx_seq,
            last_commit,
            timestamp,
            scope,
            schema,
            body,
        })
    }

    /// Serialise and write `self`, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, mut out: W) -> io::Result<u64> {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        debug_assert!(body.len() as u64 <= MAX_ENTRY_LEN as u64);

        let crc = crc32c::crc32c(&body);
        out.write_all(&(body.len() as u32).to_le_bytes())?;
        out.write_all(&body)?;
        out.write_all(&crc.to_le_bytes())?;
        Ok(Self::FRAMING_LEN + body.len() as u64)
    }

    /// Length prefix plus trailing checksum.
    pub const FRAMING_LEN: u64 = 4 + 4;

    /// Read one entry. Returns `Ok(None)` if the reader is at EOF.
    ///
    /// `pos` is only used to contextualise errors.
    pub fn decode_from<R: Read>(mut reader: R, pos: u64) -> io::Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_ENTRY_LEN {
            return Err(invalid_data(format!("implausible entry length {len} at offset {pos}")));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body)?;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let want = u32::from_le_bytes(crc_buf);
        if crc32c::crc32c(&body) != want {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ChecksumMismatch { pos },
            ));
        }

        Self::decode_body(&body)
            .map(Some)
            .map_err(|e| invalid_data(format!("bad entry body at offset {pos}: {e}")))
    }
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    encode_varint(s.len() as u64, out);
    out.put_slice(s.as_bytes());
}

fn get_str<'a>(reader: &mut &'a [u8], context: &'static str) -> Result<&'a str, DecodeError> {
    let len = decode_varint(reader)? as usize;
    reader.get_str(len, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use logd_value::event::node_to_events;
    use pretty_assertions::assert_eq;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap()
    }

    fn patch_entry() -> LogEntry {
        LogEntry {
            commit: 7,
            tx_seq: 12,
            last_commit: 6,
            timestamp: ts(),
            scope: Some(ScopeId::new("sandbox")),
            schema: None,
            body: EntryBody::Patch(Node::object([("n", Node::int(1))]).with_tag("patch-root")),
        }
    }

    #[test]
    fn patch_entry_roundtrip() {
        let entry = patch_entry();
        let mut buf = Vec::new();
        let written = entry.write_to(&mut buf).unwrap();
        assert_eq!(written as usize, buf.len());

        let decoded = LogEntry::decode_from(&buf[..], 0).unwrap().unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn snapshot_entry_roundtrip() {
        let state = Node::object([("users", Node::object([("alice", Node::int(1))]))]);
        let entry = LogEntry {
            commit: 3,
            tx_seq: 0,
            last_commit: 3,
            timestamp: ts(),
            scope: None,
            schema: Some(SchemaMarker {
                schema: "v2".into(),
                state: SchemaState::Active,
            }),
            body: EntryBody::Snapshot(SnapshotPayload {
                offsets: vec![
                    (KindedPath::root(), 0),
                    (KindedPath::parse("/users").unwrap(), 9),
                ],
                events: node_to_events(&state),
            }),
        };
        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();
        let decoded = LogEntry::decode_from(&buf[..], 0).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.is_snapshot());
    }

    #[test]
    fn eof_is_none_and_flipped_bit_is_checksum_error() {
        assert!(LogEntry::decode_from(&[][..], 0).unwrap().is_none());

        let mut buf = Vec::new();
        patch_entry().write_to(&mut buf).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0x01;
        let err = LogEntry::decode_from(&buf[..], 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_entry_is_eof_error() {
        let mut buf = Vec::new();
        patch_entry().write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let err = LogEntry::decode_from(&buf[..], 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn locate_prefers_deepest_indexed_ancestor() {
        let payload = SnapshotPayload {
            offsets: vec![
                (KindedPath::root(), 0),
                (KindedPath::parse("/users").unwrap(), 10),
                (KindedPath::parse("/users/alice").unwrap(), 20),
            ],
            events: Vec::new(),
        };
        let (offset, rest) = payload.locate(&KindedPath::parse("/users/alice/name").unwrap());
        assert_eq!(offset, 20);
        assert_eq!(rest, KindedPath::parse("name").unwrap());

        let (offset, rest) = payload.locate(&KindedPath::parse("/other").unwrap());
        assert_eq!(offset, 0);
        assert_eq!(rest, KindedPath::parse("/other").unwrap());
    }
}
