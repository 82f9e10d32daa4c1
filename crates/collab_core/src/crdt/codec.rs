//! Binary encoding of changes and state vectors.
//!
//! Integers use the y-protocols varUint format (7 bits per byte, MSB set
//! on continuation). Strings and byte arrays are length-prefixed.
//!
//! # Change batch layout
//!
//! ```text
//! varUint(count)
//! per change:
//!   varUint(replica) varUint(seq) varUint(lamport) u8(kind)
//!   kind 0 InsertText: id(parent) opt_id(after) varString(text) marks
//!   kind 1 InsertNode: id(parent) opt_id(after) u8(node type) attrs
//!   kind 2 Delete:     varUint(n) id*
//!   kind 3 SetAttr:    id(node) varString(key) opt_value
//!   kind 4 SetMark:    varUint(n) id* u8(mark type) opt(attrs)
//! ```

use crate::error::{CollabError, Result};
use crate::model::{AttrValue, Attrs, Mark, MarkType, NodeType};

use super::change::{Change, ChangeKind};
use super::ids::{OpId, ReplicaId, StateVector};

// ===========================================================================
// VarUint encoding/decoding (y-protocols compatible)
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
pub fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80; // Set continuation bit
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer from a buffer.
/// Returns (value, bytes_consumed) or None if buffer is too short.
pub fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None; // Overflow
        }
    }
    None // Incomplete
}

/// Write a byte array with length prefix (varUint encoding).
pub fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Write a UTF-8 string with length prefix.
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_byte_array(buf, s.as_bytes());
}

/// Cursor over an encoded buffer.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn err(&self, what: &str) -> CollabError {
        CollabError::Decode(format!("truncated or invalid {} at byte {}", what, self.pos))
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| self.err("byte"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_uint(&mut self) -> Result<u64> {
        let (value, used) = read_var_uint(&self.data[self.pos..]).ok_or_else(|| self.err("varUint"))?;
        self.pos += used;
        Ok(value)
    }

    /// A varUint used as a length or count, bounded by the remaining input.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_var_uint()?;
        if len > (self.data.len() - self.pos) as u64 {
            return Err(self.err("length"));
        }
        Ok(len as usize)
    }

    pub fn read_var_byte_array(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_var_string(&mut self) -> Result<String> {
        let bytes = self.read_var_byte_array()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.err("string"))
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

// ===========================================================================
// Values
// ===========================================================================

fn write_id(buf: &mut Vec<u8>, id: OpId) {
    write_var_uint(buf, id.replica.0);
    write_var_uint(buf, id.seq);
}

fn read_id(dec: &mut Decoder<'_>) -> Result<OpId> {
    let replica = ReplicaId(dec.read_var_uint()?);
    let seq = dec.read_var_uint()?;
    Ok(OpId::new(replica, seq))
}

fn write_opt_id(buf: &mut Vec<u8>, id: Option<OpId>) {
    match id {
        Some(id) => {
            buf.push(1);
            write_id(buf, id);
        }
        None => buf.push(0),
    }
}

fn read_opt_id(dec: &mut Decoder<'_>) -> Result<Option<OpId>> {
    match dec.read_u8()? {
        0 => Ok(None),
        _ => read_id(dec).map(Some),
    }
}

fn write_ids(buf: &mut Vec<u8>, ids: &[OpId]) {
    write_var_uint(buf, ids.len() as u64);
    for id in ids {
        write_id(buf, *id);
    }
}

fn read_ids(dec: &mut Decoder<'_>) -> Result<Vec<OpId>> {
    let count = dec.read_len()?;
    (0..count).map(|_| read_id(dec)).collect()
}

fn write_value(buf: &mut Vec<u8>, value: &AttrValue) {
    match value {
        AttrValue::Null => buf.push(0),
        AttrValue::Bool(b) => {
            buf.push(1);
            buf.push(*b as u8);
        }
        AttrValue::Int(i) => {
            buf.push(2);
            // zigzag
            write_var_uint(buf, ((*i << 1) ^ (*i >> 63)) as u64);
        }
        AttrValue::String(s) => {
            buf.push(3);
            write_var_string(buf, s);
        }
    }
}

fn read_value(dec: &mut Decoder<'_>) -> Result<AttrValue> {
    match dec.read_u8()? {
        0 => Ok(AttrValue::Null),
        1 => Ok(AttrValue::Bool(dec.read_u8()? != 0)),
        2 => {
            let raw = dec.read_var_uint()?;
            Ok(AttrValue::Int(((raw >> 1) as i64) ^ -((raw & 1) as i64)))
        }
        3 => Ok(AttrValue::String(dec.read_var_string()?)),
        tag => Err(CollabError::Decode(format!("unknown value tag {}", tag))),
    }
}

fn write_attrs(buf: &mut Vec<u8>, attrs: &Attrs) {
    write_var_uint(buf, attrs.len() as u64);
    for (key, value) in attrs {
        write_var_string(buf, key);
        write_value(buf, value);
    }
}

fn read_attrs(dec: &mut Decoder<'_>) -> Result<Attrs> {
    let count = dec.read_len()?;
    let mut attrs = Attrs::new();
    for _ in 0..count {
        let key = dec.read_var_string()?;
        attrs.insert(key, read_value(dec)?);
    }
    Ok(attrs)
}

fn read_mark_type(dec: &mut Decoder<'_>) -> Result<MarkType> {
    let tag = dec.read_u8()?;
    MarkType::from_tag(tag).ok_or_else(|| CollabError::Decode(format!("unknown mark type {}", tag)))
}

fn write_marks(buf: &mut Vec<u8>, marks: &[Mark]) {
    write_var_uint(buf, marks.len() as u64);
    for mark in marks {
        buf.push(mark.mark_type.tag());
        write_attrs(buf, &mark.attrs);
    }
}

fn read_marks(dec: &mut Decoder<'_>) -> Result<Vec<Mark>> {
    let count = dec.read_len()?;
    let mut marks = Vec::with_capacity(count);
    for _ in 0..count {
        let mark_type = read_mark_type(dec)?;
        marks.push(Mark {
            mark_type,
            attrs: read_attrs(dec)?,
        });
    }
    Ok(marks)
}

// ===========================================================================
// Changes
// ===========================================================================

mod kind_tag {
    pub const INSERT_TEXT: u8 = 0;
    pub const INSERT_NODE: u8 = 1;
    pub const DELETE: u8 = 2;
    pub const SET_ATTR: u8 = 3;
    pub const SET_MARK: u8 = 4;
}

/// Encode a batch of changes.
pub fn encode_changes<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Vec<u8> {
    let changes: Vec<&Change> = changes.into_iter().collect();
    let mut buf = Vec::new();
    write_var_uint(&mut buf, changes.len() as u64);
    for change in changes {
        write_id(&mut buf, change.id);
        write_var_uint(&mut buf, change.lamport);
        match &change.kind {
            ChangeKind::InsertText {
                parent,
                after,
                text,
                marks,
            } => {
                buf.push(kind_tag::INSERT_TEXT);
                write_id(&mut buf, *parent);
                write_opt_id(&mut buf, *after);
                write_var_string(&mut buf, text);
                write_marks(&mut buf, marks);
            }
            ChangeKind::InsertNode {
                parent,
                after,
                node_type,
                attrs,
            } => {
                buf.push(kind_tag::INSERT_NODE);
                write_id(&mut buf, *parent);
                write_opt_id(&mut buf, *after);
                buf.push(node_type.tag());
                write_attrs(&mut buf, attrs);
            }
            ChangeKind::Delete { targets } => {
                buf.push(kind_tag::DELETE);
                write_ids(&mut buf, targets);
            }
            ChangeKind::SetAttr { node, key, value } => {
                buf.push(kind_tag::SET_ATTR);
                write_id(&mut buf, *node);
                write_var_string(&mut buf, key);
                match value {
                    Some(value) => {
                        buf.push(1);
                        write_value(&mut buf, value);
                    }
                    None => buf.push(0),
                }
            }
            ChangeKind::SetMark {
                targets,
                mark_type,
                mark,
            } => {
                buf.push(kind_tag::SET_MARK);
                write_ids(&mut buf, targets);
                buf.push(mark_type.tag());
                match mark {
                    Some(mark) => {
                        buf.push(1);
                        write_attrs(&mut buf, &mark.attrs);
                    }
                    None => buf.push(0),
                }
            }
        }
    }
    buf
}

/// Decode a batch of changes.
pub fn decode_changes(data: &[u8]) -> Result<Vec<Change>> {
    let mut dec = Decoder::new(data);
    let count = dec.read_len()?;
    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_id(&mut dec)?;
        let lamport = dec.read_var_uint()?;
        let kind = match dec.read_u8()? {
            kind_tag::INSERT_TEXT => ChangeKind::InsertText {
                parent: read_id(&mut dec)?,
                after: read_opt_id(&mut dec)?,
                text: dec.read_var_string()?,
                marks: read_marks(&mut dec)?,
            },
            kind_tag::INSERT_NODE => {
                let parent = read_id(&mut dec)?;
                let after = read_opt_id(&mut dec)?;
                let tag = dec.read_u8()?;
                let node_type = NodeType::from_tag(tag)
                    .ok_or_else(|| CollabError::Decode(format!("unknown node type {}", tag)))?;
                ChangeKind::InsertNode {
                    parent,
                    after,
                    node_type,
                    attrs: read_attrs(&mut dec)?,
                }
            }
            kind_tag::DELETE => ChangeKind::Delete {
                targets: read_ids(&mut dec)?,
            },
            kind_tag::SET_ATTR => {
                let node = read_id(&mut dec)?;
                let key = dec.read_var_string()?;
                let value = match dec.read_u8()? {
                    0 => None,
                    _ => Some(read_value(&mut dec)?),
                };
                ChangeKind::SetAttr { node, key, value }
            }
            kind_tag::SET_MARK => {
                let targets = read_ids(&mut dec)?;
                let mark_type = read_mark_type(&mut dec)?;
                let mark = match dec.read_u8()? {
                    0 => None,
                    _ => Some(Mark {
                        mark_type,
                        attrs: read_attrs(&mut dec)?,
                    }),
                };
                ChangeKind::SetMark {
                    targets,
                    mark_type,
                    mark,
                }
            }
            tag => return Err(CollabError::Decode(format!("unknown change kind {}", tag))),
        };
        changes.push(Change { id, lamport, kind });
    }
    if !dec.is_empty() {
        return Err(CollabError::Decode("trailing bytes after change batch".into()));
    }
    Ok(changes)
}

// ===========================================================================
// State vectors
// ===========================================================================

/// Encode a state vector: `varUint(n)` then `(replica, seq)` pairs.
pub fn encode_state_vector(sv: &StateVector) -> Vec<u8> {
    let entries: Vec<(ReplicaId, u64)> = sv.iter().filter(|(_, s)| *s > 0).collect();
    let mut buf = Vec::new();
    write_var_uint(&mut buf, entries.len() as u64);
    for (replica, seq) in entries {
        write_var_uint(&mut buf, replica.0);
        write_var_uint(&mut buf, seq);
    }
    buf
}

pub fn decode_state_vector(data: &[u8]) -> Result<StateVector> {
    let mut dec = Decoder::new(data);
    let count = dec.read_len()?;
    let mut sv = StateVector::new();
    for _ in 0..count {
        let replica = ReplicaId(dec.read_var_uint()?);
        let seq = dec.read_var_uint()?;
        sv.set(replica, seq);
    }
    Ok(sv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_encoding() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, 0);
        assert_eq!(buf, vec![0]);

        buf.clear();
        write_var_uint(&mut buf, 127);
        assert_eq!(buf, vec![127]);

        buf.clear();
        write_var_uint(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);

        buf.clear();
        write_var_uint(&mut buf, 300);
        assert_eq!(read_var_uint(&buf), Some((300, 2)));
        assert_eq!(read_var_uint(&[0x80]), None);
    }

    #[test]
    fn test_every_change_kind_survives_encoding() {
        let r = ReplicaId(0x1234_5678_9abc);
        let changes = vec![
            Change {
                id: OpId::new(r, 1),
                lamport: 1,
                kind: ChangeKind::InsertNode {
                    parent: OpId::ROOT,
                    after: None,
                    node_type: NodeType::Heading,
                    attrs: [
                        ("level".to_string(), AttrValue::Int(2)),
                        ("class".to_string(), AttrValue::Null),
                    ]
                    .into_iter()
                    .collect(),
                },
            },
            Change {
                id: OpId::new(r, 2),
                lamport: 2,
                kind: ChangeKind::InsertText {
                    parent: OpId::new(r, 1),
                    after: None,
                    text: "héllo".into(),
                    marks: vec![Mark::link("https://example.com")],
                },
            },
            Change {
                id: OpId::new(r, 7),
                lamport: 7,
                kind: ChangeKind::Delete {
                    targets: vec![OpId::new(r, 3), OpId::new(r, 4)],
                },
            },
            Change {
                id: OpId::new(r, 8),
                lamport: 8,
                kind: ChangeKind::SetAttr {
                    node: OpId::new(r, 1),
                    key: "level".into(),
                    value: Some(AttrValue::Int(-3)),
                },
            },
            Change {
                id: OpId::new(r, 9),
                lamport: 9,
                kind: ChangeKind::SetMark {
                    targets: vec![OpId::new(r, 2)],
                    mark_type: MarkType::Bold,
                    mark: None,
                },
            },
        ];
        let bytes = encode_changes(&changes);
        assert_eq!(decode_changes(&bytes).unwrap(), changes);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let change = Change {
            id: OpId::new(ReplicaId(1), 1),
            lamport: 1,
            kind: ChangeKind::Delete {
                targets: vec![OpId::new(ReplicaId(1), 1)],
            },
        };
        let bytes = encode_changes([&change]);
        for cut in 0..bytes.len() {
            assert!(matches!(
                decode_changes(&bytes[..cut]),
                Err(CollabError::Decode(_))
            ));
        }
        let mut long = bytes.clone();
        long.push(0);
        assert!(decode_changes(&long).is_err());
    }

    #[test]
    fn test_state_vector_encoding() {
        let sv: StateVector = [(ReplicaId(1), 5), (ReplicaId(300), 2)].into_iter().collect();
        let bytes = encode_state_vector(&sv);
        assert_eq!(bytes[0], 2);
        assert_eq!(decode_state_vector(&bytes).unwrap(), sv);
        assert!(decode_state_vector(&encode_state_vector(&StateVector::new()))
            .unwrap()
            .is_empty());
    }
}
