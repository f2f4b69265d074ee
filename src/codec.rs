//! Wire schema for log entries.
//!
//! Every entry on the log is a [`LogEntry`]: either an intention (a proposed
//! transaction) or an after-image (the serialized delta of tree nodes a
//! committed intention produced). Encoding is bincode with default options;
//! post-order offsets inside an after-image are normative, since they double
//! as the node addressing scheme.

use bincode::Options;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Position;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bincode error")]
    Bincode(#[from] bincode::Error),
    #[error("invalid entry: {0}")]
    InvalidEntry(&'static str),
}

/// A single transaction operation carried by an intention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Path-copy without modification. Forces the key into the write set so
    /// a read participates in conflict detection like a write.
    Copy { key: Vec<u8> },
}

impl Op {
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Put { key, .. } | Op::Delete { key } | Op::Copy { key } => key,
        }
    }
}

/// A proposed transaction: the snapshot it was built on, its write ops and
/// the keys it read. The token ties the log entry back to the local waiter
/// that appended it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Intention {
    /// Commit position of the snapshot the transaction started from. `None`
    /// only for the bootstrap intention of an empty database.
    pub snapshot: Option<Position>,
    pub token: u64,
    pub ops: Vec<Op>,
    pub read_set: Vec<Vec<u8>>,
}

impl Intention {
    /// Keys checked against concurrently committed write sets: everything
    /// read plus everything written.
    pub fn conflict_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.read_set
            .iter()
            .map(|k| k.as_slice())
            .chain(self.ops.iter().map(|op| op.key()))
    }

    /// Keys this intention writes when it commits.
    pub fn write_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.ops.iter().map(|op| op.key())
    }
}

/// Reference to a child node as serialized inside an after-image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PtrRecord {
    Nil,
    /// Another node of this same after-image, by post-order offset.
    Slf { off: u16 },
    /// A node of an earlier commit whose after-image was not yet known at
    /// serialization time.
    Intention { pos: Position, off: u16 },
    /// A node of an earlier commit, by its after-image address.
    AfterImage { pos: Position, off: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub red: bool,
    pub key: Vec<u8>,
    pub val: Vec<u8>,
    pub left: PtrRecord,
    pub right: PtrRecord,
}

/// The delta of a committed intention: its new nodes in post-order, the root
/// last. An empty tree is a valid (empty) delta.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AfterImage {
    /// Position of the intention this delta was produced by.
    pub intention: Position,
    pub tree: Vec<NodeRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize, EnumAsInner)]
pub enum LogEntry {
    Intention(Intention),
    AfterImage(AfterImage),
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::DefaultOptions::new().serialize(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, CodecError> {
        let entry: LogEntry = bincode::DefaultOptions::new().deserialize(blob)?;
        if let LogEntry::AfterImage(ai) = &entry {
            for (off, node) in ai.tree.iter().enumerate() {
                for ptr in [&node.left, &node.right] {
                    if let PtrRecord::Slf { off: child } = ptr {
                        // post-order: children always precede their parent
                        if *child as usize >= off {
                            return Err(CodecError::InvalidEntry(
                                "self pointer does not precede its parent",
                            ));
                        }
                    }
                }
            }
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn leaf(key: &[u8], val: &[u8], left: PtrRecord, right: PtrRecord) -> NodeRecord {
        NodeRecord {
            red: false,
            key: key.to_vec(),
            val: val.to_vec(),
            left,
            right,
        }
    }

    #[test_case(LogEntry::Intention(Intention {
        snapshot: Some(7),
        token: 99,
        ops: vec![
            Op::Put { key: b"a".to_vec(), value: b"1".to_vec() },
            Op::Delete { key: b"b".to_vec() },
            Op::Copy { key: b"c".to_vec() },
        ],
        read_set: vec![b"d".to_vec()],
    }); "intention")]
    #[test_case(LogEntry::AfterImage(AfterImage {
        intention: 3,
        tree: vec![
            leaf(b"a", b"1", PtrRecord::Nil, PtrRecord::Nil),
            leaf(b"b", b"2", PtrRecord::Slf { off: 0 },
                 PtrRecord::AfterImage { pos: 2, off: 4 }),
        ],
    }); "after image")]
    fn round_trip(entry: LogEntry) {
        let blob = entry.encode().unwrap();
        let decoded = LogEntry::decode(&blob).unwrap();
        match (entry, decoded) {
            (LogEntry::Intention(a), LogEntry::Intention(b)) => {
                assert_eq!(a.snapshot, b.snapshot);
                assert_eq!(a.token, b.token);
                assert_eq!(a.ops, b.ops);
                assert_eq!(a.read_set, b.read_set);
            }
            (LogEntry::AfterImage(a), LogEntry::AfterImage(b)) => {
                assert_eq!(a.intention, b.intention);
                assert_eq!(a.tree, b.tree);
            }
            _ => panic!("variant changed across the wire"),
        }
    }

    #[test]
    fn forward_self_pointer_rejected() {
        let entry = LogEntry::AfterImage(AfterImage {
            intention: 0,
            tree: vec![leaf(b"a", b"1", PtrRecord::Slf { off: 0 }, PtrRecord::Nil)],
        });
        let blob = entry.encode().unwrap();
        assert!(LogEntry::decode(&blob).is_err());
    }

    #[test]
    fn conflict_keys_cover_reads_and_writes() {
        let i = Intention {
            snapshot: None,
            token: 0,
            ops: vec![Op::Put {
                key: b"w".to_vec(),
                value: vec![],
            }],
            read_set: vec![b"r".to_vec()],
        };
        let keys: Vec<&[u8]> = i.conflict_keys().collect();
        assert_eq!(keys, vec![b"r".as_slice(), b"w".as_slice()]);
    }
}
