//! A change: a hash-identified batch of ops with explicit dependencies.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{self, DecodeError};
use crate::error::InvalidId;
use crate::identity::{ActorId, Key, ObjId, OpId};
use crate::op::{Op, OpType};
use crate::value::ScalarValue;

/// SHA-256 of a change's canonical chunk encoding, rendered as 64 lowercase
/// hex digits. A change is uniquely identified by this hash.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeHash(pub [u8; 32]);

impl ChangeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeHash({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ChangeHash {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| InvalidId::Hash {
            raw: s.to_string(),
            reason,
        };
        let bytes = hex::decode(s).map_err(|e| invalid(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| invalid("expected 32 bytes".into()))?;
        Ok(ChangeHash(bytes))
    }
}

impl TryFrom<String> for ChangeHash {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChangeHash> for String {
    fn from(hash: ChangeHash) -> String {
        hash.to_hex()
    }
}

pub fn sha256_bytes(data: &[u8]) -> ChangeHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    ChangeHash(buf)
}

/// An atomic batch of ops: one actor, one seq step, explicit deps.
///
/// `deps` is kept sorted byte-lexicographically; `ops` are applied in the
/// order given here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    pub start_op: u64,
    /// Wall-clock millis at commit; informational only.
    pub time: i64,
    pub message: Option<String>,
    pub deps: Vec<ChangeHash>,
    pub ops: Vec<Op>,
}

impl Change {
    pub fn new(
        actor: ActorId,
        seq: u64,
        start_op: u64,
        time: i64,
        message: Option<String>,
        mut deps: Vec<ChangeHash>,
        ops: Vec<Op>,
    ) -> Self {
        deps.sort_unstable();
        deps.dedup();
        Change {
            actor,
            seq,
            start_op,
            time,
            message,
            deps,
            ops,
        }
    }

    /// Total expanded op count (a multi-value run claims one counter per
    /// element).
    pub fn num_ops(&self) -> u64 {
        self.ops.iter().map(Op::width).sum()
    }

    /// The greatest op counter this change claims, or `start_op - 1` when
    /// empty.
    pub fn max_op(&self) -> u64 {
        let n = self.num_ops();
        if n == 0 {
            self.start_op.saturating_sub(1)
        } else {
            self.start_op + n - 1
        }
    }

    /// Expanded rows in application order, with their assigned OpIds.
    pub fn expanded_ops(&self) -> Vec<ExpandedOp<'_>> {
        let mut rows = Vec::with_capacity(self.ops.len());
        let mut counter = self.start_op;
        for op in &self.ops {
            match &op.values {
                None => {
                    rows.push(ExpandedOp {
                        id: OpId::new(counter, self.actor.clone()),
                        action: op.action,
                        obj: &op.obj,
                        key: op.key.clone(),
                        insert: op.insert,
                        pred: &op.pred,
                        value: op.value.as_ref(),
                        child: op.child.as_ref(),
                    });
                    counter += 1;
                }
                Some(values) => {
                    let mut key = op.key.clone();
                    for value in values {
                        let id = OpId::new(counter, self.actor.clone());
                        rows.push(ExpandedOp {
                            id: id.clone(),
                            action: op.action,
                            obj: &op.obj,
                            key,
                            insert: true,
                            pred: &op.pred,
                            value: Some(value),
                            child: None,
                        });
                        key = Key::elem(id);
                        counter += 1;
                    }
                }
            }
        }
        rows
    }

    /// Canonical chunk encoding (§6): magic, chunk type, length, columnar
    /// payload.
    pub fn encode(&self) -> Bytes {
        codec::encode_change(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Change, DecodeError> {
        codec::decode_change(bytes)
    }

    /// SHA-256 over the entire encoded chunk.
    pub fn hash(&self) -> ChangeHash {
        sha256_bytes(&self.encode())
    }
}

/// One expanded op row with its assigned id; multi-value runs appear as
/// consecutive rows chained through their predecessors' elemIds.
#[derive(Clone, Debug)]
pub struct ExpandedOp<'a> {
    pub id: OpId,
    pub action: OpType,
    pub obj: &'a ObjId,
    pub key: Key,
    pub insert: bool,
    pub pred: &'a [OpId],
    pub value: Option<&'a ScalarValue>,
    pub child: Option<&'a OpId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ElemId;

    fn actor(byte: u8) -> ActorId {
        ActorId::from_bytes(vec![byte]).unwrap()
    }

    #[test]
    fn deps_are_sorted_and_deduped() {
        let a = ChangeHash([0xbb; 32]);
        let b = ChangeHash([0x11; 32]);
        let change = Change::new(actor(1), 1, 1, 0, None, vec![a, b, a], vec![]);
        assert_eq!(change.deps, vec![b, a]);
    }

    #[test]
    fn multi_run_claims_one_counter_per_element() {
        let op = Op::insert_many(ObjId::Root, ElemId::Head, vec![1.into(), 2.into()]);
        let change = Change::new(actor(1), 1, 5, 0, None, vec![], vec![op]);
        assert_eq!(change.num_ops(), 2);
        assert_eq!(change.max_op(), 6);

        let rows = change.expanded_ops();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, OpId::new(5, actor(1)));
        assert_eq!(rows[0].key, Key::head());
        assert_eq!(rows[1].id, OpId::new(6, actor(1)));
        assert_eq!(rows[1].key, Key::elem(OpId::new(5, actor(1))));
    }

    #[test]
    fn hash_renders_as_64_hex_digits() {
        let change = Change::new(actor(1), 1, 1, 0, None, vec![], vec![]);
        let rendered = change.hash().to_string();
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rendered.parse::<ChangeHash>().unwrap(), change.hash());
    }
}
