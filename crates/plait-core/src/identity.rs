//! Identity atoms.
//!
//! ActorId: replica self-identification (opaque bytes, hex rendering)
//! OpId: Lamport identifier of a single operation
//! ObjId / ElemId: object and list-element identity derived from OpIds

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidId;

/// Actor identifier: opaque non-empty bytes, rendered as lowercase hex.
///
/// Ordering between actors is byte-lexicographic, which coincides with the
/// lexicographic order of the hex rendering.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(Vec<u8>);

impl ActorId {
    /// A fresh random actor (16 bytes). One per session is fine.
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, InvalidId> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(InvalidId::Actor {
                raw: String::new(),
                reason: "empty".into(),
            });
        }
        Ok(Self(bytes))
    }

    pub fn parse_hex(s: &str) -> Result<Self, InvalidId> {
        let bytes = hex::decode(s).map_err(|e| InvalidId::Actor {
            raw: s.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.to_hex())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ActorId {
    type Err = InvalidId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActorId::parse_hex(s)
    }
}

impl TryFrom<String> for ActorId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ActorId::parse_hex(&s)
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> String {
        id.to_hex()
    }
}

impl From<Uuid> for ActorId {
    fn from(id: Uuid) -> Self {
        Self(id.as_bytes().to_vec())
    }
}

/// Lamport identifier of a single operation: `counter@actor`.
///
/// Ordered by counter ascending, ties broken by actor ascending. Counters
/// start at 1; an actor's counters are strictly monotonic and gap-free
/// within a change.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpId {
    pub counter: u64,
    pub actor: ActorId,
}

impl OpId {
    pub fn new(counter: u64, actor: ActorId) -> Self {
        Self { counter, actor }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.actor.cmp(&other.actor),
            ord => ord,
        }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({self})")
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.actor)
    }
}

impl FromStr for OpId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| InvalidId::Op {
            raw: s.to_string(),
            reason: reason.to_string(),
        };
        let (counter, actor) = s.split_once('@').ok_or_else(|| invalid("missing `@`"))?;
        let counter: u64 = counter.parse().map_err(|_| invalid("bad counter"))?;
        if counter == 0 {
            return Err(invalid("counter must be >= 1"));
        }
        let actor = ActorId::parse_hex(actor).map_err(|_| invalid("bad actor hex"))?;
        Ok(OpId { counter, actor })
    }
}

impl TryFrom<String> for OpId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> String {
        id.to_string()
    }
}

/// Object identity: the root sentinel, or the OpId of the `make*` op that
/// created the object. The root is rendered `0@0`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObjId {
    Root,
    Op(OpId),
}

impl ObjId {
    pub const ROOT_STR: &'static str = "0@0";

    pub fn is_root(&self) -> bool {
        matches!(self, ObjId::Root)
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjId({self})")
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjId::Root => f.write_str(Self::ROOT_STR),
            ObjId::Op(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for ObjId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::ROOT_STR {
            return Ok(ObjId::Root);
        }
        let id: OpId = s.parse().map_err(|_| InvalidId::Object {
            raw: s.to_string(),
            reason: "neither root sentinel nor an op id".into(),
        })?;
        Ok(ObjId::Op(id))
    }
}

impl TryFrom<String> for ObjId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ObjId> for String {
    fn from(id: ObjId) -> String {
        id.to_string()
    }
}

impl From<OpId> for ObjId {
    fn from(id: OpId) -> Self {
        ObjId::Op(id)
    }
}

/// List-element identity: the head sentinel (insert at the front), or the
/// OpId of the insert that created the element.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ElemId {
    Head,
    Op(OpId),
}

impl ElemId {
    pub const HEAD_STR: &'static str = "_head";

    pub fn is_head(&self) -> bool {
        matches!(self, ElemId::Head)
    }
}

impl fmt::Debug for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElemId({self})")
    }
}

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemId::Head => f.write_str(Self::HEAD_STR),
            ElemId::Op(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for ElemId {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::HEAD_STR {
            return Ok(ElemId::Head);
        }
        let id: OpId = s.parse().map_err(|_| InvalidId::Elem {
            raw: s.to_string(),
            reason: "neither head sentinel nor an op id".into(),
        })?;
        Ok(ElemId::Op(id))
    }
}

impl TryFrom<String> for ElemId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ElemId> for String {
    fn from(id: ElemId) -> String {
        id.to_string()
    }
}

impl From<OpId> for ElemId {
    fn from(id: OpId) -> Self {
        ElemId::Op(id)
    }
}

/// The slot an op addresses within its target object: a map key, or a list
/// element reference.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Map(String),
    Elem(ElemId),
}

impl Key {
    pub fn map(key: impl Into<String>) -> Self {
        Key::Map(key.into())
    }

    pub fn head() -> Self {
        Key::Elem(ElemId::Head)
    }

    pub fn elem(id: OpId) -> Self {
        Key::Elem(ElemId::Op(id))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Map(s) => f.write_str(s),
            Key::Elem(e) => write!(f, "{e}"),
        }
    }
}
