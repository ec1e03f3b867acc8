//! Identifiers, operations, and change batches.
//!
//! # Overview
//!
//! A document's history is an append-only log of [`Change`]s, each a
//! causally-linked batch of [`Op`]s. Every op is addressed by an [`OpId`]
//! (`"<counter>@<actor>"`), every change by a SHA-256 [`ChangeHash`] over its
//! canonical binary encoding, and every container object by the [`OpId`] of
//! the op that created it.

pub mod codec;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

// ── OpId ───────────────────────────────────────────────────────────────────

/// A Lamport identifier for a single operation: `(counter, actor)`.
///
/// Counters increase monotonically per document (not per actor), so two ops
/// from different actors may share a counter; the actor string breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpId {
    pub counter: u64,
    pub actor: String,
}

impl OpId {
    pub fn new(counter: u64, actor: &str) -> Self {
        Self {
            counter,
            actor: actor.to_owned(),
        }
    }

    /// Parses the canonical `"<counter>@<actor>"` rendering.
    pub fn parse(s: &str) -> Option<OpId> {
        let (counter, actor) = s.split_once('@')?;
        let counter: u64 = counter.parse().ok()?;
        if actor.is_empty() {
            return None;
        }
        Some(OpId {
            counter,
            actor: actor.to_owned(),
        })
    }
}

/// Total order: counter ascending, ties broken by actor string descending.
/// The greatest op ID under this order wins concurrent assignments.
impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| other.actor.cmp(&self.actor))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.actor)
    }
}

impl Serialize for OpId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ── ChangeHash ─────────────────────────────────────────────────────────────

/// SHA-256 identity of a change, computed over its canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeHash(pub [u8; 32]);

impl ChangeHash {
    /// Hashes an encoded change blob.
    pub fn of(bytes: &[u8]) -> ChangeHash {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ChangeHash(out)
    }

    /// Parses a 64-character hex rendering.
    pub fn parse(s: &str) -> Option<ChangeHash> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ChangeHash(arr))
    }
}

impl fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeHash({}..)", &hex::encode(self.0)[..8])
    }
}

impl Serialize for ChangeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ── Object identifiers and keys ────────────────────────────────────────────

/// The document root, or a container created by a `make*` op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjId {
    Root,
    Id(OpId),
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjId::Root => write!(f, "_root"),
            ObjId::Id(id) => write!(f, "{}", id),
        }
    }
}

impl Serialize for ObjId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// The slot an op addresses within its object: a map property, the list
/// head sentinel, or a list element ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Map(String),
    Head,
    Elem(OpId),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Map(s) => write!(f, "{}", s),
            Key::Head => write!(f, "_head"),
            Key::Elem(id) => write!(f, "{}", id),
        }
    }
}

// ── Object types ───────────────────────────────────────────────────────────

/// The four container types. Tables are maps and text is a sequence as far
/// as op application is concerned; the tag survives into patches so the
/// front-end can materialize the right structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjType {
    Map,
    Table,
    List,
    Text,
}

impl ObjType {
    pub fn is_sequence(self) -> bool {
        matches!(self, ObjType::List | ObjType::Text)
    }
}

// ── Operations ─────────────────────────────────────────────────────────────

/// The payload of an op, one variant per action.
///
/// `make*` ops carry no child here: the created object's ID is the op's own
/// ID. `link` keeps its canonical target.
#[derive(Debug, Clone, PartialEq)]
pub enum OpAction {
    Set(serde_json::Value),
    Del,
    Inc(i64),
    Link { child: ObjId },
    MakeMap,
    MakeTable,
    MakeList,
    MakeText,
}

impl OpAction {
    /// The container type a `make*` action creates, if any.
    pub fn object_type(&self) -> Option<ObjType> {
        match self {
            OpAction::MakeMap => Some(ObjType::Map),
            OpAction::MakeTable => Some(ObjType::Table),
            OpAction::MakeList => Some(ObjType::List),
            OpAction::MakeText => Some(ObjType::Text),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpAction::Set(_) => "set",
            OpAction::Del => "del",
            OpAction::Inc(_) => "inc",
            OpAction::Link { .. } => "link",
            OpAction::MakeMap => "makeMap",
            OpAction::MakeTable => "makeTable",
            OpAction::MakeList => "makeList",
            OpAction::MakeText => "makeText",
        }
    }
}

/// A single canonical operation inside a change.
///
/// Ops carry no explicit ID: the op at index `i` of a change has ID
/// `(change.start_op + i)@change.actor`.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub action: OpAction,
    pub obj: ObjId,
    pub key: Key,
    /// When true the op introduces a new list element whose ID is the op's
    /// own ID; `key` then names the predecessor element (or `_head`).
    pub insert: bool,
    /// Op IDs this op overwrites.
    pub pred: Vec<OpId>,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[{}]", self.action.name(), self.obj, self.key)?;
        if self.insert {
            write!(f, " (insert)")?;
        }
        Ok(())
    }
}

// ── Change ─────────────────────────────────────────────────────────────────

/// A causally-linked batch of ops from a single actor.
///
/// `deps` holds the hashes of the changes this one directly depends on (the
/// author's frontier at authoring time), kept sorted so the encoding, and
/// therefore the hash, is canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub actor: String,
    /// 1-based, dense per actor.
    pub seq: u64,
    /// Counter of the first op in this change.
    pub start_op: u64,
    pub time: i64,
    pub message: Option<String>,
    pub deps: Vec<ChangeHash>,
    pub ops: Vec<Op>,
    pub hash: ChangeHash,
}

impl Change {
    /// Builds a change, sorting `deps` and computing the content hash.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        actor: String,
        seq: u64,
        start_op: u64,
        time: i64,
        message: Option<String>,
        mut deps: Vec<ChangeHash>,
        ops: Vec<Op>,
    ) -> Change {
        deps.sort();
        deps.dedup();
        let mut change = Change {
            actor,
            seq,
            start_op,
            time,
            message,
            deps,
            ops,
            hash: ChangeHash([0; 32]),
        };
        let encoded = codec::encode_change(&change);
        change.hash = ChangeHash::of(&encoded);
        change
    }

    /// The ID of the op at index `i`.
    pub fn op_id_at(&self, i: usize) -> OpId {
        OpId {
            counter: self.start_op + i as u64,
            actor: self.actor.clone(),
        }
    }

    /// The greatest op counter this change consumes, or `None` for an empty
    /// change.
    pub fn max_op(&self) -> Option<u64> {
        if self.ops.is_empty() {
            None
        } else {
            Some(self.start_op + self.ops.len() as u64 - 1)
        }
    }
}

/// Translation table from front-end temporary object IDs to canonical ones.
/// Append-only for the lifetime of a backend lineage.
pub type ObjectIds = HashMap<String, ObjId>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_id_render_and_parse() {
        let id = OpId::new(7, "alice");
        assert_eq!(id.to_string(), "7@alice");
        assert_eq!(OpId::parse("7@alice"), Some(id));
        assert_eq!(OpId::parse("x@alice"), None);
        assert_eq!(OpId::parse("7@"), None);
        assert_eq!(OpId::parse("_head"), None);
    }

    #[test]
    fn op_id_order_counter_first() {
        assert!(OpId::new(2, "z") > OpId::new(1, "a"));
        assert!(OpId::new(1, "a") < OpId::new(2, "z"));
    }

    #[test]
    fn op_id_order_actor_descending_on_ties() {
        // Equal counters: the lexicographically smaller actor is the
        // greater op ID.
        assert!(OpId::new(5, "a") > OpId::new(5, "b"));
        assert!(OpId::new(5, "bob") < OpId::new(5, "alice"));
    }

    #[test]
    fn change_hash_hex_roundtrip() {
        let hash = ChangeHash::of(b"some change bytes");
        let rendered = hash.to_string();
        assert_eq!(rendered.len(), 64);
        assert_eq!(ChangeHash::parse(&rendered), Some(hash));
        assert_eq!(ChangeHash::parse("zz"), None);
    }

    #[test]
    fn change_build_sorts_and_dedups_deps() {
        let h1 = ChangeHash::of(b"one");
        let h2 = ChangeHash::of(b"two");
        let (lo, hi) = if h1 < h2 { (h1, h2) } else { (h2, h1) };
        let change = Change::build(
            "a".into(),
            1,
            1,
            0,
            None,
            vec![hi, lo, hi],
            vec![],
        );
        assert_eq!(change.deps, vec![lo, hi]);
    }

    #[test]
    fn change_hash_depends_on_contents() {
        let base = Change::build(
            "a".into(),
            1,
            1,
            0,
            None,
            vec![],
            vec![Op {
                action: OpAction::Set(json!(1)),
                obj: ObjId::Root,
                key: Key::Map("x".into()),
                insert: false,
                pred: vec![],
            }],
        );
        let other = Change::build(
            "a".into(),
            1,
            1,
            0,
            None,
            vec![],
            vec![Op {
                action: OpAction::Set(json!(2)),
                obj: ObjId::Root,
                key: Key::Map("x".into()),
                insert: false,
                pred: vec![],
            }],
        );
        assert_ne!(base.hash, other.hash);
    }

    #[test]
    fn max_op_counts_ops() {
        let change = Change::build("a".into(), 1, 5, 0, None, vec![], vec![]);
        assert_eq!(change.max_op(), None);
        let op = Op {
            action: OpAction::Del,
            obj: ObjId::Root,
            key: Key::Map("x".into()),
            insert: false,
            pred: vec![],
        };
        let change =
            Change::build("a".into(), 1, 5, 0, None, vec![], vec![op.clone(), op]);
        assert_eq!(change.max_op(), Some(6));
        assert_eq!(change.op_id_at(1), OpId::new(6, "a"));
    }
}
