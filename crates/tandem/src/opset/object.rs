//! Per-object state: field-op slots and the list insertion tree.
//!
//! Each `(object, key)` slot keeps the surviving assignments in descending
//! op-ID order, so the head of a slot is the current winner and any
//! remaining entries are concurrent conflict values. Sequences additionally
//! maintain an insertion tree — which element was inserted after which —
//! from which the document order of concurrent insertions is derived.

use std::collections::HashMap;

use serde_json::Value;

use crate::change::{Key, ObjId, ObjType, OpAction, OpId};
use crate::skiplist::SkipList;

// ── Field ops ──────────────────────────────────────────────────────────────

/// An applied operation stored in a slot, with its materialized ID.
///
/// Counter increments are folded here rather than stored as ops of their
/// own: each `(id, delta)` pair came from an `inc` whose `pred` named this
/// entry. When the entry is overwritten its increments die with it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOp {
    pub id: OpId,
    pub action: OpAction,
    pub pred: Vec<OpId>,
    pub insert: bool,
    pub increments: Vec<(OpId, i64)>,
}

impl FieldOp {
    /// The value this entry contributes to a patch: the `set` payload with
    /// any accumulated increments folded in.
    pub fn effective_value(&self) -> Value {
        let base = match &self.action {
            OpAction::Set(value) => value,
            _ => return Value::Null,
        };
        if self.increments.is_empty() {
            return base.clone();
        }
        let delta: i64 = self.increments.iter().map(|(_, n)| n).sum();
        match base {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::from(i + delta)
                } else if let Some(f) = n.as_f64() {
                    serde_json::Number::from_f64(f + delta as f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                } else {
                    base.clone()
                }
            }
            _ => base.clone(),
        }
    }
}

/// The surviving assignments at one `(object, key)` slot, descending by
/// op ID. The head is the current winner; the rest are concurrent values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slot {
    ops: Vec<FieldOp>,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[FieldOp] {
        &self.ops
    }

    pub fn ids(&self) -> Vec<OpId> {
        self.ops.iter().map(|op| op.id.clone()).collect()
    }

    /// Drops every entry whose ID appears in `pred`.
    pub fn remove_overwritten(&mut self, pred: &[OpId]) {
        self.ops.retain(|op| !pred.contains(&op.id));
    }

    /// Inserts an entry at its descending-order position. Re-applying the
    /// same op ID is a no-op.
    pub fn incorporate(&mut self, op: FieldOp) {
        if self.ops.iter().any(|existing| existing.id == op.id) {
            return;
        }
        let at = self
            .ops
            .iter()
            .position(|existing| existing.id < op.id)
            .unwrap_or(self.ops.len());
        self.ops.insert(at, op);
    }

    /// Folds an increment into every entry named by its `pred`.
    pub fn apply_inc(&mut self, id: &OpId, pred: &[OpId], delta: i64) {
        for op in &mut self.ops {
            if pred.contains(&op.id) && !op.increments.iter().any(|(inc, _)| inc == id) {
                op.increments.push((id.clone(), delta));
            }
        }
    }
}

// ── Sequence state ─────────────────────────────────────────────────────────

/// List/text bookkeeping: the insertion tree plus the cached visible order.
#[derive(Debug, Clone, Default)]
pub struct SeqState {
    /// Element → the key it was inserted after (`_head` or an element).
    pub insertions: HashMap<OpId, Key>,
    /// Key → elements inserted directly after it, descending by op ID.
    pub following: HashMap<Key, Vec<OpId>>,
    /// Visible elements in document order.
    pub elem_ids: SkipList<OpId>,
}

impl SeqState {
    /// Records that `elem` was inserted after `parent`. Returns `false` on
    /// a duplicate insertion of the same element.
    pub fn register_insertion(&mut self, elem: OpId, parent: Key) -> bool {
        if self.insertions.contains_key(&elem) {
            return false;
        }
        self.insertions.insert(elem.clone(), parent.clone());
        let siblings = self.following.entry(parent).or_default();
        let at = siblings
            .iter()
            .position(|existing| *existing < elem)
            .unwrap_or(siblings.len());
        siblings.insert(at, elem);
        true
    }

    /// The element immediately before `elem` in document order, visible or
    /// not, or `None` when `elem` is first.
    ///
    /// A sibling earlier in the descending order precedes `elem`, but so
    /// does that sibling's entire subtree, so the walk descends to the
    /// deepest last child before answering.
    pub fn previous(&self, elem: &OpId) -> Option<OpId> {
        let parent = self.insertions.get(elem)?;
        let siblings = self.following.get(parent)?;
        if siblings.first() == Some(elem) {
            return match parent {
                Key::Elem(id) => Some(id.clone()),
                _ => None,
            };
        }
        let mut before: Option<&OpId> = None;
        for sibling in siblings {
            if sibling == elem {
                break;
            }
            before = Some(sibling);
        }
        let mut at = before?.clone();
        loop {
            match self
                .following
                .get(&Key::Elem(at.clone()))
                .and_then(|children| children.last())
            {
                Some(last) => at = last.clone(),
                None => return Some(at),
            }
        }
    }
}

// ── Object state ───────────────────────────────────────────────────────────

/// Everything the op set knows about one object.
#[derive(Debug, Clone)]
pub struct ObjState {
    pub obj_type: ObjType,
    /// Key-indexed surviving assignments.
    pub props: HashMap<Key, Slot>,
    /// The parent slot this object currently hangs off, for patch paths.
    pub inbound: Option<(ObjId, Key)>,
    /// Present iff `obj_type` is a sequence.
    pub seq: Option<SeqState>,
}

impl ObjState {
    pub fn new(obj_type: ObjType) -> Self {
        Self {
            obj_type,
            props: HashMap::new(),
            inbound: None,
            seq: obj_type.is_sequence().then(SeqState::default),
        }
    }

    pub fn field_ops(&self, key: &Key) -> &[FieldOp] {
        self.props.get(key).map(|slot| slot.ops()).unwrap_or(&[])
    }
}
