//! Patches — the structured diffs consumed by the front-end.
//!
//! # Overview
//!
//! While changes apply, a [`PendingDiffs`] collects which slots were
//! touched and which list edits happened, in order. [`finalize_patch`]
//! resolves those fragments against the op set's current state into a
//! [`Diff`] tree rooted at the document root, including the path from the
//! root to every touched object so the front-end can navigate to it.
//! [`construct_patch`] builds the same shape for the whole document.
//!
//! Concurrent winners appear side by side under their op IDs; counter
//! increments are already folded into the values.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::change::{ChangeHash, Key, ObjId, ObjType, OpAction, OpId};
use super::object::FieldOp;
use super::OpSet;

// ── Patch shape ────────────────────────────────────────────────────────────

/// The complete message handed to the front-end after an apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// The registry version a subsequent change request may reference.
    pub version: u64,
    /// Actor → number of applied changes.
    pub clock: BTreeMap<String, u64>,
    /// The dependency frontier, sorted.
    pub deps: Vec<ChangeHash>,
    pub max_op: u64,
    /// Set only on incremental local patches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub diffs: Diff,
}

/// One node of the diff tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Diff {
    Map(MapDiff),
    Seq(SeqDiff),
    Value(ValueDiff),
}

/// Diff of a map or table object: per touched key, the surviving
/// assignments keyed by op ID. An empty inner map means the key was
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapDiff {
    pub object_id: ObjId,
    #[serde(rename = "type")]
    pub obj_type: ObjType,
    pub props: BTreeMap<String, BTreeMap<OpId, Diff>>,
}

/// Diff of a list or text object: an ordered edit stream, then values per
/// final index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeqDiff {
    pub object_id: ObjId,
    #[serde(rename = "type")]
    pub obj_type: ObjType,
    pub edits: Vec<SeqEdit>,
    pub props: BTreeMap<u64, BTreeMap<OpId, Diff>>,
}

/// A single positional edit. Edits are applied by the front-end in order,
/// before `props`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SeqEdit {
    Insert {
        index: u64,
        #[serde(rename = "elemId")]
        elem_id: OpId,
    },
    Remove {
        index: u64,
    },
}

/// A scalar value at a slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueDiff {
    pub value: Value,
}

// ── Pending fragments ──────────────────────────────────────────────────────

/// Accumulates which slots changed while a batch of changes applies.
#[derive(Debug, Clone, Default)]
pub struct PendingDiffs {
    objects: HashMap<ObjId, ObjPending>,
}

#[derive(Debug, Clone, Default)]
struct ObjPending {
    props: BTreeSet<String>,
    elems: BTreeSet<OpId>,
    edits: Vec<SeqEdit>,
}

impl PendingDiffs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn touch_prop(&mut self, obj: &ObjId, name: String) {
        self.objects
            .entry(obj.clone())
            .or_default()
            .props
            .insert(name);
    }

    pub fn touch_elem(&mut self, obj: &ObjId, elem: OpId) {
        self.objects
            .entry(obj.clone())
            .or_default()
            .elems
            .insert(elem);
    }

    pub fn push_edit(&mut self, obj: &ObjId, edit: SeqEdit) {
        self.objects.entry(obj.clone()).or_default().edits.push(edit);
    }
}

// ── Finalization ───────────────────────────────────────────────────────────

/// Resolves pending fragments into the diff tree the front-end consumes.
pub fn finalize_patch(op_set: &OpSet, mut pending: PendingDiffs) -> Diff {
    // Extend the fragments with the path from every touched object up to
    // the root, so each one is reachable in the emitted tree.
    let touched: Vec<ObjId> = pending.objects.keys().cloned().collect();
    for obj in touched {
        let mut cursor = obj;
        let mut hops = 0usize;
        while cursor != ObjId::Root && hops <= op_set.by_object.len() {
            let Some((parent, key)) = op_set
                .by_object
                .get(&cursor)
                .and_then(|state| state.inbound.clone())
            else {
                break;
            };
            match key {
                Key::Map(name) => pending.touch_prop(&parent, name),
                Key::Elem(elem) => pending.touch_elem(&parent, elem),
                Key::Head => break,
            }
            cursor = parent;
            hops += 1;
        }
    }
    let mut on_path = HashSet::new();
    build_pending(op_set, &pending, &ObjId::Root, &mut on_path)
}

fn build_pending(
    op_set: &OpSet,
    pending: &PendingDiffs,
    obj: &ObjId,
    on_path: &mut HashSet<ObjId>,
) -> Diff {
    let Some(state) = op_set.by_object.get(obj) else {
        return empty_diff(obj, ObjType::Map);
    };
    on_path.insert(obj.clone());
    let fragment = pending.objects.get(obj);
    let diff = match &state.seq {
        None => {
            let mut props = BTreeMap::new();
            if let Some(fragment) = fragment {
                for name in &fragment.props {
                    let ops = state.field_ops(&Key::Map(name.clone()));
                    let diffs = slot_diffs(op_set, ops, on_path, &mut |op_set, child, on_path| {
                        build_pending(op_set, pending, child, on_path)
                    });
                    props.insert(name.clone(), diffs);
                }
            }
            Diff::Map(MapDiff {
                object_id: obj.clone(),
                obj_type: state.obj_type,
                props,
            })
        }
        Some(seq) => {
            let mut edits = Vec::new();
            let mut props = BTreeMap::new();
            if let Some(fragment) = fragment {
                edits = fragment.edits.clone();
                for elem in &fragment.elems {
                    // Elements removed later in the same batch have no
                    // final index; the remove edit already covers them.
                    let Some(at) = seq.elem_ids.index_of(elem) else {
                        continue;
                    };
                    let ops = state.field_ops(&Key::Elem(elem.clone()));
                    let diffs = slot_diffs(op_set, ops, on_path, &mut |op_set, child, on_path| {
                        build_pending(op_set, pending, child, on_path)
                    });
                    props.insert(at as u64, diffs);
                }
            }
            Diff::Seq(SeqDiff {
                object_id: obj.clone(),
                obj_type: state.obj_type,
                edits,
                props,
            })
        }
    };
    on_path.remove(obj);
    diff
}

// ── Whole-document construction ────────────────────────────────────────────

/// Builds a patch diff describing the entire document.
pub fn construct_patch(op_set: &OpSet) -> Diff {
    let mut on_path = HashSet::new();
    build_full(op_set, &ObjId::Root, &mut on_path)
}

fn build_full(op_set: &OpSet, obj: &ObjId, on_path: &mut HashSet<ObjId>) -> Diff {
    let Some(state) = op_set.by_object.get(obj) else {
        return empty_diff(obj, ObjType::Map);
    };
    on_path.insert(obj.clone());
    let diff = match &state.seq {
        None => {
            let mut props = BTreeMap::new();
            for (key, slot) in &state.props {
                let Key::Map(name) = key else { continue };
                if slot.is_empty() {
                    continue;
                }
                let diffs = slot_diffs(op_set, slot.ops(), on_path, &mut build_full);
                props.insert(name.clone(), diffs);
            }
            Diff::Map(MapDiff {
                object_id: obj.clone(),
                obj_type: state.obj_type,
                props,
            })
        }
        Some(seq) => {
            let mut edits = Vec::new();
            let mut props = BTreeMap::new();
            for (at, elem) in seq.elem_ids.iter().enumerate() {
                edits.push(SeqEdit::Insert {
                    index: at as u64,
                    elem_id: elem.clone(),
                });
                let ops = state.field_ops(&Key::Elem(elem.clone()));
                let diffs = slot_diffs(op_set, ops, on_path, &mut build_full);
                props.insert(at as u64, diffs);
            }
            Diff::Seq(SeqDiff {
                object_id: obj.clone(),
                obj_type: state.obj_type,
                edits,
                props,
            })
        }
    };
    on_path.remove(obj);
    diff
}

// ── Shared helpers ─────────────────────────────────────────────────────────

type ChildBuilder<'a> = dyn FnMut(&OpSet, &ObjId, &mut HashSet<ObjId>) -> Diff + 'a;

/// Maps the surviving assignments at one slot to their diffs.
fn slot_diffs(
    op_set: &OpSet,
    ops: &[FieldOp],
    on_path: &mut HashSet<ObjId>,
    child: &mut ChildBuilder<'_>,
) -> BTreeMap<OpId, Diff> {
    let mut out = BTreeMap::new();
    for op in ops {
        let diff = match &op.action {
            OpAction::Set(_) => Diff::Value(ValueDiff {
                value: op.effective_value(),
            }),
            OpAction::Link { child: target } => {
                child_diff(op_set, target, on_path, child)
            }
            action if action.object_type().is_some() => {
                let target = ObjId::Id(op.id.clone());
                child_diff(op_set, &target, on_path, child)
            }
            // `del` removes entries and `inc` folds into them; neither is
            // ever stored as a winner.
            _ => continue,
        };
        out.insert(op.id.clone(), diff);
    }
    out
}

fn child_diff(
    op_set: &OpSet,
    target: &ObjId,
    on_path: &mut HashSet<ObjId>,
    child: &mut ChildBuilder<'_>,
) -> Diff {
    if on_path.contains(target) {
        // A link cycle: emit a bare reference instead of recursing.
        let obj_type = op_set.object_type(target).unwrap_or(ObjType::Map);
        return empty_diff(target, obj_type);
    }
    child(op_set, target, on_path)
}

fn empty_diff(obj: &ObjId, obj_type: ObjType) -> Diff {
    if obj_type.is_sequence() {
        Diff::Seq(SeqDiff {
            object_id: obj.clone(),
            obj_type,
            edits: Vec::new(),
            props: BTreeMap::new(),
        })
    } else {
        Diff::Map(MapDiff {
            object_id: obj.clone(),
            obj_type,
            props: BTreeMap::new(),
        })
    }
}

/// Assembles the full patch envelope around a diff tree.
pub fn make_patch(
    op_set: &OpSet,
    diffs: Diff,
    version: u64,
    actor: Option<String>,
    seq: Option<u64>,
) -> Patch {
    Patch {
        version,
        clock: op_set.clock(),
        deps: op_set.heads(),
        max_op: op_set.max_op,
        actor,
        seq,
        diffs,
    }
}
