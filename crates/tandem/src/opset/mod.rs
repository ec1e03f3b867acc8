//! The op set — causal history plus the materialized object graph.
//!
//! # Overview
//!
//! An [`OpSet`] holds every applied change, indexed three ways: by object
//! and key (`by_object`, for conflict resolution and reads), by actor
//! (`states`, for sequence-density checks and per-actor sync), and by hash
//! (`history`/`hashes`, for the causal graph). Changes whose dependencies
//! have not arrived wait in `queue`; the queue is re-scanned after every
//! successful application, so causal order is restored automatically as
//! predecessors show up.

pub mod diff;
pub mod object;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::change::{Change, ChangeHash, Key, ObjId, ObjType, Op, OpAction, OpId};
use crate::error::BackendError;
use diff::{PendingDiffs, SeqEdit};
use object::{FieldOp, ObjState};

/// Causally-consistent history of a document.
#[derive(Debug, Clone)]
pub struct OpSet {
    /// Materialized object graph.
    pub by_object: HashMap<ObjId, ObjState>,
    /// Actor → indices into `history`, in sequence order.
    pub states: HashMap<String, Vec<usize>>,
    /// Applied changes in application order (a valid topological order).
    pub history: Vec<Change>,
    /// Hash → index into `history`.
    hashes: HashMap<ChangeHash, usize>,
    /// The dependency frontier: hashes with no applied successor.
    pub deps: BTreeSet<ChangeHash>,
    /// Greatest op counter observed in any applied change.
    pub max_op: u64,
    /// Changes whose dependencies are not yet satisfied.
    pub queue: Vec<Change>,
}

impl Default for OpSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OpSet {
    pub fn new() -> Self {
        let mut by_object = HashMap::new();
        by_object.insert(ObjId::Root, ObjState::new(ObjType::Map));
        Self {
            by_object,
            states: HashMap::new(),
            history: Vec::new(),
            hashes: HashMap::new(),
            deps: BTreeSet::new(),
            max_op: 0,
            queue: Vec::new(),
        }
    }

    // ── Change application ─────────────────────────────────────────────────

    /// Applies a remote change, or buffers it until its dependencies have
    /// arrived. Duplicates are ignored. Any queued changes unblocked by
    /// this one are applied transitively.
    pub fn add_change(
        &mut self,
        change: Change,
        mut diffs: Option<&mut PendingDiffs>,
    ) -> Result<(), BackendError> {
        if self.is_stale(&change) {
            return Ok(());
        }
        if !self.is_ready(&change) {
            if !self.queue.iter().any(|queued| queued.hash == change.hash) {
                self.queue.push(change);
            }
            return Ok(());
        }
        self.apply_change(change, diffs.as_deref_mut())?;
        self.drain_queue(diffs)
    }

    /// Applies a locally-authored change. Local changes are built against a
    /// version-registry entry whose frontier is always present, so unmet
    /// dependencies are an internal inconsistency, not a buffering event.
    pub fn add_local_change(
        &mut self,
        change: Change,
        mut diffs: Option<&mut PendingDiffs>,
    ) -> Result<(), BackendError> {
        if !self.deps_satisfied(&change) {
            return Err(BackendError::InvalidChange(format!(
                "local change {} has unmet dependencies",
                change.hash
            )));
        }
        if change.seq != self.applied_seq(&change.actor) + 1 {
            return Err(BackendError::InvalidChange(format!(
                "local change for {} has sequence {} but {} changes are applied",
                change.actor,
                change.seq,
                self.applied_seq(&change.actor)
            )));
        }
        self.apply_change(change, diffs.as_deref_mut())?;
        self.drain_queue(diffs)
    }

    fn drain_queue(&mut self, mut diffs: Option<&mut PendingDiffs>) -> Result<(), BackendError> {
        loop {
            let Some(at) = self
                .queue
                .iter()
                .position(|queued| self.is_stale(queued) || self.is_ready(queued))
            else {
                return Ok(());
            };
            let queued = self.queue.remove(at);
            if self.is_stale(&queued) {
                continue;
            }
            self.apply_change(queued, diffs.as_deref_mut())?;
        }
    }

    fn deps_satisfied(&self, change: &Change) -> bool {
        change.deps.iter().all(|dep| self.hashes.contains_key(dep))
    }

    fn is_ready(&self, change: &Change) -> bool {
        self.deps_satisfied(change) && change.seq == self.applied_seq(&change.actor) + 1
    }

    fn is_stale(&self, change: &Change) -> bool {
        self.hashes.contains_key(&change.hash)
            || change.seq <= self.applied_seq(&change.actor)
    }

    fn apply_change(
        &mut self,
        change: Change,
        mut diffs: Option<&mut PendingDiffs>,
    ) -> Result<(), BackendError> {
        for (i, op) in change.ops.iter().enumerate() {
            let id = change.op_id_at(i);
            self.apply_op(id, op, diffs.as_deref_mut())?;
        }
        let at = self.history.len();
        self.hashes.insert(change.hash, at);
        self.states
            .entry(change.actor.clone())
            .or_default()
            .push(at);
        for dep in &change.deps {
            self.deps.remove(dep);
        }
        self.deps.insert(change.hash);
        if let Some(max) = change.max_op() {
            self.max_op = self.max_op.max(max);
        }
        self.history.push(change);
        Ok(())
    }

    fn apply_op(
        &mut self,
        id: OpId,
        op: &Op,
        diffs: Option<&mut PendingDiffs>,
    ) -> Result<(), BackendError> {
        if let Some(obj_type) = op.action.object_type() {
            self.by_object
                .entry(ObjId::Id(id.clone()))
                .or_insert_with(|| ObjState::new(obj_type));
        }

        let state = self.by_object.get_mut(&op.obj).ok_or_else(|| {
            BackendError::InvalidChange(format!("op {} targets missing object {}", id, op.obj))
        })?;

        // Resolve the effective key. An insertion registers in the tree and
        // addresses the slot named by its own ID.
        let key = if op.insert {
            if matches!(op.key, Key::Map(_)) {
                return Err(BackendError::InvalidChange(format!(
                    "insertion after a map key in {}",
                    op.obj
                )));
            }
            let seq = state.seq.as_mut().ok_or_else(|| {
                BackendError::InvalidChange(format!(
                    "insertion into non-sequence object {}",
                    op.obj
                ))
            })?;
            if !seq.register_insertion(id.clone(), op.key.clone()) {
                return Err(BackendError::InvalidChange(format!(
                    "duplicate insertion {}",
                    id
                )));
            }
            Key::Elem(id.clone())
        } else {
            op.key.clone()
        };

        let visible = {
            let slot = state.props.entry(key.clone()).or_default();
            match &op.action {
                OpAction::Inc(delta) => slot.apply_inc(&id, &op.pred, *delta),
                OpAction::Del => slot.remove_overwritten(&op.pred),
                _ => {
                    slot.remove_overwritten(&op.pred);
                    slot.incorporate(FieldOp {
                        id: id.clone(),
                        action: op.action.clone(),
                        pred: op.pred.clone(),
                        insert: op.insert,
                        increments: Vec::new(),
                    });
                }
            }
            !slot.is_empty()
        };

        if state.obj_type.is_sequence() {
            let Key::Elem(elem) = &key else {
                return Err(BackendError::InvalidChange(format!(
                    "sequence op with a map key in {}",
                    op.obj
                )));
            };
            let seq = state.seq.as_mut().ok_or_else(|| {
                BackendError::InvalidChange(format!("sequence object {} lost its state", op.obj))
            })?;
            Self::update_sequence(seq, &op.obj, elem, visible, diffs);
        } else {
            let Key::Map(name) = &key else {
                return Err(BackendError::InvalidChange(format!(
                    "map op with a sequence key in {}",
                    op.obj
                )));
            };
            if let Some(diffs) = diffs {
                diffs.touch_prop(&op.obj, name.clone());
            }
        }

        // Record where a created or linked object hangs, for patch paths.
        match &op.action {
            OpAction::Link { child } => {
                let child_state = self.by_object.get_mut(child).ok_or_else(|| {
                    BackendError::InvalidChange(format!("link to missing object {}", child))
                })?;
                child_state.inbound = Some((op.obj.clone(), key));
            }
            action if action.object_type().is_some() => {
                if let Some(child_state) = self.by_object.get_mut(&ObjId::Id(id)) {
                    child_state.inbound = Some((op.obj.clone(), key));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Keeps the visible-element skip list in sync with a slot update and
    /// records the corresponding edit.
    fn update_sequence(
        seq: &mut object::SeqState,
        obj: &ObjId,
        elem: &OpId,
        visible: bool,
        diffs: Option<&mut PendingDiffs>,
    ) {
        if let Some(at) = seq.elem_ids.index_of(elem) {
            if !visible {
                seq.elem_ids.remove_key(elem);
                if let Some(diffs) = diffs {
                    diffs.push_edit(obj, SeqEdit::Remove { index: at as u64 });
                }
            } else if let Some(diffs) = diffs {
                diffs.touch_elem(obj, elem.clone());
            }
        } else if visible {
            // Walk back through the insertion tree to the closest element
            // that is still visible.
            let mut cursor = elem.clone();
            let mut anchor: Option<OpId> = None;
            while let Some(before) = seq.previous(&cursor) {
                if seq.elem_ids.contains(&before) {
                    anchor = Some(before);
                    break;
                }
                cursor = before;
            }
            let at = anchor
                .as_ref()
                .and_then(|a| seq.elem_ids.index_of(a))
                .map(|i| i + 1)
                .unwrap_or(0);
            seq.elem_ids.insert_after(anchor.as_ref(), elem.clone());
            if let Some(diffs) = diffs {
                diffs.push_edit(
                    obj,
                    SeqEdit::Insert {
                        index: at as u64,
                        elem_id: elem.clone(),
                    },
                );
                diffs.touch_elem(obj, elem.clone());
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    /// Current winners at `(obj, key)`, greatest op ID first. Multiple
    /// entries are concurrent conflicting assignments.
    pub fn get_field_ops(&self, obj: &ObjId, key: &Key) -> &[FieldOp] {
        self.by_object
            .get(obj)
            .map(|state| state.field_ops(key))
            .unwrap_or(&[])
    }

    pub fn object_type(&self, obj: &ObjId) -> Option<ObjType> {
        self.by_object.get(obj).map(|state| state.obj_type)
    }

    /// Number of changes applied so far for `actor`.
    pub fn applied_seq(&self, actor: &str) -> u64 {
        self.states.get(actor).map(|s| s.len() as u64).unwrap_or(0)
    }

    /// Actor → number of applied changes.
    pub fn clock(&self) -> BTreeMap<String, u64> {
        self.states
            .iter()
            .map(|(actor, indices)| (actor.clone(), indices.len() as u64))
            .collect()
    }

    /// The dependency frontier, sorted.
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.deps.iter().copied().collect()
    }

    pub fn contains_hash(&self, hash: &ChangeHash) -> bool {
        self.hashes.contains_key(hash)
    }

    /// Every applied change not reachable from `have` in the causal graph,
    /// in application order (each change follows its dependencies).
    pub fn get_missing_changes(&self, have: &[ChangeHash]) -> Vec<&Change> {
        let mut reachable: HashSet<ChangeHash> = HashSet::new();
        let mut stack: Vec<ChangeHash> = have
            .iter()
            .filter(|hash| self.hashes.contains_key(hash))
            .copied()
            .collect();
        while let Some(hash) = stack.pop() {
            if !reachable.insert(hash) {
                continue;
            }
            if let Some(&at) = self.hashes.get(&hash) {
                stack.extend(self.history[at].deps.iter().copied());
            }
        }
        self.history
            .iter()
            .filter(|change| !reachable.contains(&change.hash))
            .collect()
    }

    /// Hashes referenced by queued changes that are neither applied nor
    /// themselves waiting in the queue, sorted.
    pub fn get_missing_deps(&self) -> Vec<ChangeHash> {
        let in_queue: HashSet<ChangeHash> = self.queue.iter().map(|change| change.hash).collect();
        let mut missing: BTreeSet<ChangeHash> = BTreeSet::new();
        for change in &self.queue {
            for dep in &change.deps {
                if !self.hashes.contains_key(dep) && !in_queue.contains(dep) {
                    missing.insert(*dep);
                }
            }
        }
        missing.into_iter().collect()
    }

    /// An actor's applied changes, in sequence order.
    pub fn changes_for_actor(&self, actor: &str) -> Vec<&Change> {
        self.states
            .get(actor)
            .map(|indices| indices.iter().map(|&at| &self.history[at]).collect())
            .unwrap_or_default()
    }
}
