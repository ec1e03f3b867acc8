//! The version registry — bounded history of past op sets.
//!
//! # Overview
//!
//! A front-end may lag behind the backend: it authors change requests
//! against the last patch version it processed, while remote changes keep
//! arriving. The registry keeps one op-set snapshot per patch version so a
//! request can be translated against exactly the state its author saw.
//!
//! Each entry tracks whether only local changes have occurred since it was
//! created (`local_only`). Entries in that state can simply adopt the new
//! op set after a local change lands; entries that have seen remote
//! changes instead merge the local change into their own snapshot, so the
//! snapshot keeps excluding remote changes the front-end has not processed.

use crate::change::Change;
use crate::error::BackendError;
use crate::opset::OpSet;

/// One snapshot a front-end may still author against.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: u64,
    /// False once any remote change applies after this entry was created.
    pub local_only: bool,
    pub op_set: OpSet,
}

/// Ordered, bounded list of version entries.
#[derive(Debug, Clone)]
pub struct Versions {
    entries: Vec<VersionEntry>,
}

impl Versions {
    /// The registry for a fresh backend: one entry at version 0.
    pub fn initial(op_set: OpSet) -> Self {
        Self {
            entries: vec![VersionEntry {
                version: 0,
                local_only: true,
                op_set,
            }],
        }
    }

    pub fn latest_version(&self) -> u64 {
        self.entries.last().map(|entry| entry.version).unwrap_or(0)
    }

    pub fn find(&self, version: u64) -> Option<&VersionEntry> {
        self.entries.iter().find(|entry| entry.version == version)
    }

    pub fn entries(&self) -> &[VersionEntry] {
        &self.entries
    }

    /// Records a remote apply: every existing entry has now seen a remote
    /// change, and the new state becomes the next referenceable version.
    pub fn on_remote_apply(&mut self, op_set: &OpSet) -> u64 {
        for entry in &mut self.entries {
            entry.local_only = false;
        }
        let version = self.latest_version() + 1;
        self.entries.push(VersionEntry {
            version,
            local_only: false,
            op_set: op_set.clone(),
        });
        version
    }

    /// Absorbs changes applied without a patch (`load_changes`): the
    /// current snapshot is brought up to date in place, with no new
    /// version number for a patch to carry.
    pub fn on_silent_apply(&mut self, op_set: &OpSet) {
        for entry in &mut self.entries {
            entry.local_only = false;
        }
        if let Some(last) = self.entries.last_mut() {
            last.op_set = op_set.clone();
        }
    }

    /// Records a local change authored against `base_version`:
    /// entries older than the base are dropped, survivors are reconciled,
    /// and the new state is appended as the next version.
    pub fn on_local_change(
        &mut self,
        base_version: u64,
        change: &Change,
        op_set: &OpSet,
    ) -> Result<u64, BackendError> {
        self.entries.retain(|entry| entry.version >= base_version);
        for entry in &mut self.entries {
            if entry.local_only {
                // Nothing remote since this entry: the new op set is
                // exactly what its front-end will have after this change.
                entry.op_set = op_set.clone();
            } else {
                // Keep excluding remote changes this entry's author has
                // not seen: merge only the local change into its snapshot.
                entry.op_set.add_local_change(change.clone(), None)?;
            }
        }
        let version = self.latest_version() + 1;
        self.entries.push(VersionEntry {
            version,
            local_only: true,
            op_set: op_set.clone(),
        });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Key, ObjId, Op, OpAction};
    use serde_json::json;

    fn set_change(actor: &str, seq: u64, start_op: u64, deps: Vec<crate::change::ChangeHash>) -> Change {
        Change::build(
            actor.into(),
            seq,
            start_op,
            0,
            None,
            deps,
            vec![Op {
                action: OpAction::Set(json!(seq)),
                obj: ObjId::Root,
                key: Key::Map(format!("{}-{}", actor, seq)),
                insert: false,
                pred: vec![],
            }],
        )
    }

    #[test]
    fn initial_registry_has_version_zero() {
        let versions = Versions::initial(OpSet::new());
        assert_eq!(versions.latest_version(), 0);
        let entry = versions.find(0).unwrap();
        assert!(entry.local_only);
        assert!(versions.find(1).is_none());
    }

    #[test]
    fn remote_apply_clears_local_only_and_bumps() {
        let mut versions = Versions::initial(OpSet::new());
        let mut op_set = OpSet::new();
        op_set.add_change(set_change("b", 1, 1, vec![]), None).unwrap();
        let version = versions.on_remote_apply(&op_set);
        assert_eq!(version, 1);
        assert!(!versions.find(0).unwrap().local_only);
        assert!(!versions.find(1).unwrap().local_only);
    }

    #[test]
    fn local_change_drops_older_entries() {
        let mut versions = Versions::initial(OpSet::new());
        let mut op_set = OpSet::new();
        // Two remote applies leave versions 0, 1, 2.
        op_set.add_change(set_change("b", 1, 1, vec![]), None).unwrap();
        versions.on_remote_apply(&op_set);
        op_set.add_change(set_change("b", 2, 2, op_set.heads()), None).unwrap();
        versions.on_remote_apply(&op_set);
        assert_eq!(versions.entries().len(), 3);

        // A local change against version 2 drops versions 0 and 1.
        let local = set_change("a", 1, op_set.max_op + 1, op_set.heads());
        op_set.add_local_change(local.clone(), None).unwrap();
        let version = versions.on_local_change(2, &local, &op_set).unwrap();
        assert_eq!(version, 3);
        let versions_present: Vec<u64> =
            versions.entries().iter().map(|e| e.version).collect();
        assert_eq!(versions_present, vec![2, 3]);
    }

    #[test]
    fn stale_entry_merges_only_the_local_change() {
        // A remote change arrives (bumping to v1), then a local change is
        // authored against v0. The surviving v0 entry is not local-only,
        // so it must merge just the local change into its own snapshot,
        // keeping the remote change out of the front-end's view.
        let mut versions = Versions::initial(OpSet::new());
        let mut op_set = OpSet::new();
        let remote = set_change("b", 1, 1, vec![]);
        op_set.add_change(remote.clone(), None).unwrap();
        versions.on_remote_apply(&op_set);

        // Authored against v0: deps and start_op come from v0's snapshot.
        let base = versions.find(0).unwrap();
        let local = set_change("a", 1, base.op_set.max_op + 1, base.op_set.heads());
        op_set.add_local_change(local.clone(), None).unwrap();
        let version = versions.on_local_change(0, &local, &op_set).unwrap();
        assert_eq!(version, 2);

        // v0's snapshot has the local change but still excludes the remote.
        let v0 = versions.find(0).unwrap();
        assert_eq!(v0.op_set.applied_seq("a"), 1);
        assert_eq!(v0.op_set.applied_seq("b"), 0);
        // v1 and the new v2 see both.
        let v1 = versions.find(1).unwrap();
        assert_eq!(v1.op_set.applied_seq("a"), 1);
        assert_eq!(v1.op_set.applied_seq("b"), 1);
        let v2 = versions.find(2).unwrap();
        assert!(v2.local_only);
        assert_eq!(v2.op_set.applied_seq("b"), 1);
    }
}
