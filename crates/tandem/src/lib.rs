//! tandem — operation-set reconciliation engine for collaborative documents.
//!
//! The backend maintains an authoritative, causally-consistent view of a
//! structured document (maps, tables, lists, text, counters) as an
//! append-only log of operations from multiple distributed actors, and
//! reconciles concurrent edits deterministically.
//!
//! # Overview
//!
//! - [`backend::Backend`] — the public facade: apply remote changes or
//!   front-end change requests, save/load, emit patches.
//! - [`opset::OpSet`] — the causal history: per-object op slots, actor
//!   states, the dependency frontier, and the out-of-order change queue.
//! - [`change`] — identifiers, ops, change batches, and their binary codec.
//! - [`skiplist::SkipList`] — the indexable element-order structure behind
//!   list and text objects.
//!
//! Mutating a backend consumes the handle and returns its successor, so a
//! stale snapshot cannot be reused by accident:
//!
//! ```
//! use tandem::{Backend, ChangeRequest};
//! use serde_json::json;
//!
//! let backend = Backend::init();
//! let request = ChangeRequest::from_json(&json!({
//!     "actor": "alice", "seq": 1, "version": 0, "time": 0,
//!     "requestType": "change",
//!     "ops": [{"action": "set", "obj": "_root", "key": "title",
//!              "insert": false, "value": "untitled"}],
//! })).unwrap();
//! let (backend, patch) = backend.apply_local_change(request, None).unwrap();
//! assert_eq!(patch.clock["alice"], 1);
//! assert_eq!(backend.get_heads().len(), 1);
//! ```

pub mod backend;
pub mod change;
pub mod error;
pub mod opset;
pub mod skiplist;

pub use backend::request::{ChangeRequest, RequestAction, RequestKey, RequestOp, RequestType};
pub use backend::Backend;
pub use change::codec::DecodeError;
pub use change::{Change, ChangeHash, Key, ObjId, ObjType, Op, OpAction, OpId};
pub use error::BackendError;
pub use opset::diff::{Diff, MapDiff, Patch, SeqDiff, SeqEdit, ValueDiff};
pub use opset::OpSet;
