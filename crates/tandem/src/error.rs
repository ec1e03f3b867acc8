//! [`BackendError`] — the error surface of the public facade.
//!
//! Missing dependencies are deliberately absent: a remote change whose
//! predecessors have not arrived is buffered inside the op set and applied
//! later, so the caller never sees it as an error.

use thiserror::Error;

use crate::change::codec::DecodeError;

#[derive(Debug, Error, PartialEq)]
pub enum BackendError {
    /// A change request had missing or ill-typed fields, or referenced a
    /// list position that does not exist.
    #[error("change request is malformed: {0}")]
    MalformedRequest(String),

    /// The request's sequence number was at or below one already recorded
    /// for its actor.
    #[error("change for actor {actor} with sequence {seq} has already been applied")]
    AlreadyApplied { actor: String, seq: u64 },

    /// The request referenced a base version the registry no longer holds.
    #[error("unknown base version {0}")]
    UnknownBaseVersion(u64),

    /// A decoded change was internally inconsistent: an op targeted a
    /// missing object, duplicated an insertion, or a local change arrived
    /// with unmet dependencies.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}
