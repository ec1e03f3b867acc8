//! Binary codec for changes and documents.
//!
//! # Overview
//!
//! A change encodes to a canonical, deterministic blob: identical changes
//! produce identical bytes, and the SHA-256 of the blob is the change's
//! identity. Ops are positional — the op at index `i` has ID
//! `start_op + i` — so no per-op IDs appear on the wire. Op IDs that
//! reference other actors go through a foreign-actor table collected in
//! first-appearance order.
//!
//! A document is a framed sequence of change blobs in application order.
//! [`split_containers`] separates the frames without decoding them, so a
//! multi-change container can be relayed chunk by chunk.

pub mod reader;
pub mod writer;

use std::fmt;

use serde_json::Value;

use super::{Change, ChangeHash, Key, ObjId, Op, OpAction, OpId};
use reader::Reader;
use writer::Writer;

/// First byte of an encoded change.
pub const CHANGE_MAGIC: u8 = 0xA1;
/// First two bytes of an encoded document.
pub const DOCUMENT_MAGIC: [u8; 2] = [0xD0, 0x0C];

// ── Errors ─────────────────────────────────────────────────────────────────

/// Decoding failure for a change or document blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input was too short.
    UnexpectedEof,
    /// The blob does not start with a change or document magic byte.
    BadMagic(u8),
    /// An unknown op action tag was encountered.
    UnknownAction(u8),
    /// An unknown object/key tag was encountered.
    UnknownTag(u8),
    /// An op ID referenced an actor-table slot that does not exist.
    BadActorRef(u64),
    /// A string was not valid UTF-8.
    InvalidUtf8,
    /// A varint exceeded 64 bits.
    IntegerOverflow,
    /// A scalar value payload was not valid CBOR.
    InvalidValue,
    /// Bytes remained after a complete change was decoded.
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            DecodeError::BadMagic(b) => write!(f, "unrecognized magic byte: {:#04x}", b),
            DecodeError::UnknownAction(t) => write!(f, "unknown op action tag: {}", t),
            DecodeError::UnknownTag(t) => write!(f, "unknown object or key tag: {}", t),
            DecodeError::BadActorRef(i) => write!(f, "actor table has no entry {}", i),
            DecodeError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            DecodeError::IntegerOverflow => write!(f, "varint exceeds 64 bits"),
            DecodeError::InvalidValue => write!(f, "invalid CBOR value payload"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after change"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Op action tags ─────────────────────────────────────────────────────────

const ACTION_SET: u8 = 0;
const ACTION_DEL: u8 = 1;
const ACTION_INC: u8 = 2;
const ACTION_LINK: u8 = 3;
const ACTION_MAKE_MAP: u8 = 4;
const ACTION_MAKE_TABLE: u8 = 5;
const ACTION_MAKE_LIST: u8 = 6;
const ACTION_MAKE_TEXT: u8 = 7;

const FLAG_INSERT: u8 = 0x08;

const OBJ_ROOT: u8 = 0;
const OBJ_ID: u8 = 1;

const KEY_MAP: u8 = 0;
const KEY_HEAD: u8 = 1;
const KEY_ELEM: u8 = 2;

// ── Encoding ───────────────────────────────────────────────────────────────

/// Foreign actors referenced by a change's op IDs, in first-appearance
/// order. Slot 0 of the reference space is the change's own actor.
fn collect_foreign_actors(change: &Change) -> Vec<String> {
    let mut actors: Vec<String> = Vec::new();
    let mut visit = |id: &OpId| {
        if id.actor != change.actor && !actors.iter().any(|a| *a == id.actor) {
            actors.push(id.actor.clone());
        }
    };
    for op in &change.ops {
        if let ObjId::Id(id) = &op.obj {
            visit(id);
        }
        if let Key::Elem(id) = &op.key {
            visit(id);
        }
        if let OpAction::Link {
            child: ObjId::Id(id),
        } = &op.action
        {
            visit(id);
        }
        for id in &op.pred {
            visit(id);
        }
    }
    actors
}

fn actor_ref(change: &Change, actors: &[String], id: &OpId) -> u64 {
    if id.actor == change.actor {
        return 0;
    }
    // collect_foreign_actors visited every op ID, so the lookup cannot miss.
    let idx = actors
        .iter()
        .position(|a| *a == id.actor)
        .expect("op ID actor missing from collected actor table");
    idx as u64 + 1
}

fn encode_op_id(w: &mut Writer, change: &Change, actors: &[String], id: &OpId) {
    w.vu64(id.counter);
    w.vu64(actor_ref(change, actors, id));
}

fn encode_obj_id(w: &mut Writer, change: &Change, actors: &[String], obj: &ObjId) {
    match obj {
        ObjId::Root => w.u8(OBJ_ROOT),
        ObjId::Id(id) => {
            w.u8(OBJ_ID);
            encode_op_id(w, change, actors, id);
        }
    }
}

fn encode_value(w: &mut Writer, value: &Value) {
    let mut cbor = Vec::new();
    ciborium::ser::into_writer(value, &mut cbor)
        .expect("CBOR encoding of a JSON value cannot fail");
    w.block(&cbor);
}

fn encode_op(w: &mut Writer, change: &Change, actors: &[String], op: &Op) {
    let tag = match &op.action {
        OpAction::Set(_) => ACTION_SET,
        OpAction::Del => ACTION_DEL,
        OpAction::Inc(_) => ACTION_INC,
        OpAction::Link { .. } => ACTION_LINK,
        OpAction::MakeMap => ACTION_MAKE_MAP,
        OpAction::MakeTable => ACTION_MAKE_TABLE,
        OpAction::MakeList => ACTION_MAKE_LIST,
        OpAction::MakeText => ACTION_MAKE_TEXT,
    };
    let flags = tag | if op.insert { FLAG_INSERT } else { 0 };
    w.u8(flags);
    encode_obj_id(w, change, actors, &op.obj);
    match &op.key {
        Key::Map(s) => {
            w.u8(KEY_MAP);
            w.str(s);
        }
        Key::Head => w.u8(KEY_HEAD),
        Key::Elem(id) => {
            w.u8(KEY_ELEM);
            encode_op_id(w, change, actors, id);
        }
    }
    w.vu64(op.pred.len() as u64);
    for id in &op.pred {
        encode_op_id(w, change, actors, id);
    }
    match &op.action {
        OpAction::Set(value) => encode_value(w, value),
        OpAction::Inc(n) => w.vi64(*n),
        OpAction::Link { child } => encode_obj_id(w, change, actors, child),
        _ => {}
    }
}

/// Encodes a change to its canonical blob. The `hash` field is ignored; it
/// is defined as the SHA-256 of these bytes.
pub fn encode_change(change: &Change) -> Vec<u8> {
    let actors = collect_foreign_actors(change);
    let mut w = Writer::new();
    w.u8(CHANGE_MAGIC);
    w.str(&change.actor);
    w.vu64(change.seq);
    w.vu64(change.start_op);
    w.vi64(change.time);
    match &change.message {
        Some(msg) => {
            w.u8(1);
            w.str(msg);
        }
        None => w.u8(0),
    }
    w.vu64(change.deps.len() as u64);
    for dep in &change.deps {
        w.bytes(&dep.0);
    }
    w.vu64(actors.len() as u64);
    for actor in &actors {
        w.str(actor);
    }
    w.vu64(change.ops.len() as u64);
    for op in &change.ops {
        encode_op(&mut w, change, &actors, op);
    }
    w.into_bytes()
}

// ── Decoding ───────────────────────────────────────────────────────────────

fn decode_op_id(r: &mut Reader<'_>, actor: &str, actors: &[String]) -> Result<OpId, DecodeError> {
    let counter = r.vu64()?;
    let reference = r.vu64()?;
    let actor = if reference == 0 {
        actor.to_owned()
    } else {
        actors
            .get(reference as usize - 1)
            .ok_or(DecodeError::BadActorRef(reference))?
            .clone()
    };
    Ok(OpId { counter, actor })
}

fn decode_obj_id(r: &mut Reader<'_>, actor: &str, actors: &[String]) -> Result<ObjId, DecodeError> {
    match r.u8()? {
        OBJ_ROOT => Ok(ObjId::Root),
        OBJ_ID => Ok(ObjId::Id(decode_op_id(r, actor, actors)?)),
        tag => Err(DecodeError::UnknownTag(tag)),
    }
}

fn decode_value(r: &mut Reader<'_>) -> Result<Value, DecodeError> {
    let cbor = r.block()?;
    ciborium::de::from_reader(cbor).map_err(|_| DecodeError::InvalidValue)
}

fn decode_op(r: &mut Reader<'_>, actor: &str, actors: &[String]) -> Result<Op, DecodeError> {
    let flags = r.u8()?;
    let insert = flags & FLAG_INSERT != 0;
    let tag = flags & 0x07;
    let obj = decode_obj_id(r, actor, actors)?;
    let key = match r.u8()? {
        KEY_MAP => Key::Map(r.str()?),
        KEY_HEAD => Key::Head,
        KEY_ELEM => Key::Elem(decode_op_id(r, actor, actors)?),
        other => return Err(DecodeError::UnknownTag(other)),
    };
    let pred_count = r.vu64()? as usize;
    let mut pred = Vec::with_capacity(pred_count.min(64));
    for _ in 0..pred_count {
        pred.push(decode_op_id(r, actor, actors)?);
    }
    let action = match tag {
        ACTION_SET => OpAction::Set(decode_value(r)?),
        ACTION_DEL => OpAction::Del,
        ACTION_INC => OpAction::Inc(r.vi64()?),
        ACTION_LINK => OpAction::Link {
            child: decode_obj_id(r, actor, actors)?,
        },
        ACTION_MAKE_MAP => OpAction::MakeMap,
        ACTION_MAKE_TABLE => OpAction::MakeTable,
        ACTION_MAKE_LIST => OpAction::MakeList,
        ACTION_MAKE_TEXT => OpAction::MakeText,
        other => return Err(DecodeError::UnknownAction(other)),
    };
    Ok(Op {
        action,
        obj,
        key,
        insert,
        pred,
    })
}

/// Decodes a single change blob. The change's hash is the SHA-256 of the
/// input bytes.
pub fn decode_change(data: &[u8]) -> Result<Change, DecodeError> {
    let mut r = Reader::new(data);
    match r.u8()? {
        CHANGE_MAGIC => {}
        other => return Err(DecodeError::BadMagic(other)),
    }
    let actor = r.str()?;
    let seq = r.vu64()?;
    let start_op = r.vu64()?;
    let time = r.vi64()?;
    let message = match r.u8()? {
        0 => None,
        _ => Some(r.str()?),
    };
    let dep_count = r.vu64()? as usize;
    let mut deps = Vec::with_capacity(dep_count.min(64));
    for _ in 0..dep_count {
        let bytes: [u8; 32] = r.take(32)?.try_into().expect("take returned 32 bytes");
        deps.push(ChangeHash(bytes));
    }
    let actor_count = r.vu64()? as usize;
    let mut actors = Vec::with_capacity(actor_count.min(64));
    for _ in 0..actor_count {
        actors.push(r.str()?);
    }
    let op_count = r.vu64()? as usize;
    let mut ops = Vec::with_capacity(op_count.min(1024));
    for _ in 0..op_count {
        ops.push(decode_op(&mut r, &actor, &actors)?);
    }
    if !r.done() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(Change {
        actor,
        seq,
        start_op,
        time,
        message,
        deps,
        ops,
        hash: ChangeHash::of(data),
    })
}

// ── Containers ─────────────────────────────────────────────────────────────

/// Splits a blob into single-change chunks without decoding the ops.
///
/// A change blob yields itself; a document blob yields its frames.
pub fn split_containers(data: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    match data.first() {
        Some(&CHANGE_MAGIC) => Ok(vec![data.to_vec()]),
        Some(&b) if b == DOCUMENT_MAGIC[0] => {
            let mut r = Reader::new(data);
            let _ = r.u8()?;
            let second = r.u8()?;
            if second != DOCUMENT_MAGIC[1] {
                return Err(DecodeError::BadMagic(second));
            }
            let count = r.vu64()? as usize;
            let mut chunks = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                chunks.push(r.block()?.to_vec());
            }
            if !r.done() {
                return Err(DecodeError::TrailingBytes);
            }
            Ok(chunks)
        }
        Some(&b) => Err(DecodeError::BadMagic(b)),
        None => Err(DecodeError::UnexpectedEof),
    }
}

/// Decodes every change in a blob (single change or document container).
pub fn decode_changes(data: &[u8]) -> Result<Vec<Change>, DecodeError> {
    split_containers(data)?
        .iter()
        .map(|chunk| decode_change(chunk))
        .collect()
}

/// Encodes a document: the given changes, framed, in order.
pub fn encode_document(changes: &[Change]) -> Vec<u8> {
    let mut w = Writer::new();
    w.bytes(&DOCUMENT_MAGIC);
    w.vu64(changes.len() as u64);
    for change in changes {
        w.block(&encode_change(change));
    }
    w.into_bytes()
}

/// Decodes a document blob back into its changes, in application order.
pub fn decode_document(data: &[u8]) -> Result<Vec<Change>, DecodeError> {
    decode_changes(data)
}
