//! Front-end change requests and their translation into canonical changes.
//!
//! # Overview
//!
//! A request arrives with temporary IDs for newly created containers and
//! integer indices for list positions, authored against a (possibly
//! lagging) base version. Translation resolves both into canonical op IDs
//! and element-ID keys, folding redundant same-slot writes as it goes, so
//! the resulting change is position-independent and safe to merge with
//! concurrent edits.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::change::{Key, ObjId, ObjType, ObjectIds, Op, OpAction, OpId};
use crate::error::BackendError;
use crate::opset::OpSet;
use crate::skiplist::SkipList;

// ── Request shapes ─────────────────────────────────────────────────────────

/// A change request as issued by the front-end.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub actor: String,
    /// 1-based, dense per actor.
    pub seq: u64,
    /// The registry version this request was authored against.
    pub version: u64,
    pub time: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_type: RequestType,
    pub ops: Vec<RequestOp>,
}

impl ChangeRequest {
    /// Deserializes a request, mapping missing or ill-typed fields to
    /// [`BackendError::MalformedRequest`].
    pub fn from_json(value: &Value) -> Result<ChangeRequest, BackendError> {
        serde_json::from_value(value.clone())
            .map_err(|err| BackendError::MalformedRequest(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    #[default]
    Change,
}

/// One op in a request. `obj` and `child` may be temporary IDs; `key` is a
/// property name for maps and an integer index for sequences.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOp {
    pub action: RequestAction,
    pub obj: String,
    pub key: RequestKey,
    #[serde(default)]
    pub insert: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub child: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestAction {
    Set,
    Del,
    Inc,
    Link,
    MakeMap,
    MakeTable,
    MakeList,
    MakeText,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RequestKey {
    Index(u64),
    Prop(String),
}

// ── Translation ────────────────────────────────────────────────────────────

/// Resolves a front-end object reference: the root, a temporary ID, or a
/// canonical op-ID string.
fn resolve_object(object_ids: &ObjectIds, raw: &str) -> Result<ObjId, BackendError> {
    if raw == "_root" {
        return Ok(ObjId::Root);
    }
    if let Some(mapped) = object_ids.get(raw) {
        return Ok(mapped.clone());
    }
    if let Some(id) = OpId::parse(raw) {
        return Ok(ObjId::Id(id));
    }
    Err(BackendError::MalformedRequest(format!(
        "unresolvable object reference {:?}",
        raw
    )))
}

fn build_action(object_ids: &ObjectIds, rop: &RequestOp) -> Result<OpAction, BackendError> {
    match rop.action {
        RequestAction::Set => {
            let value = rop.value.clone().ok_or_else(|| {
                BackendError::MalformedRequest("set op is missing a value".into())
            })?;
            Ok(OpAction::Set(value))
        }
        RequestAction::Del => Ok(OpAction::Del),
        RequestAction::Inc => {
            let delta = rop.value.as_ref().and_then(Value::as_i64).ok_or_else(|| {
                BackendError::MalformedRequest("inc op needs an integer value".into())
            })?;
            Ok(OpAction::Inc(delta))
        }
        RequestAction::Link => {
            let child = rop.child.as_deref().ok_or_else(|| {
                BackendError::MalformedRequest("link op is missing its child".into())
            })?;
            Ok(OpAction::Link {
                child: resolve_object(object_ids, child)?,
            })
        }
        RequestAction::MakeMap => Ok(OpAction::MakeMap),
        RequestAction::MakeTable => Ok(OpAction::MakeTable),
        RequestAction::MakeList => Ok(OpAction::MakeList),
        RequestAction::MakeText => Ok(OpAction::MakeText),
    }
}

/// Adds `delta` to a folded assignment.
fn fold_increment(prev: &mut Op, delta: i64) -> Result<(), BackendError> {
    match &mut prev.action {
        OpAction::Set(Value::Number(n)) => {
            let bumped = if let Some(i) = n.as_i64() {
                Value::from(i + delta)
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or(0.0) + delta as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            };
            prev.action = OpAction::Set(bumped);
            Ok(())
        }
        OpAction::Inc(n) => {
            *n += delta;
            Ok(())
        }
        _ => Err(BackendError::MalformedRequest(
            "inc op targets a non-numeric assignment in the same change".into(),
        )),
    }
}

/// Translates the request's ops into canonical ops, updating `object_ids`
/// with any newly created containers.
///
/// Op IDs are positional over the *output*: ops folded away by
/// deduplication consume no counter, so the change's counters stay dense.
pub fn process_request_ops(
    base: &OpSet,
    object_ids: &mut ObjectIds,
    request: &ChangeRequest,
    start_op: u64,
) -> Result<Vec<Op>, BackendError> {
    let mut ops: Vec<Op> = Vec::new();
    let mut assignments: HashMap<(ObjId, Key), usize> = HashMap::new();
    // Per-object working copies of the element order, as the author saw it,
    // updated as this request's own inserts and deletes land.
    let mut working: HashMap<ObjId, SkipList<OpId>> = HashMap::new();
    let mut created: HashMap<ObjId, ObjType> = HashMap::new();

    for rop in &request.ops {
        let obj = resolve_object(object_ids, &rop.obj)?;
        let obj_type = created
            .get(&obj)
            .copied()
            .or_else(|| base.object_type(&obj))
            .ok_or_else(|| {
                BackendError::MalformedRequest(format!("op targets unknown object {}", rop.obj))
            })?;
        let op_id = OpId::new(start_op + ops.len() as u64, &request.actor);

        let key = if obj_type.is_sequence() {
            let RequestKey::Index(index) = rop.key else {
                return Err(BackendError::MalformedRequest(
                    "sequence ops address elements by index".into(),
                ));
            };
            let index = index as usize;
            let list = working.entry(obj.clone()).or_insert_with(|| {
                base.by_object
                    .get(&obj)
                    .and_then(|state| state.seq.as_ref())
                    .map(|seq| seq.elem_ids.clone())
                    .unwrap_or_default()
            });
            if rop.insert {
                if index == 0 {
                    list.insert_after(None, op_id.clone());
                    Key::Head
                } else {
                    let prev = list.key_of(index - 1).cloned().ok_or_else(|| {
                        BackendError::MalformedRequest(format!(
                            "insert index {} out of bounds",
                            index
                        ))
                    })?;
                    list.insert_after(Some(&prev), op_id.clone());
                    Key::Elem(prev)
                }
            } else {
                let elem = list.key_of(index).cloned().ok_or_else(|| {
                    BackendError::MalformedRequest(format!("index {} out of bounds", index))
                })?;
                if rop.action == RequestAction::Del {
                    list.remove_key(&elem);
                }
                Key::Elem(elem)
            }
        } else {
            let RequestKey::Prop(name) = &rop.key else {
                return Err(BackendError::MalformedRequest(
                    "map ops address fields by name".into(),
                ));
            };
            Key::Map(name.clone())
        };

        let action = build_action(object_ids, rop)?;

        // Fold repeated plain assignments to the same slot.
        if !rop.insert && action.object_type().is_none() {
            if let Some(&at) = assignments.get(&(obj.clone(), key.clone())) {
                match action {
                    OpAction::Inc(delta) => fold_increment(&mut ops[at], delta)?,
                    other => ops[at].action = other,
                }
                continue;
            }
            assignments.insert((obj.clone(), key.clone()), ops.len());
        }

        if let Some(child_type) = action.object_type() {
            let temp = rop.child.as_deref().ok_or_else(|| {
                BackendError::MalformedRequest("make op is missing its child id".into())
            })?;
            object_ids.insert(temp.to_owned(), ObjId::Id(op_id.clone()));
            created.insert(ObjId::Id(op_id.clone()), child_type);
        }

        ops.push(Op {
            action,
            obj,
            key,
            insert: rop.insert,
            pred: Vec::new(),
        });
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use serde_json::json;

    fn request(actor: &str, ops: Vec<RequestOp>) -> ChangeRequest {
        ChangeRequest {
            actor: actor.into(),
            seq: 1,
            version: 0,
            time: 0,
            message: None,
            request_type: RequestType::Change,
            ops,
        }
    }

    fn rop(action: RequestAction, obj: &str, key: RequestKey) -> RequestOp {
        RequestOp {
            action,
            obj: obj.into(),
            key,
            insert: false,
            value: None,
            child: None,
        }
    }

    #[test]
    fn request_deserializes_from_front_end_json() {
        let req = ChangeRequest::from_json(&json!({
            "actor": "a",
            "seq": 1,
            "version": 0,
            "time": 99,
            "requestType": "change",
            "ops": [
                {"action": "set", "obj": "_root", "key": "x", "insert": false, "value": 1}
            ]
        }))
        .unwrap();
        assert_eq!(req.actor, "a");
        assert_eq!(req.ops.len(), 1);
        assert_eq!(req.ops[0].key, RequestKey::Prop("x".into()));
        assert_eq!(req.ops[0].value, Some(json!(1)));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = ChangeRequest::from_json(&json!({"actor": "a", "seq": 1, "ops": []}))
            .unwrap_err();
        assert!(matches!(err, BackendError::MalformedRequest(_)));
    }

    #[test]
    fn integer_keys_parse_as_indices() {
        let op: RequestOp = serde_json::from_value(json!({
            "action": "set", "obj": "1@a", "key": 2, "insert": true, "value": "x"
        }))
        .unwrap();
        assert_eq!(op.key, RequestKey::Index(2));
    }

    #[test]
    fn temporary_ids_resolve_to_creating_op() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut make = rop(RequestAction::MakeMap, "_root", RequestKey::Prop("m".into()));
        make.child = Some("tmp-1".into());
        let mut set = rop(RequestAction::Set, "tmp-1", RequestKey::Prop("k".into()));
        set.value = Some(json!(true));
        let req = request("a", vec![make, set]);
        let ops = process_request_ops(&base, &mut object_ids, &req, 1).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].action, OpAction::MakeMap);
        assert_eq!(ops[1].obj, ObjId::Id(OpId::new(1, "a")));
        assert_eq!(object_ids["tmp-1"], ObjId::Id(OpId::new(1, "a")));
    }

    #[test]
    fn list_indices_become_element_ids() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut make = rop(RequestAction::MakeList, "_root", RequestKey::Prop("xs".into()));
        make.child = Some("tmp-l".into());
        let mut ins0 = rop(RequestAction::Set, "tmp-l", RequestKey::Index(0));
        ins0.insert = true;
        ins0.value = Some(json!("a"));
        let mut ins1 = rop(RequestAction::Set, "tmp-l", RequestKey::Index(1));
        ins1.insert = true;
        ins1.value = Some(json!("b"));
        let del = rop(RequestAction::Del, "tmp-l", RequestKey::Index(0));
        let mut set_tail = rop(RequestAction::Set, "tmp-l", RequestKey::Index(0));
        set_tail.value = Some(json!("B"));

        let req = request("a", vec![make, ins0, ins1, del, set_tail]);
        let ops = process_request_ops(&base, &mut object_ids, &req, 1).unwrap();
        // make, insert@head, insert-after-2@a, del of 2@a, set of 3@a.
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[1].key, Key::Head);
        assert!(ops[1].insert);
        assert_eq!(ops[2].key, Key::Elem(OpId::new(2, "a")));
        assert_eq!(ops[3].action, OpAction::Del);
        assert_eq!(ops[3].key, Key::Elem(OpId::new(2, "a")));
        // After the delete, index 0 is the element inserted second.
        assert_eq!(ops[4].key, Key::Elem(OpId::new(3, "a")));
    }

    #[test]
    fn out_of_bounds_index_is_malformed() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut make = rop(RequestAction::MakeList, "_root", RequestKey::Prop("xs".into()));
        make.child = Some("tmp-l".into());
        let mut ins = rop(RequestAction::Set, "tmp-l", RequestKey::Index(5));
        ins.insert = true;
        ins.value = Some(json!("x"));
        let req = request("a", vec![make, ins]);
        let err = process_request_ops(&base, &mut object_ids, &req, 1).unwrap_err();
        assert!(matches!(err, BackendError::MalformedRequest(_)));
    }

    #[test]
    fn repeated_sets_fold_in_place() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut first = rop(RequestAction::Set, "_root", RequestKey::Prop("x".into()));
        first.value = Some(json!(1));
        let mut second = rop(RequestAction::Set, "_root", RequestKey::Prop("x".into()));
        second.value = Some(json!(2));
        let req = request("a", vec![first, second]);
        let ops = process_request_ops(&base, &mut object_ids, &req, 1).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OpAction::Set(json!(2)));
    }

    #[test]
    fn increments_fold_additively() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut set = rop(RequestAction::Set, "_root", RequestKey::Prop("c".into()));
        set.value = Some(json!(10));
        let mut inc = rop(RequestAction::Inc, "_root", RequestKey::Prop("c".into()));
        inc.value = Some(json!(5));
        let mut inc2 = rop(RequestAction::Inc, "_root", RequestKey::Prop("c".into()));
        inc2.value = Some(json!(-2));
        let req = request("a", vec![set, inc, inc2]);
        let ops = process_request_ops(&base, &mut object_ids, &req, 1).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OpAction::Set(json!(13)));
    }

    #[test]
    fn folded_ops_consume_no_counters() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut a = rop(RequestAction::Set, "_root", RequestKey::Prop("x".into()));
        a.value = Some(json!(1));
        let mut b = rop(RequestAction::Set, "_root", RequestKey::Prop("x".into()));
        b.value = Some(json!(2));
        let mut c = rop(RequestAction::Set, "_root", RequestKey::Prop("y".into()));
        c.value = Some(json!(3));
        let req = request("a", vec![a, b, c]);
        let ops = process_request_ops(&base, &mut object_ids, &req, 1).unwrap();
        assert_eq!(ops.len(), 2);
        let change = Change::build("a".into(), 1, 1, 0, None, vec![], ops);
        assert_eq!(change.max_op(), Some(2));
        // "y" got the second counter, with no gap for the folded set.
        assert_eq!(change.op_id_at(1), OpId::new(2, "a"));
    }

    #[test]
    fn unknown_object_is_malformed() {
        let base = OpSet::new();
        let mut object_ids = ObjectIds::new();
        let mut set = rop(RequestAction::Set, "9@ghost", RequestKey::Prop("x".into()));
        set.value = Some(json!(1));
        let req = request("a", vec![set]);
        let err = process_request_ops(&base, &mut object_ids, &req, 1).unwrap_err();
        assert!(matches!(err, BackendError::MalformedRequest(_)));
    }
}
