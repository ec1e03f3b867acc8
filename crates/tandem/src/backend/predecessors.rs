//! Predecessor filling — annotating each op with the op IDs it overwrites.
//!
//! Within a change, an op that writes to a slot an earlier op of the same
//! change already wrote shadows that single op. Otherwise the op overwrites
//! whatever survives at the slot in the base op set the author referenced.

use std::collections::HashMap;

use crate::change::{Key, ObjId, Op, OpId};
use crate::opset::OpSet;

/// Fills `pred` on every op, in order. `base` is the op set of the version
/// the request was authored against, not necessarily the current one.
pub fn fill_predecessors(base: &OpSet, ops: &mut [Op], start_op: u64, actor: &str) {
    let mut my_ops: HashMap<(ObjId, Key), OpId> = HashMap::new();
    for (i, op) in ops.iter_mut().enumerate() {
        let id = OpId::new(start_op + i as u64, actor);
        let key = if op.insert {
            Key::Elem(id.clone())
        } else {
            op.key.clone()
        };
        let slot = (op.obj.clone(), key);
        match my_ops.get(&slot) {
            Some(earlier) => op.pred = vec![earlier.clone()],
            None => {
                op.pred = base
                    .get_field_ops(&slot.0, &slot.1)
                    .iter()
                    .map(|field| field.id.clone())
                    .collect();
            }
        }
        my_ops.entry(slot).or_insert(id);
    }
}
