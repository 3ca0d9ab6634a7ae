//! Property-based testing generators.

use arbor_core::{Mixed, ObjKey, Timestamp};
use bytes::Bytes;
use proptest::prelude::*;

/// Strategy for generating table and column names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// Strategy for generating object keys, negative and extreme ones included.
pub fn obj_key_strategy() -> impl Strategy<Value = ObjKey> {
    prop_oneof![
        8 => -1_000i64..1_000,
        1 => any::<i64>(),
        1 => prop_oneof![Just(i64::MIN), Just(i64::MAX), Just(i64::MIN + 1), Just(i64::MAX - 1)],
    ]
    .prop_map(ObjKey::new)
}

/// Strategy for a set of distinct object keys in random order.
pub fn obj_key_set_strategy(max: usize) -> impl Strategy<Value = Vec<ObjKey>> {
    proptest::collection::hash_set(obj_key_strategy(), 0..max)
        .prop_map(|keys| keys.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

/// Strategy for generating timestamps.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (any::<i64>(), 0..1_000_000_000i32).prop_map(|(s, n)| Timestamp::new(s, n))
}

/// Strategy for generating any non-link value.
pub fn mixed_strategy() -> impl Strategy<Value = Mixed> {
    prop_oneof![
        Just(Mixed::Null),
        any::<bool>().prop_map(Mixed::Bool),
        any::<i64>().prop_map(Mixed::Int),
        any::<f32>().prop_map(Mixed::Float),
        any::<f64>().prop_map(Mixed::Double),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Mixed::String),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(|b| Mixed::Binary(Bytes::from(b))),
        timestamp_strategy().prop_map(Mixed::Timestamp),
    ]
}

/// Strategy for dictionary keys drawn from a small pool, so that generated
/// operations collide on keys often.
pub fn dict_key_strategy() -> impl Strategy<Value = Mixed> {
    prop_oneof![
        (0i64..16).prop_map(Mixed::Int),
        "[a-d]{1,2}".prop_map(Mixed::String),
        Just(Mixed::Null),
    ]
}

/// A single dictionary operation.
#[derive(Debug, Clone)]
pub enum DictOp {
    /// Insert or overwrite an entry.
    Insert(Mixed, Mixed),
    /// Erase an entry if present.
    Erase(Mixed),
    /// Remove every entry.
    Clear,
}

/// Strategy for generating dictionary operations.
pub fn dict_op_strategy() -> impl Strategy<Value = DictOp> {
    prop_oneof![
        6 => (dict_key_strategy(), mixed_strategy()).prop_map(|(k, v)| DictOp::Insert(k, v)),
        3 => dict_key_strategy().prop_map(DictOp::Erase),
        1 => Just(DictOp::Clear),
    ]
}

/// Strategy for generating a sequence of dictionary operations.
pub fn dict_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<DictOp>> {
    proptest::collection::vec(dict_op_strategy(), 0..max_len)
}

/// A single operation on a table's objects.
#[derive(Debug, Clone)]
pub enum ObjectOp {
    /// Create the object if absent and set its value.
    Upsert(ObjKey, i64),
    /// Remove the object if present.
    Remove(ObjKey),
}

/// Strategy for generating object operations over a narrow key range.
pub fn object_op_strategy() -> impl Strategy<Value = ObjectOp> {
    let key = (-32i64..32).prop_map(ObjKey::new);
    prop_oneof![
        3 => (key.clone(), any::<i64>()).prop_map(|(k, v)| ObjectOp::Upsert(k, v)),
        2 => key.prop_map(ObjectOp::Remove),
    ]
}
