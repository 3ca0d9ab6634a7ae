//! Structural properties of cluster trees under random workloads.

use arbor_core::{ColumnType, CoreError, ObjKey};
use arbor_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn run_ops(ops: &[ObjectOp]) -> Result<(), TestCaseError> {
    let db = TestDatabase::memory();
    let wt = db.begin_write().unwrap();
    let table = wt.group().add_table("objects").unwrap();
    let col = table.add_column("value", ColumnType::Int, false).unwrap();
    let mut model = BTreeMap::new();

    for op in ops {
        match *op {
            ObjectOp::Upsert(key, value) => {
                if !table.is_valid(key).unwrap() {
                    table.create_object_with_key(key).unwrap();
                }
                table.set(key, col, value).unwrap();
                model.insert(key, value);
            }
            ObjectOp::Remove(key) => match table.remove_object(key) {
                Ok(removed) => {
                    prop_assert_eq!(removed, 1);
                    prop_assert!(model.remove(&key).is_some());
                }
                Err(CoreError::KeyNotFound { .. }) => {
                    prop_assert!(!model.contains_key(&key));
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            },
        }
        table.verify().map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    let keys: Vec<ObjKey> = model.keys().copied().collect();
    prop_assert_eq!(table.keys().unwrap(), keys);
    prop_assert_eq!(table.size().unwrap(), model.len());
    for (&key, &value) in &model {
        prop_assert_eq!(table.get(key, col).unwrap(), Mixed::Int(value));
    }

    wt.commit().unwrap();
    let rt = db.begin_read().unwrap();
    let table = rt.table("objects").unwrap();
    table.verify().map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(table.size().unwrap(), model.len());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_workloads_keep_leaves_in_bounds(
        ops in proptest::collection::vec(object_op_strategy(), 0..200)
    ) {
        run_ops(&ops)?;
    }

    #[test]
    fn shuffled_inserts_then_full_erase(keys in obj_key_set_strategy(120)) {
        let db = TestDatabase::memory();
        let wt = db.begin_write().unwrap();
        let table = wt.group().add_table("objects").unwrap();
        for &key in &keys {
            table.create_object_with_key(key).unwrap();
        }
        table.verify().map_err(|e| TestCaseError::fail(e.to_string()))?;

        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(table.keys().unwrap(), sorted);

        for &key in keys.iter().rev() {
            prop_assert_eq!(table.remove_object(key).unwrap(), 1);
            table.verify().map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        prop_assert!(table.keys().unwrap().is_empty());
    }
}

#[test]
fn duplicate_key_is_rejected() {
    let db = TestDatabase::memory();
    let wt = db.begin_write().unwrap();
    let table = wt.group().add_table("objects").unwrap();
    table.create_object_with_key(ObjKey::new(7)).unwrap();
    assert!(matches!(
        table.create_object_with_key(ObjKey::new(7)),
        Err(CoreError::DuplicateKey { .. })
    ));
    assert_eq!(table.size().unwrap(), 1);
}

#[test]
fn sequential_growth_and_shrink() {
    let db = TestDatabase::memory();
    let wt = db.begin_write().unwrap();
    let table = wt.group().add_table("objects").unwrap();
    let keys: Vec<ObjKey> = (0..500).map(|_| table.create_object().unwrap()).collect();
    table.verify().unwrap();
    assert_eq!(table.size().unwrap(), 500);

    for key in keys.iter().step_by(2) {
        table.remove_object(*key).unwrap();
    }
    table.verify().unwrap();
    assert_eq!(table.size().unwrap(), 250);
    assert!(!table.is_valid(ObjKey::new(0)).unwrap());
    assert!(table.is_valid(ObjKey::new(1)).unwrap());
}

#[test]
fn full_key_range_survives_splits_and_commit() {
    let db = TestDatabase::memory();
    let wt = db.begin_write().unwrap();
    let table = wt.group().add_table("objects").unwrap();
    let col = table.add_column("value", ColumnType::Int, false).unwrap();
    for k in -10..=-6 {
        table.create_object_with_key(ObjKey::new(k)).unwrap();
    }
    let extremes = [i64::MAX, i64::MIN, i64::MAX - 1, i64::MIN + 1];
    for (i, k) in extremes.into_iter().enumerate() {
        table.create_object_with_key(ObjKey::new(k)).unwrap();
        table.set(ObjKey::new(k), col, i as i64).unwrap();
        table.verify().unwrap();
    }
    wt.commit().unwrap();

    let rt = db.begin_read().unwrap();
    let table = rt.table("objects").unwrap();
    table.verify().unwrap();
    let keys: Vec<i64> = table.keys().unwrap().into_iter().map(ObjKey::value).collect();
    assert_eq!(
        keys,
        vec![i64::MIN, i64::MIN + 1, -10, -9, -8, -7, -6, i64::MAX - 1, i64::MAX]
    );
    assert_eq!(table.get(ObjKey::new(i64::MIN), col).unwrap(), Mixed::Int(1));
    assert_eq!(table.get(ObjKey::new(i64::MAX - 1), col).unwrap(), Mixed::Int(2));
}
