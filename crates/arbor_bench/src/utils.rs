//! Benchmark utilities.

use arbor_core::{ColKey, ColumnType, Config, Database, ObjKey};
use rand::seq::SliceRandom;
use rand::Rng;

/// Benchmark configuration: default fanouts, no fsync, eager reclaim.
pub fn bench_config() -> Config {
    Config::new().sync_on_commit(false)
}

/// Generate `count` distinct keys in random order.
pub fn shuffled_keys(count: usize) -> Vec<ObjKey> {
    let mut keys: Vec<ObjKey> = (0..count as i64).map(ObjKey::new).collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// Generate `count` random short strings.
pub fn random_strings(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| format!("key-{:08x}", rng.gen::<u32>()))
        .collect()
}

/// Open an in-memory database holding one committed table `bench` with an
/// integer column and `count` objects.
pub fn populated_db(count: usize) -> (Database, ColKey, Vec<ObjKey>) {
    let db = Database::open_in_memory(bench_config()).unwrap();
    let wt = db.begin_write().unwrap();
    let table = wt.group().add_table("bench").unwrap();
    let col = table.add_column("value", ColumnType::Int, false).unwrap();
    let keys: Vec<ObjKey> = (0..count)
        .map(|i| {
            let key = table.create_object().unwrap();
            table.set(key, col, i as i64).unwrap();
            key
        })
        .collect();
    wt.commit().unwrap();
    (db, col, keys)
}
