//! # Eviction Under Memory Pressure
//!
//! Builds a tree an order of magnitude larger than the node cache and
//! checks that:
//!
//! - the resident set stays bounded by `node_cache_capacity`,
//! - every accessed node is resident at its access instant,
//! - nothing volatile is ever lost to eviction (the full tree reads back
//!   from disk afterwards).

use pmtree::{NodeKind, StoreConfig, TreeStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn measurement() -> NodeKind {
    NodeKind::Measurement {
        alias: None,
        data_type: 1,
        encoding: 0,
        compressor: 0,
    }
}

#[test]
fn resident_set_stays_bounded_under_random_access() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sg.pmt");
    let capacity = 100;

    // 100 databases x 100 measurements = 10,100 nodes, built under a
    // 100-node cache: the build itself continually flushes and evicts
    {
        let store = TreeStore::open(
            StoreConfig::new(&path).node_cache_capacity(capacity),
        )
        .unwrap();
        for d in 0..100 {
            let db_name = format!("db{d:03}");
            let db = match store.get_child(store.root(), &db_name).unwrap() {
                Some(id) => id,
                None => store
                    .add_child(store.root(), &db_name, NodeKind::Database)
                    .unwrap(),
            };
            store.pin(db).unwrap();
            for s in 0..100 {
                store
                    .add_child(db, &format!("s{s:03}"), measurement())
                    .unwrap();
            }
            store.unpin(db).unwrap();
            assert!(
                store.resident_count() <= capacity + 2,
                "resident {} exceeded capacity {} during build",
                store.resident_count(),
                capacity
            );
        }
        store.close().unwrap();
    }

    let store = TreeStore::open(
        StoreConfig::new(&path).node_cache_capacity(capacity),
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..1000 {
        let d: u32 = rng.gen_range(0..100);
        let s: u32 = rng.gen_range(0..100);
        let db = store
            .get_child(store.root(), &format!("db{d:03}"))
            .unwrap()
            .expect("database must be on disk");
        assert!(store.is_resident(db), "db must be resident at access instant");

        let sensor = store
            .get_child(db, &format!("s{s:03}"))
            .unwrap()
            .expect("measurement must be on disk");
        assert!(
            store.is_resident(sensor),
            "measurement must be resident at access instant"
        );

        assert!(
            store.resident_count() <= capacity + 2,
            "resident {} exceeded capacity {}",
            store.resident_count(),
            capacity
        );
    }
}

#[test]
fn full_tree_survives_pressured_build() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sg.pmt");

    {
        let store = TreeStore::open(StoreConfig::new(&path).node_cache_capacity(50)).unwrap();
        for d in 0..20 {
            let db_name = format!("db{d:02}");
            let db = match store.get_child(store.root(), &db_name).unwrap() {
                Some(id) => id,
                None => store
                    .add_child(store.root(), &db_name, NodeKind::Database)
                    .unwrap(),
            };
            store.pin(db).unwrap();
            for s in 0..50 {
                store
                    .add_child(db, &format!("s{s:02}"), measurement())
                    .unwrap();
            }
            store.unpin(db).unwrap();
        }
        store.close().unwrap();
    }

    // everything written under pressure must read back
    let store = TreeStore::open(StoreConfig::new(&path).node_cache_capacity(50)).unwrap();
    for d in 0..20 {
        let db = store
            .get_child(store.root(), &format!("db{d:02}"))
            .unwrap()
            .unwrap_or_else(|| panic!("db{d:02} lost under pressure"));
        for s in 0..50 {
            assert!(
                store.get_child(db, &format!("s{s:02}")).unwrap().is_some(),
                "db{d:02}/s{s:02} lost under pressure"
            );
        }
    }
}

#[test]
fn pinned_chain_survives_while_cold_nodes_cycle() {
    let dir = tempdir().unwrap();
    let store = TreeStore::open(
        StoreConfig::new(dir.path().join("sg.pmt")).node_cache_capacity(20),
    )
    .unwrap();

    let db = store
        .add_child(store.root(), "db", NodeKind::Database)
        .unwrap();
    let dev = store
        .add_child(db, "dev", NodeKind::Device { aligned: false })
        .unwrap();
    store.pin(dev).unwrap();

    for i in 0..200 {
        store
            .add_child(store.root(), &format!("noise{i:03}"), NodeKind::Database)
            .unwrap();
    }

    assert!(store.is_resident(dev), "pinned node evicted");
    assert!(store.is_resident(db), "pinned node's parent evicted");
    store.unpin(dev).unwrap();
}
