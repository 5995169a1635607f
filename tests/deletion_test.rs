use std::sync::Arc;

use quiver::error::Result;
use quiver::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn build(count: u64, dim: usize) -> Result<(HnswIndex, Arc<MemoryVectorStore>)> {
    let store = Arc::new(MemoryVectorStore::new());
    let config = UserConfig::default().with_distance(DistanceMetric::Cosine);
    let index = HnswIndex::open(IndexOptions::new("deletion", dim, store.clone()).with_config(config))?;
    let mut rng = StdRng::seed_from_u64(5);
    let ctx = Context::background();
    for id in 0..count {
        let v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() - 0.5).collect();
        store.put(id, v.clone());
        index.add(&ctx, id, &v)?;
    }
    Ok((index, store))
}

#[test]
fn test_deleted_vectors_are_invisible_before_and_after_cleanup() -> Result<()> {
    let (index, store) = build(500, 12)?;
    let ctx = Context::background();
    let deleted: Vec<u64> = (0..500).filter(|id| id % 5 == 0).collect();
    for id in &deleted {
        index.delete(*id)?;
    }

    // 1. Tombstoned: traversed but never returned.
    for id in &deleted {
        let v = store.vector_for_id(&ctx, *id)?;
        let results = index.search_by_vector(&ctx, &v, 5, None)?;
        assert!(!results.ids.contains(id), "deleted {id} returned");
        assert_eq!(results.len(), 5);
    }

    // 2. Cleaned up: gone from the graph, survivors still reachable.
    let removed = index.cleanup_tombstones(&ctx)?;
    assert_eq!(removed, deleted.len());
    for id in &deleted {
        assert!(index.links(*id).is_none());
    }
    let mut found = 0;
    for id in (0..500u64).filter(|id| id % 5 != 0).step_by(7) {
        let v = store.vector_for_id(&ctx, id)?;
        if index.search_by_vector(&ctx, &v, 1, None)?.ids == vec![id] {
            found += 1;
        }
    }
    assert!(found >= 52, "only {found} survivors found themselves");
    Ok(())
}

#[test]
fn test_object_removed_from_store_is_self_healed() -> Result<()> {
    let (index, store) = build(200, 8)?;
    let ctx = Context::background();

    // A bounded cache forces lookups through the store.
    index.update_user_config(&ctx, index.config().with_vector_cache_max_objects(50))?;
    let entrypoint = index.stats()?.entrypoint;
    let victims: Vec<u64> = (0..200).filter(|id| id % 10 == 3 && Some(*id) != entrypoint).collect();
    for id in &victims {
        store.remove(*id);
    }

    for id in 0..200u64 {
        if let Ok(v) = store.vector_for_id(&ctx, id) {
            let results = index.search_by_vector(&ctx, &v, 10, None)?;
            assert!(results.ids.iter().all(|r| !victims.contains(r)));
        }
    }
    let tombstoned = index.stats()?.tombstones;
    assert!(tombstoned > 0);
    assert_eq!(index.cleanup_tombstones(&ctx)?, tombstoned);
    Ok(())
}

#[test]
fn test_search_by_id_of_missing_node() -> Result<()> {
    let (index, _) = build(20, 4)?;
    let err = index
        .search_by_id(&Context::background(), 999, 3, None)
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}
