//! Cross-module store behavior: index consistency under mixed mutations,
//! hierarchical community materialization, record round-trips.

use rhizome_core::config::QuotaConfig;
use rhizome_core::protocol::{EntitySpec, RelationshipSpec, TextUnitSpec};
use storage::error::StoreError;
use storage::session::SessionStore;
use storage::snapshot::{decode_snapshot, encode_snapshot, EngineSnapshotRecord, SNAPSHOT_FORMAT_VERSION};

const DIM: usize = 4;

fn store() -> SessionStore {
    SessionStore::new("s1", DIM, 0, 0, QuotaConfig::default())
}

fn entity(external_id: &str, title: &str, embedding: Vec<f32>) -> EntitySpec {
    EntitySpec {
        external_id: external_id.to_string(),
        title: title.to_string(),
        entity_type: "org".to_string(),
        description: String::new(),
        embedding,
    }
}

fn relationship(source_id: u64, target_id: u64, weight: f64) -> RelationshipSpec {
    RelationshipSpec {
        external_id: String::new(),
        source_id,
        target_id,
        rel_type: "LINKS".to_string(),
        description: String::new(),
        weight,
    }
}

/// Six entities in two triangles with a weak bridge.
async fn clique_store() -> (SessionStore, Vec<u64>) {
    let store = store();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            store
                .add_entity(entity(&format!("e{i}"), &format!("T{i}"), vec![]))
                .await
                .unwrap()
                .id,
        );
    }
    for (s, t) in [(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5)] {
        store
            .add_relationship(relationship(ids[s], ids[t], 1.0))
            .await
            .unwrap();
    }
    store
        .add_relationship(relationship(ids[2], ids[3], 0.1))
        .await
        .unwrap();
    (store, ids)
}

#[tokio::test]
async fn vector_index_tracks_live_embedding_bearing_entities() {
    let store = store();
    let with_vec = store
        .add_entity(entity("e1", "A", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    store.add_entity(entity("e2", "B", vec![])).await.unwrap();

    let (_, entity_index, _) = store.index_sizes().await;
    assert_eq!(entity_index, 1, "only embedding-bearing entities are indexed");

    store.delete_entity(with_vec.id).await.unwrap();
    let (_, entity_index, _) = store.index_sizes().await;
    assert_eq!(entity_index, 0);

    let hits = store.search_entities(&[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn external_ids_stay_aligned_with_live_records() {
    let store = store();
    let a = store.add_entity(entity("e1", "A", vec![])).await.unwrap();
    store.delete_entity(a.id).await.unwrap();

    // The external id is released with the record.
    assert!(matches!(
        store.get_entity_by_external_id("e1").await,
        Err(StoreError::KeyNotFound { .. })
    ));
    let again = store.add_entity(entity("e1", "A", vec![])).await.unwrap();
    assert!(again.id > a.id, "ids are never reused");
}

#[tokio::test]
async fn hierarchical_leiden_materializes_nested_levels() {
    let (store, ids) = clique_store().await;
    let params = storage::leiden::LeidenParams {
        max_levels: 3,
        ..Default::default()
    };

    let (levels, count) = store.compute_hierarchy(&params).await.unwrap();
    assert_eq!(levels[0].level, 0);
    assert_eq!(count as usize, levels.iter().map(|l| l.clusters.len()).sum::<usize>());

    // Level 0 covers every entity exactly once.
    let mut level0: Vec<u64> = levels[0]
        .clusters
        .iter()
        .flat_map(|c| c.entity_ids.iter().copied())
        .collect();
    level0.sort_unstable();
    let mut expected = ids.clone();
    expected.sort_unstable();
    assert_eq!(level0, expected);

    // Materialized communities carry their level and parentage is nested.
    let (communities, _) = store.list_communities(0, 100).await;
    assert_eq!(communities.len(), count as usize);
    for window in levels.windows(2) {
        for cluster in &window[1].clusters {
            let parent = &window[0].clusters[cluster.parent.unwrap()];
            assert!(cluster
                .entity_ids
                .iter()
                .all(|id| parent.entity_ids.contains(id)));
        }
    }
}

#[tokio::test]
async fn empty_graph_hierarchy_is_a_single_empty_level() {
    let store = store();
    let (levels, count) = store
        .compute_hierarchy(&storage::leiden::LeidenParams::default())
        .await
        .unwrap();
    assert_eq!(levels.len(), 1);
    assert_eq!(count, 0);
}

#[tokio::test]
async fn memory_quota_rejects_before_mutating() {
    let quotas = QuotaConfig {
        memory_bytes: 300,
        ..QuotaConfig::default()
    };
    let store = SessionStore::new("s1", DIM, 0, 0, quotas);
    store.add_entity(entity("e1", "A", vec![])).await.unwrap();

    let doc = store.add_document("d1".into(), "f".into()).await.unwrap();
    let err = store
        .add_textunit(TextUnitSpec {
            external_id: "t1".into(),
            document_id: doc.id,
            content: "x".repeat(10_000),
            embedding: vec![],
            token_count: 1,
        })
        .await;
    assert!(matches!(
        err,
        Err(StoreError::QuotaExceeded {
            dimension: "memory_bytes"
        })
    ));
    assert_eq!(store.counters().await.textunits, 0);
}

#[tokio::test]
async fn snapshot_restore_rejects_foreign_format_versions() {
    let store = store();
    let record = store.export_record().await;
    let snapshot = EngineSnapshotRecord {
        format_version: SNAPSHOT_FORMAT_VERSION + 1,
        vector_dim: DIM as u32,
        sessions: vec![record],
    };
    let encoded = encode_snapshot(&snapshot).unwrap();
    assert!(matches!(
        decode_snapshot(&encoded),
        Err(StoreError::Codec(_))
    ));
}

#[tokio::test]
async fn relationship_listing_is_cursor_stable() {
    let (store, _) = clique_store().await;

    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let (items, next) = store.list_relationships(cursor, 3).await;
        seen.extend(items.iter().map(|r| r.id));
        if next == 0 {
            break;
        }
        cursor = next;
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
}
