use query::run_query;
use rhizome_core::config::QuotaConfig;
use rhizome_core::protocol::{
    EntitySpec, QuerySpec, RelationshipSpec, SearchKind, TextUnitSpec,
};
use storage::error::StoreError;
use storage::session::SessionStore;

const DIM: usize = 4;

fn store() -> SessionStore {
    SessionStore::new("s1", DIM, 0, 0, QuotaConfig::default())
}

fn entity_spec(external_id: &str, title: &str, embedding: Vec<f32>) -> EntitySpec {
    EntitySpec {
        external_id: external_id.to_string(),
        title: title.to_string(),
        entity_type: "org".to_string(),
        description: String::new(),
        embedding,
    }
}

fn entity_query(top_k: usize, k_hops: u32) -> QuerySpec {
    QuerySpec {
        query_vector: vec![1.0, 0.0, 0.0, 0.0],
        search_types: vec![SearchKind::Entity],
        top_k,
        k_hops,
        max_textunits: 20,
        max_entities: 10,
        max_communities: 5,
        deadline_ms: 0,
    }
}

/// Two entities, orthogonal vectors, vector-only query.
async fn scenario_store() -> (SessionStore, u64, u64) {
    let store = store();
    let e1 = store
        .add_entity(entity_spec("e1", "Bank Indonesia", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap()
        .id;
    let e2 = store
        .add_entity(entity_spec("e2", "QRIS", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap()
        .id;
    (store, e1, e2)
}

#[tokio::test]
async fn vector_seeding_ranks_by_similarity() {
    let (store, e1, e2) = scenario_store().await;

    let outcome = run_query(&store, &entity_query(2, 0), 1).await.unwrap();
    let pack = outcome.pack;

    assert_eq!(pack.query_id, 1);
    assert_eq!(pack.entities.len(), 2);
    assert_eq!(pack.entities[0].entity.id, e1);
    assert!((pack.entities[0].similarity - 1.0).abs() < 1e-5);
    assert_eq!(pack.entities[0].hop, 0);
    assert_eq!(pack.entities[1].entity.id, e2);
    assert!(pack.entities[1].similarity.abs() < 1e-5);
    assert!(pack.relationships.is_empty());
    assert!(pack.textunits.is_empty());
    assert_eq!(pack.stats.entities_searched, 2);

    let seed_ids: Vec<u64> = outcome.log.seeds.iter().map(|s| s.id).collect();
    assert_eq!(seed_ids, vec![e1, e2]);
    assert_eq!(outcome.log.seeds[0].external_id, "e1");
}

#[tokio::test]
async fn k_hop_query_collects_induced_relationships_and_traversal() {
    let (store, e1, e2) = scenario_store().await;
    let rel = store
        .add_relationship(RelationshipSpec {
            external_id: String::new(),
            source_id: e1,
            target_id: e2,
            rel_type: "OPERATES".to_string(),
            description: String::new(),
            weight: 1.0,
        })
        .await
        .unwrap();

    let outcome = run_query(&store, &entity_query(2, 1), 2).await.unwrap();
    let pack = outcome.pack;

    assert_eq!(pack.entities.len(), 2);
    for scored in &pack.entities {
        assert_eq!(scored.hop, 0, "both entities were seeded");
    }

    assert_eq!(pack.relationships.len(), 1);
    let out = &pack.relationships[0];
    assert_eq!(out.relationship.id, rel.id);
    assert_eq!(out.source_title.as_deref(), Some("Bank Indonesia"));
    assert_eq!(out.target_title.as_deref(), Some("QRIS"));

    assert!(outcome
        .log
        .traversal
        .iter()
        .any(|step| step.relationship_id == rel.id));
}

#[tokio::test]
async fn expansion_scores_decay_with_hop_distance() {
    let store = store();
    let doc = store.add_document("d1".into(), "f".into()).await.unwrap();

    let seed = store
        .add_entity(entity_spec("seed", "Seed", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap()
        .id;
    // No embedding: reachable only through the graph.
    let hidden = store
        .add_entity(entity_spec("hidden", "Hidden", vec![]))
        .await
        .unwrap()
        .id;
    store
        .add_relationship(RelationshipSpec {
            external_id: String::new(),
            source_id: seed,
            target_id: hidden,
            rel_type: "LINKS".to_string(),
            description: String::new(),
            weight: 1.0,
        })
        .await
        .unwrap();

    let tu = store
        .add_textunit(TextUnitSpec {
            external_id: "t1".into(),
            document_id: doc.id,
            content: "chunk".into(),
            embedding: vec![],
            token_count: 1,
        })
        .await
        .unwrap()
        .id;
    store.link_textunit_to_entity(tu, hidden).await.unwrap();

    let outcome = run_query(&store, &entity_query(1, 2), 3).await.unwrap();
    let pack = outcome.pack;

    let expanded = pack
        .entities
        .iter()
        .find(|s| s.entity.id == hidden)
        .expect("hidden entity discovered by expansion");
    assert_eq!(expanded.hop, 1);
    assert_eq!(expanded.similarity, 0.0);
    assert!((expanded.score - 0.5).abs() < 1e-6);

    let attached = pack
        .textunits
        .iter()
        .find(|s| s.textunit.id == tu)
        .expect("linked textunit attached");
    assert_eq!(attached.hop, 2);
    assert!((attached.score - (1.0 / 3.0)).abs() < 1e-6);
}

#[tokio::test]
async fn caps_truncate_after_ranking() {
    let store = store();
    for i in 0..5 {
        let mut v = vec![0.0; DIM];
        v[i % DIM] = 1.0;
        store
            .add_entity(entity_spec(&format!("e{i}"), &format!("T{i}"), v))
            .await
            .unwrap();
    }

    let spec = QuerySpec {
        max_entities: 2,
        ..entity_query(5, 0)
    };
    let pack = run_query(&store, &spec, 4).await.unwrap().pack;

    assert_eq!(pack.entities.len(), 2);
    // Top hit is the exact-match direction; runner-up ordering falls back to
    // ascending id among equal scores.
    assert!(pack.entities[0].score >= pack.entities[1].score);
}

#[tokio::test]
async fn empty_indexes_produce_an_empty_pack_not_an_error() {
    let store = store();
    let spec = QuerySpec {
        search_types: vec![],
        ..entity_query(3, 1)
    };
    let pack = run_query(&store, &spec, 5).await.unwrap().pack;

    assert!(pack.entities.is_empty());
    assert!(pack.textunits.is_empty());
    assert!(pack.communities.is_empty());
    assert!(pack.relationships.is_empty());
}

#[tokio::test]
async fn wrong_query_dimension_is_a_typed_error() {
    let (store, _, _) = scenario_store().await;
    let spec = QuerySpec {
        query_vector: vec![1.0, 0.0],
        ..entity_query(2, 0)
    };
    assert!(matches!(
        run_query(&store, &spec, 6).await,
        Err(StoreError::DimensionMismatch { expected: 4, got: 2 })
    ));
}

#[tokio::test]
async fn communities_are_seeded_from_their_own_index() {
    let (store, e1, e2) = scenario_store().await;
    store
        .add_community(rhizome_core::protocol::CommunitySpec {
            external_id: "c1".into(),
            title: "Payments".into(),
            summary: String::new(),
            full_content: String::new(),
            level: 0,
            entity_ids: vec![e1, e2],
            relationship_ids: vec![],
            embedding: vec![1.0, 0.0, 0.0, 0.0],
        })
        .await
        .unwrap();

    let spec = QuerySpec {
        search_types: vec![SearchKind::Community],
        ..entity_query(1, 0)
    };
    let pack = run_query(&store, &spec, 7).await.unwrap().pack;

    assert_eq!(pack.communities.len(), 1);
    assert!((pack.communities[0].similarity - 1.0).abs() < 1e-5);
    assert!(pack.entities.is_empty());
}
