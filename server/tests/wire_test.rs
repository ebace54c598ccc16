//! End-to-end wire tests: a real listener, the pooled sdk client, literal
//! scenario data.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rhizome_core::auth::{hash_api_key, ApiKeyConfig, Permission};
use rhizome_core::config::AppConfig;
use rhizome_core::error::ErrorCode;
use rhizome_core::protocol::{EntitySpec, QuerySpec, RelationshipSpec, SearchKind};
use rhizome_sdk::{Client, ClientConfig, ClientError};
use server::{Engine, Server};
use tokio::net::TcpListener;

const DIM: usize = 4;

fn base_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.vector_dim = DIM;
    config.session.default_ttl_ms = 0;
    config.session.default_idle_ttl_ms = 0;
    config
}

async fn start_server(config: AppConfig) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(config).unwrap();
    let engine = server.engine();
    tokio::spawn(server.serve(listener));
    (addr, engine)
}

fn client_for(addr: SocketAddr) -> Client {
    Client::new(ClientConfig::with_address(addr.to_string()))
}

fn entity(external_id: &str, title: &str, entity_type: &str, embedding: Vec<f32>) -> EntitySpec {
    EntitySpec {
        external_id: external_id.to_string(),
        title: title.to_string(),
        entity_type: entity_type.to_string(),
        description: String::new(),
        embedding,
    }
}

fn entity_query(k_hops: u32) -> QuerySpec {
    QuerySpec {
        query_vector: vec![1.0, 0.0, 0.0, 0.0],
        search_types: vec![SearchKind::Entity],
        top_k: 2,
        k_hops,
        max_textunits: 10,
        max_entities: 10,
        max_communities: 5,
        deadline_ms: 0,
    }
}

fn server_code(err: ClientError) -> ErrorCode {
    match err {
        ClientError::Server { code, .. } => code,
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_info_and_health_work_without_a_session() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    client.ping().await.unwrap();

    let info = client.info("").await.unwrap();
    assert_eq!(info.vector_dim, DIM);
    assert_eq!(info.session_count, 0);

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert!(health.components.contains_key("sessions"));
}

#[tokio::test]
async fn vector_seeding_then_k_hop_expansion_over_the_wire() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    let e1 = client
        .add_entity("s1", entity("e1", "Bank Indonesia", "org", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    let e2 = client
        .add_entity("s1", entity("e2", "QRIS", "concept", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let pack = client.query("s1", entity_query(0)).await.unwrap();
    assert_eq!(pack.entities.len(), 2);
    assert_eq!(pack.entities[0].entity.id, e1.id);
    assert!((pack.entities[0].similarity - 1.0).abs() < 1e-5);
    assert_eq!(pack.entities[1].entity.id, e2.id);
    assert!(pack.entities[1].similarity.abs() < 1e-5);
    assert!(pack.relationships.is_empty());

    let rel = client
        .add_relationship(
            "s1",
            RelationshipSpec {
                external_id: String::new(),
                source_id: e1.id,
                target_id: e2.id,
                rel_type: "OPERATES".to_string(),
                description: String::new(),
                weight: 1.0,
            },
        )
        .await
        .unwrap();

    let pack = client.query("s1", entity_query(1)).await.unwrap();
    assert_eq!(pack.entities.len(), 2);
    assert!(pack.entities.iter().all(|scored| scored.hop == 0));
    assert_eq!(pack.relationships.len(), 1);
    assert_eq!(pack.relationships[0].relationship.id, rel.id);

    let explain = client.explain("s1", pack.query_id).await.unwrap();
    assert!(explain
        .traversal
        .iter()
        .any(|step| step.relationship_id == rel.id));
    assert_eq!(explain.seeds.len(), 2);
}

#[tokio::test]
async fn canonical_titles_are_unique_and_case_insensitive() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    let e1 = client
        .add_entity("s1", entity("e1", "Bank Indonesia", "org", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();

    let err = client
        .add_entity("s1", entity("e3", "bank indonesia", "org", vec![]))
        .await
        .unwrap_err();
    assert_eq!(server_code(err), ErrorCode::AlreadyExists);

    for lookup in ["Bank Indonesia", "BANK INDONESIA", "  bank   indonesia "] {
        let found = client.get_entity_by_title("s1", lookup).await.unwrap();
        assert_eq!(found.id, e1.id);
    }
}

#[tokio::test]
async fn snapshot_round_trip_preserves_observable_state() {
    let (addr, engine) = start_server(base_config()).await;
    let client = client_for(addr);

    let e1 = client
        .add_entity("s1", entity("e1", "Bank Indonesia", "org", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    let e2 = client
        .add_entity("s1", entity("e2", "QRIS", "concept", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();
    client
        .add_relationship(
            "s1",
            RelationshipSpec {
                external_id: String::new(),
                source_id: e1.id,
                target_id: e2.id,
                rel_type: "OPERATES".to_string(),
                description: String::new(),
                weight: 1.0,
            },
        )
        .await
        .unwrap();

    let info_before = client.info("").await.unwrap();
    let data = engine.snapshot_bytes().await.unwrap();

    let (addr2, engine2) = start_server(base_config()).await;
    engine2.restore_bytes(&data).await.unwrap();
    let client2 = client_for(addr2);

    let info_after = client2.info("").await.unwrap();
    assert_eq!(info_before.session_count, info_after.session_count);
    assert_eq!(info_before.counters, info_after.counters);

    let restored = client2.get_entity("s1", e1.id).await.unwrap();
    assert_eq!(restored.external_id, "e1");
    assert_eq!(restored.title, "Bank Indonesia");

    let pack = client2.query("s1", entity_query(1)).await.unwrap();
    assert_eq!(pack.entities.len(), 2);
    assert_eq!(pack.entities[0].entity.id, e1.id);
    assert_eq!(pack.relationships.len(), 1);
}

#[tokio::test]
async fn idle_sessions_expire_and_reads_report_it() {
    let mut config = base_config();
    config.session.default_idle_ttl_ms = 80;
    // Keep the background loop out of the way so the lazy-reap path answers.
    config.session.cleanup_interval_ms = 60_000;
    let (addr, engine) = start_server(config).await;
    let client = client_for(addr);

    let e1 = client
        .add_entity("s1", entity("e1", "A", "org", vec![]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let err = client.get_entity("s1", e1.id).await.unwrap_err();
    assert_eq!(server_code(err), ErrorCode::SessionExpired);

    // The failed read reaped it; nothing is left for the sweeper.
    assert_eq!(engine.info().await.session_count, 0);
    assert_eq!(engine.cleanup_expired().await, 0);
}

#[tokio::test]
async fn auth_gates_connections_and_permissions() {
    let mut config = base_config();
    config.auth.keys = vec![
        ApiKeyConfig {
            id: "writer".to_string(),
            key_hash: hash_api_key("writer-key"),
            permissions: vec![Permission::Read, Permission::Write],
        },
        ApiKeyConfig {
            id: "reader".to_string(),
            key_hash: hash_api_key("reader-key"),
            permissions: vec![Permission::Read],
        },
    ];
    let (addr, _) = start_server(config).await;

    // No key: the first command is rejected and the connection closed.
    let anonymous = client_for(addr);
    let err = anonymous.ping().await.unwrap_err();
    assert_eq!(server_code(err), ErrorCode::Unauthorized);

    let writer = Client::new(ClientConfig {
        api_key: Some("writer-key".to_string()),
        ..ClientConfig::with_address(addr.to_string())
    });
    writer
        .add_entity("s1", entity("e1", "A", "org", vec![]))
        .await
        .unwrap();

    let reader = Client::new(ClientConfig {
        api_key: Some("reader-key".to_string()),
        ..ClientConfig::with_address(addr.to_string())
    });
    let found = reader.get_entity_by_title("s1", "A").await.unwrap();
    assert_eq!(found.external_id, "e1");

    let err = reader
        .add_entity("s1", entity("e2", "B", "org", vec![]))
        .await
        .unwrap_err();
    assert_eq!(server_code(err), ErrorCode::Forbidden);

    let wrong = Client::new(ClientConfig {
        api_key: Some("nope".to_string()),
        ..ClientConfig::with_address(addr.to_string())
    });
    assert!(matches!(
        wrong.ping().await.unwrap_err(),
        ClientError::AuthFailed(_)
    ));
}

#[tokio::test]
async fn session_scoped_commands_require_a_session_id() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    let err = client.get_entity("", 1).await.unwrap_err();
    assert_eq!(server_code(err), ErrorCode::SessionRequired);
}

#[tokio::test]
async fn mset_is_idempotent_by_external_id() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    let items = vec![
        entity("e1", "A", "org", vec![]),
        entity("e2", "B", "org", vec![]),
    ];
    let first = client.mset_entities("s1", items.clone()).await.unwrap();
    let second = client.mset_entities("s1", items).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.info("s1").await.unwrap().counters.entities, 2);
}

#[tokio::test]
async fn pagination_over_the_wire_visits_each_entity_once() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    for i in 0..5 {
        client
            .add_entity("s1", entity(&format!("e{i}"), &format!("T{i}"), "org", vec![]))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let (items, next) = client.list_entities("s1", cursor, 2).await.unwrap();
        seen.extend(items.iter().map(|e| e.id));
        if next == 0 {
            break;
        }
        cursor = next;
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn leiden_over_the_wire_splits_cliques_and_builds_hierarchy() {
    let (addr, _) = start_server(base_config()).await;
    let client = client_for(addr);

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            client
                .add_entity("s1", entity(&format!("e{i}"), &format!("T{i}"), "org", vec![]))
                .await
                .unwrap()
                .id,
        );
    }
    for (s, t, w) in [
        (0, 1, 1.0),
        (1, 2, 1.0),
        (0, 2, 1.0),
        (3, 4, 1.0),
        (4, 5, 1.0),
        (3, 5, 1.0),
        (2, 3, 0.1),
    ] {
        client
            .add_relationship(
                "s1",
                RelationshipSpec {
                    external_id: String::new(),
                    source_id: ids[s],
                    target_id: ids[t],
                    rel_type: "LINKS".to_string(),
                    description: String::new(),
                    weight: w,
                },
            )
            .await
            .unwrap();
    }

    let count = client.compute_communities("s1", None).await.unwrap();
    assert_eq!(count, 2);

    let (communities, _) = client.list_communities("s1", 0, 10).await.unwrap();
    assert_eq!(communities.len(), 2);
    for community in &communities {
        assert_eq!(community.entity_ids.len(), 3);
        assert_eq!(community.level, 0);
        assert!(community.summary.is_empty());
    }

    let levels = client.hierarchical_leiden("s1", None).await.unwrap();
    assert_eq!(levels[0].level, 0);
    assert!(!levels[0].clusters.is_empty());
}

#[tokio::test]
async fn save_and_background_status_report_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.storage.data_dir = dir.path().display().to_string();
    let (addr, _) = start_server(config).await;
    let client = client_for(addr);

    client
        .add_entity("s1", entity("e1", "A", "org", vec![]))
        .await
        .unwrap();

    let path = client.save("s1").await.unwrap().expect("save returns a path");
    assert!(path.contains("snapshot_"));
    assert!(client.last_save("s1").await.unwrap().is_some());

    let (in_progress, last_save, last_error) = client.backup_status("s1").await.unwrap();
    assert!(!in_progress);
    assert!(last_save.is_some());
    assert!(last_error.is_none());
}
