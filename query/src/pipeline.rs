//! Hybrid query pipeline: vector seeding, k-hop graph expansion, induced
//! relationship collection, then rank-and-cap into a context pack.
//!
//! Every record placed in the pack is an owned copy; later mutations of the
//! session cannot reach an in-flight response.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use rhizome_core::model::{Community, Entity, TextUnit};
use rhizome_core::protocol::{
    ContextPack, QueryLogEntry, QuerySpec, QueryStats, RelationshipOut, ScoredCommunity,
    ScoredEntity, ScoredTextUnit, SearchKind, SeedInfo, TraversalStep,
};
use storage::error::StoreError;
use storage::graph::{bfs_expand, GraphAccess};
use storage::session::SessionStore;

pub struct QueryOutcome {
    pub pack: ContextPack,
    pub log: QueryLogEntry,
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    similarity: f32,
    score: f32,
    hop: u32,
}

fn expansion_score(hop: u32) -> f32 {
    1.0 / (1.0 + hop as f32)
}

/// Run one query against a session. The caller supplies the engine-issued
/// `query_id`; the returned log entry is what the explain surface records.
pub async fn run_query(
    store: &SessionStore,
    spec: &QuerySpec,
    query_id: u64,
) -> Result<QueryOutcome, StoreError> {
    let started = Instant::now();
    let deadline = (spec.deadline_ms > 0).then(|| Duration::from_millis(spec.deadline_ms));
    let over_deadline = |stats: &mut QueryStats| -> bool {
        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                stats.truncated = true;
                return true;
            }
        }
        false
    };

    let mut stats = QueryStats::default();
    let mut seeds: Vec<SeedInfo> = Vec::new();
    let mut traversal: Vec<TraversalStep> = Vec::new();

    let mut tu_hits: HashMap<u64, Hit> = HashMap::new();
    let mut entity_hits: HashMap<u64, Hit> = HashMap::new();
    let mut community_hits: HashMap<u64, Hit> = HashMap::new();

    // Record caches keep the deep copies we hand out.
    let mut tu_records: HashMap<u64, TextUnit> = HashMap::new();
    let mut entity_records: HashMap<u64, Entity> = HashMap::new();
    let mut community_records: HashMap<u64, Community> = HashMap::new();

    // Seed-entity set for the expansion phase, in discovery order.
    let mut seed_entities: Vec<u64> = Vec::new();
    let push_seed_entity = |list: &mut Vec<u64>, id: u64| {
        if !list.contains(&id) {
            list.push(id);
        }
    };

    // Phase 1: vector seeding per selected kind. An empty index simply
    // produces no seeds.
    let (tu_total, entity_total, community_total) = store.index_sizes().await;
    for kind in spec.effective_search_types() {
        match kind {
            SearchKind::TextUnit => {
                stats.textunits_searched = tu_total as u64;
                for (id, similarity) in
                    store.search_textunits(&spec.query_vector, spec.top_k).await?
                {
                    let record = match store.get_textunit(id).await {
                        Ok(record) => record,
                        Err(_) => continue,
                    };
                    tu_hits.insert(
                        id,
                        Hit {
                            similarity,
                            score: similarity,
                            hop: 0,
                        },
                    );
                    seeds.push(SeedInfo {
                        kind,
                        id,
                        external_id: record.external_id.clone(),
                        similarity,
                        linked_ids: record.entity_ids.clone(),
                    });
                    for entity_id in &record.entity_ids {
                        push_seed_entity(&mut seed_entities, *entity_id);
                    }
                    tu_records.insert(id, record);
                }
            }
            SearchKind::Entity => {
                stats.entities_searched = entity_total as u64;
                for (id, similarity) in
                    store.search_entities(&spec.query_vector, spec.top_k).await?
                {
                    let record = match store.get_entity(id).await {
                        Ok(record) => record,
                        Err(_) => continue,
                    };
                    entity_hits.insert(
                        id,
                        Hit {
                            similarity,
                            score: similarity,
                            hop: 0,
                        },
                    );
                    seeds.push(SeedInfo {
                        kind,
                        id,
                        external_id: record.external_id.clone(),
                        similarity,
                        linked_ids: record.textunit_ids.clone(),
                    });
                    push_seed_entity(&mut seed_entities, id);
                    entity_records.insert(id, record);
                }
            }
            SearchKind::Community => {
                stats.communities_searched = community_total as u64;
                for (id, similarity) in
                    store.search_communities(&spec.query_vector, spec.top_k).await?
                {
                    let record = match store.get_community(id).await {
                        Ok(record) => record,
                        Err(_) => continue,
                    };
                    community_hits.insert(
                        id,
                        Hit {
                            similarity,
                            score: similarity,
                            hop: 0,
                        },
                    );
                    seeds.push(SeedInfo {
                        kind,
                        id,
                        external_id: record.external_id.clone(),
                        similarity,
                        linked_ids: record.entity_ids.clone(),
                    });
                    for entity_id in &record.entity_ids {
                        push_seed_entity(&mut seed_entities, *entity_id);
                    }
                    community_records.insert(id, record);
                }
            }
        }
    }

    // Phase 2: k-hop expansion from the seed-entity set.
    let graph = store.graph_snapshot().await;
    if spec.k_hops > 0 && !seed_entities.is_empty() && !over_deadline(&mut stats) {
        let bfs = bfs_expand(&graph, &seed_entities, spec.k_hops, spec.max_entities);
        stats.edges_scanned += bfs.steps.len() as u64;
        traversal = bfs.steps;

        let discovered: Vec<u64> = bfs
            .visited
            .iter()
            .copied()
            .filter(|id| bfs.hops[id] > 0 && !entity_hits.contains_key(id))
            .collect();
        for entity in store.entities_by_ids(&discovered).await {
            let hop = bfs.hops[&entity.id];
            entity_hits.insert(
                entity.id,
                Hit {
                    similarity: 0.0,
                    score: expansion_score(hop),
                    hop,
                },
            );

            // Linked textunits ride along one hop further out.
            let tu_hop = hop + 1;
            let missing: Vec<u64> = entity
                .textunit_ids
                .iter()
                .copied()
                .filter(|id| !tu_hits.contains_key(id))
                .collect();
            for tu in store.textunits_by_ids(&missing).await {
                tu_hits.insert(
                    tu.id,
                    Hit {
                        similarity: 0.0,
                        score: expansion_score(tu_hop),
                        hop: tu_hop,
                    },
                );
                tu_records.insert(tu.id, tu);
            }

            entity_records.insert(entity.id, entity);
        }
    }

    // Phase 3: relationships induced by the final entity set.
    let mut relationships: Vec<RelationshipOut> = Vec::new();
    if !over_deadline(&mut stats) {
        let entity_set: HashSet<u64> = entity_hits.keys().copied().collect();
        let mut induced: BTreeSet<u64> = BTreeSet::new();
        for id in &entity_set {
            for edge in graph.outgoing(*id) {
                stats.edges_scanned += 1;
                if entity_set.contains(&edge.target) {
                    induced.insert(edge.rel_id);
                }
            }
        }

        let rel_ids: Vec<u64> = induced.into_iter().collect();
        for rel in store.relationships_by_ids(&rel_ids).await {
            let source_title = entity_records
                .get(&rel.source_id)
                .map(|e| e.title.clone());
            let target_title = entity_records
                .get(&rel.target_id)
                .map(|e| e.title.clone());
            relationships.push(RelationshipOut {
                relationship: rel,
                source_title,
                target_title,
            });
        }
    }

    // Phase 4: rank by score (ties: ascending id) and apply the caps.
    let missing_entities: Vec<u64> = entity_hits
        .keys()
        .copied()
        .filter(|id| !entity_records.contains_key(id))
        .collect();
    for entity in store.entities_by_ids(&missing_entities).await {
        entity_records.insert(entity.id, entity);
    }

    let mut textunits: Vec<ScoredTextUnit> = tu_hits
        .iter()
        .filter_map(|(id, hit)| {
            tu_records.get(id).map(|record| ScoredTextUnit {
                textunit: record.clone(),
                similarity: hit.similarity,
                score: hit.score,
                hop: hit.hop,
            })
        })
        .collect();
    let mut entities: Vec<ScoredEntity> = entity_hits
        .iter()
        .filter_map(|(id, hit)| {
            entity_records.get(id).map(|record| ScoredEntity {
                entity: record.clone(),
                similarity: hit.similarity,
                score: hit.score,
                hop: hit.hop,
            })
        })
        .collect();
    let mut communities: Vec<ScoredCommunity> = community_hits
        .iter()
        .filter_map(|(id, hit)| {
            community_records.get(id).map(|record| ScoredCommunity {
                community: record.clone(),
                similarity: hit.similarity,
                score: hit.score,
                hop: hit.hop,
            })
        })
        .collect();

    textunits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.textunit.id.cmp(&b.textunit.id))
    });
    entities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.entity.id.cmp(&b.entity.id))
    });
    communities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.community.id.cmp(&b.community.id))
    });

    textunits.truncate(spec.max_textunits);
    entities.truncate(spec.max_entities);
    communities.truncate(spec.max_communities);

    // Phase 5: stats; the caller stores the log entry under the query id.
    stats.duration_micros = started.elapsed().as_micros() as u64;
    tracing::debug!(
        query_id,
        seeds = seeds.len(),
        entities = entities.len(),
        textunits = textunits.len(),
        duration_us = stats.duration_micros,
        "query pipeline finished"
    );

    let pack = ContextPack {
        query_id,
        textunits,
        entities,
        communities,
        relationships,
        stats,
    };
    let log = QueryLogEntry {
        query_id,
        seeds,
        traversal,
        stats,
    };

    Ok(QueryOutcome { pack, log })
}
