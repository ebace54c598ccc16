//! One session's isolated knowledge graph: entity maps, reverse indices,
//! adjacency, vector indexes and lifecycle metadata.
//!
//! Locking: every mutating operation serializes on `write_lock` and then
//! takes the write locks of the maps it touches, so multi-map updates are
//! all-or-nothing for readers. Readers take individual map read locks and
//! always receive owned copies.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock};

use rhizome_core::config::QuotaConfig;
use rhizome_core::model::{
    canonical_title, Community, Document, DocumentStatus, Entity, Relationship, SessionCounters,
    TextUnit,
};
use rhizome_core::protocol::{
    CommunitySpec, EntitySpec, LeidenOverrides, RelationshipSpec, TextUnitSpec,
};

use crate::error::StoreError;
use crate::graph::{pagerank, GraphEdge, GraphSnapshot};
use crate::ids::{IdGenerator, Kind};
use crate::index::{Metric, VectorIndex};
use crate::index::AdjacencyIndex;
use crate::leiden::{self, LeidenLevel, LeidenParams};

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SessionStore {
    id: String,
    dim: usize,
    created: Instant,
    created_at_ms: u64,
    /// Millis since `created`; updated on every successful lookup.
    last_access_ms: AtomicU64,
    ttl_ms: AtomicU64,
    idle_ttl_ms: AtomicU64,
    quotas: QuotaConfig,
    mem_bytes: AtomicU64,

    pub(crate) ids: IdGenerator,
    write_lock: Mutex<()>,

    pub(crate) docs: RwLock<HashMap<u64, Document>>,
    pub(crate) docs_by_ext: RwLock<HashMap<String, u64>>,
    pub(crate) textunits: RwLock<HashMap<u64, TextUnit>>,
    pub(crate) textunits_by_ext: RwLock<HashMap<String, u64>>,
    pub(crate) entities: RwLock<HashMap<u64, Entity>>,
    pub(crate) entities_by_ext: RwLock<HashMap<String, u64>>,
    pub(crate) entities_by_title: RwLock<HashMap<String, u64>>,
    pub(crate) rels: RwLock<HashMap<u64, Relationship>>,
    pub(crate) rels_by_ext: RwLock<HashMap<String, u64>>,
    pub(crate) adjacency: RwLock<AdjacencyIndex>,
    pub(crate) communities: RwLock<HashMap<u64, Community>>,
    pub(crate) communities_by_ext: RwLock<HashMap<String, u64>>,

    pub(crate) textunit_index: RwLock<VectorIndex>,
    pub(crate) entity_index: RwLock<VectorIndex>,
    pub(crate) community_index: RwLock<VectorIndex>,
}

// Rough per-record heap cost for the memory quota.
pub(crate) fn document_cost(doc: &Document) -> u64 {
    (64 + doc.external_id.len() + doc.filename.len()) as u64
}

pub(crate) fn textunit_cost(tu: &TextUnit) -> u64 {
    (96 + tu.external_id.len()
        + tu.content.len()
        + tu.embedding.len() * 4
        + tu.entity_ids.len() * 8) as u64
}

pub(crate) fn entity_cost(entity: &Entity) -> u64 {
    (96 + entity.external_id.len()
        + entity.title.len()
        + entity.canonical_title.len()
        + entity.entity_type.len()
        + entity.description.len()
        + entity.embedding.len() * 4
        + entity.textunit_ids.len() * 8) as u64
}

pub(crate) fn relationship_cost(rel: &Relationship) -> u64 {
    (96 + rel.external_id.len() + rel.rel_type.len() + rel.description.len()) as u64
}

pub(crate) fn community_cost(community: &Community) -> u64 {
    (96 + community.external_id.len()
        + community.title.len()
        + community.summary.len()
        + community.full_content.len()
        + community.embedding.len() * 4
        + (community.entity_ids.len() + community.relationship_ids.len()) * 8) as u64
}

fn page_items<T: Clone>(map: &HashMap<u64, T>, cursor: u64, limit: usize) -> (Vec<T>, u64) {
    let limit = limit.max(1);
    let mut ids: Vec<u64> = map.keys().copied().filter(|id| *id > cursor).collect();
    ids.sort_unstable();

    let has_more = ids.len() > limit;
    ids.truncate(limit);
    let items: Vec<T> = ids.iter().map(|id| map[id].clone()).collect();
    let next_cursor = if has_more { *ids.last().unwrap() } else { 0 };
    (items, next_cursor)
}

impl SessionStore {
    pub fn new(
        id: impl Into<String>,
        dim: usize,
        ttl_ms: u64,
        idle_ttl_ms: u64,
        quotas: QuotaConfig,
    ) -> Self {
        Self {
            id: id.into(),
            dim,
            created: Instant::now(),
            created_at_ms: now_epoch_ms(),
            last_access_ms: AtomicU64::new(0),
            ttl_ms: AtomicU64::new(ttl_ms),
            idle_ttl_ms: AtomicU64::new(idle_ttl_ms),
            quotas,
            mem_bytes: AtomicU64::new(0),
            ids: IdGenerator::new(),
            write_lock: Mutex::new(()),
            docs: RwLock::new(HashMap::new()),
            docs_by_ext: RwLock::new(HashMap::new()),
            textunits: RwLock::new(HashMap::new()),
            textunits_by_ext: RwLock::new(HashMap::new()),
            entities: RwLock::new(HashMap::new()),
            entities_by_ext: RwLock::new(HashMap::new()),
            entities_by_title: RwLock::new(HashMap::new()),
            rels: RwLock::new(HashMap::new()),
            rels_by_ext: RwLock::new(HashMap::new()),
            adjacency: RwLock::new(AdjacencyIndex::new()),
            communities: RwLock::new(HashMap::new()),
            communities_by_ext: RwLock::new(HashMap::new()),
            textunit_index: RwLock::new(VectorIndex::new(dim, Metric::Cosine)),
            entity_index: RwLock::new(VectorIndex::new(dim, Metric::Cosine)),
            community_index: RwLock::new(VectorIndex::new(dim, Metric::Cosine)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn touch(&self) {
        self.last_access_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> u64 {
        let age = self.created.elapsed().as_millis() as u64;
        age.saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms.load(Ordering::Relaxed)
    }

    pub fn idle_ttl_ms(&self) -> u64 {
        self.idle_ttl_ms.load(Ordering::Relaxed)
    }

    pub fn set_ttl(&self, ttl_ms: u64, idle_ttl_ms: u64) {
        self.ttl_ms.store(ttl_ms, Ordering::Relaxed);
        self.idle_ttl_ms.store(idle_ttl_ms, Ordering::Relaxed);
    }

    /// Zero ttl / idle-ttl disables that bound.
    pub fn is_expired(&self) -> bool {
        let age_ms = self.created.elapsed().as_millis() as u64;
        let ttl = self.ttl_ms.load(Ordering::Relaxed);
        if ttl > 0 && age_ms > ttl {
            return true;
        }
        let idle_ttl = self.idle_ttl_ms.load(Ordering::Relaxed);
        if idle_ttl > 0 && self.idle_ms() > idle_ttl {
            return true;
        }
        false
    }

    pub fn memory_bytes(&self) -> u64 {
        self.mem_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn mem_bytes_handle(&self) -> &AtomicU64 {
        &self.mem_bytes
    }

    // -- quota checks -------------------------------------------------------

    fn check_count_quota(
        &self,
        current: usize,
        quota: u64,
        dimension: &'static str,
    ) -> Result<(), StoreError> {
        if quota > 0 && current as u64 >= quota {
            return Err(StoreError::QuotaExceeded { dimension });
        }
        Ok(())
    }

    fn check_memory_quota(&self, additional: u64) -> Result<(), StoreError> {
        let quota = self.quotas.memory_bytes;
        if quota > 0 && self.mem_bytes.load(Ordering::Relaxed) + additional > quota {
            return Err(StoreError::QuotaExceeded {
                dimension: "memory_bytes",
            });
        }
        Ok(())
    }

    fn check_embedding_dim(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if !embedding.is_empty() && embedding.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                got: embedding.len(),
            });
        }
        Ok(())
    }

    // -- documents ----------------------------------------------------------

    pub async fn add_document(
        &self,
        external_id: String,
        filename: String,
    ) -> Result<Document, StoreError> {
        if external_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "document external_id must not be empty".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        if self.docs_by_ext.read().await.contains_key(&external_id) {
            return Err(StoreError::already_exists("document", external_id));
        }

        let doc = Document {
            id: self.ids.next(Kind::Document),
            external_id,
            filename,
            status: DocumentStatus::Uploaded,
            created_at_ms: now_epoch_ms(),
        };
        self.check_memory_quota(document_cost(&doc))?;

        self.docs_by_ext
            .write()
            .await
            .insert(doc.external_id.clone(), doc.id);
        self.mem_bytes
            .fetch_add(document_cost(&doc), Ordering::Relaxed);
        self.docs.write().await.insert(doc.id, doc.clone());
        Ok(doc)
    }

    pub async fn get_document(&self, id: u64) -> Result<Document, StoreError> {
        self.docs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("document", id))
    }

    pub async fn set_document_status(
        &self,
        id: u64,
        status: DocumentStatus,
    ) -> Result<Document, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("document", id))?;
        if !doc.status.can_transition(status) {
            return Err(StoreError::InvalidArgument(format!(
                "document status cannot go backwards: {:?} -> {:?}",
                doc.status, status
            )));
        }
        doc.status = status;
        Ok(doc.clone())
    }

    /// Deleting a document keeps its textunits (orphan-retain).
    pub async fn delete_document(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let doc = self
            .docs
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("document", id))?;
        self.docs_by_ext.write().await.remove(&doc.external_id);
        self.mem_bytes
            .fetch_sub(document_cost(&doc), Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_documents(&self, cursor: u64, limit: usize) -> (Vec<Document>, u64) {
        page_items(&*self.docs.read().await, cursor, limit)
    }

    // -- textunits ----------------------------------------------------------

    pub async fn add_textunit(&self, spec: TextUnitSpec) -> Result<TextUnit, StoreError> {
        if spec.external_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "textunit external_id must not be empty".into(),
            ));
        }
        self.check_embedding_dim(&spec.embedding)?;

        let _guard = self.write_lock.lock().await;

        self.check_count_quota(
            self.textunits.read().await.len(),
            self.quotas.textunits,
            "textunits",
        )?;
        if self
            .textunits_by_ext
            .read()
            .await
            .contains_key(&spec.external_id)
        {
            return Err(StoreError::already_exists("textunit", spec.external_id));
        }
        if !self.docs.read().await.contains_key(&spec.document_id) {
            return Err(StoreError::not_found("document", spec.document_id));
        }

        let tu = TextUnit {
            id: self.ids.next(Kind::TextUnit),
            external_id: spec.external_id,
            document_id: spec.document_id,
            content: spec.content,
            embedding: spec.embedding,
            token_count: spec.token_count,
            entity_ids: Vec::new(),
        };
        self.check_memory_quota(textunit_cost(&tu))?;

        self.textunits_by_ext
            .write()
            .await
            .insert(tu.external_id.clone(), tu.id);
        if !tu.embedding.is_empty() {
            self.textunit_index
                .write()
                .await
                .add(tu.id, tu.embedding.clone())?;
        }
        self.mem_bytes
            .fetch_add(textunit_cost(&tu), Ordering::Relaxed);
        self.textunits.write().await.insert(tu.id, tu.clone());
        Ok(tu)
    }

    pub async fn get_textunit(&self, id: u64) -> Result<TextUnit, StoreError> {
        self.textunits
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("textunit", id))
    }

    pub async fn textunits_by_ids(&self, ids: &[u64]) -> Vec<TextUnit> {
        let map = self.textunits.read().await;
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    pub async fn delete_textunit(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let tu = self
            .textunits
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("textunit", id))?;

        self.textunits_by_ext.write().await.remove(&tu.external_id);
        self.textunit_index.write().await.remove(id);

        // Drop the back-references from linked entities.
        let mut entities = self.entities.write().await;
        for entity_id in &tu.entity_ids {
            if let Some(entity) = entities.get_mut(entity_id) {
                entity.textunit_ids.retain(|t| *t != id);
            }
        }

        self.mem_bytes
            .fetch_sub(textunit_cost(&tu), Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_textunits(&self, cursor: u64, limit: usize) -> (Vec<TextUnit>, u64) {
        page_items(&*self.textunits.read().await, cursor, limit)
    }

    /// Idempotent cross-link between a textunit and an entity.
    pub async fn link_textunit_to_entity(
        &self,
        textunit_id: u64,
        entity_id: u64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut textunits = self.textunits.write().await;
        let mut entities = self.entities.write().await;

        let tu = textunits
            .get_mut(&textunit_id)
            .ok_or_else(|| StoreError::not_found("textunit", textunit_id))?;
        let entity = entities
            .get_mut(&entity_id)
            .ok_or_else(|| StoreError::not_found("entity", entity_id))?;

        if !tu.entity_ids.contains(&entity_id) {
            tu.entity_ids.push(entity_id);
        }
        if !entity.textunit_ids.contains(&textunit_id) {
            entity.textunit_ids.push(textunit_id);
        }
        Ok(())
    }

    // -- entities -----------------------------------------------------------

    pub async fn add_entity(&self, spec: EntitySpec) -> Result<Entity, StoreError> {
        if spec.external_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "entity external_id must not be empty".into(),
            ));
        }
        let canonical = canonical_title(&spec.title);
        if canonical.is_empty() {
            return Err(StoreError::InvalidArgument(
                "entity title must not be empty".into(),
            ));
        }
        self.check_embedding_dim(&spec.embedding)?;

        let _guard = self.write_lock.lock().await;

        self.check_count_quota(
            self.entities.read().await.len(),
            self.quotas.entities,
            "entities",
        )?;
        if self
            .entities_by_ext
            .read()
            .await
            .contains_key(&spec.external_id)
        {
            return Err(StoreError::already_exists("entity", spec.external_id));
        }
        if self.entities_by_title.read().await.contains_key(&canonical) {
            return Err(StoreError::already_exists("entity title", canonical));
        }

        let entity = Entity {
            id: self.ids.next(Kind::Entity),
            external_id: spec.external_id,
            title: spec.title,
            canonical_title: canonical,
            entity_type: spec.entity_type,
            description: spec.description,
            embedding: spec.embedding,
            textunit_ids: Vec::new(),
        };
        self.check_memory_quota(entity_cost(&entity))?;

        self.entities_by_ext
            .write()
            .await
            .insert(entity.external_id.clone(), entity.id);
        self.entities_by_title
            .write()
            .await
            .insert(entity.canonical_title.clone(), entity.id);
        if !entity.embedding.is_empty() {
            self.entity_index
                .write()
                .await
                .add(entity.id, entity.embedding.clone())?;
        }
        self.mem_bytes
            .fetch_add(entity_cost(&entity), Ordering::Relaxed);
        self.entities.write().await.insert(entity.id, entity.clone());
        Ok(entity)
    }

    pub async fn get_entity(&self, id: u64) -> Result<Entity, StoreError> {
        self.entities
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("entity", id))
    }

    pub async fn get_entity_by_external_id(&self, external_id: &str) -> Result<Entity, StoreError> {
        let id = self
            .entities_by_ext
            .read()
            .await
            .get(external_id)
            .copied()
            .ok_or_else(|| StoreError::KeyNotFound {
                kind: "entity",
                key: external_id.to_string(),
            })?;
        self.get_entity(id).await
    }

    pub async fn get_entity_by_title(&self, title: &str) -> Result<Entity, StoreError> {
        let canonical = canonical_title(title);
        let id = self
            .entities_by_title
            .read()
            .await
            .get(&canonical)
            .copied()
            .ok_or(StoreError::KeyNotFound {
                kind: "entity",
                key: canonical,
            })?;
        self.get_entity(id).await
    }

    pub async fn entities_by_ids(&self, ids: &[u64]) -> Vec<Entity> {
        let map = self.entities.read().await;
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    /// Title is immutable; only description and embedding change. The new
    /// embedding overwrites the indexed vector.
    pub async fn update_entity_description(
        &self,
        id: u64,
        description: String,
        embedding: Vec<f32>,
    ) -> Result<Entity, StoreError> {
        self.check_embedding_dim(&embedding)?;

        let _guard = self.write_lock.lock().await;

        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("entity", id))?;

        let old_cost = entity_cost(entity);
        entity.description = description;
        if !embedding.is_empty() {
            entity.embedding = embedding;
            self.entity_index
                .write()
                .await
                .add(id, entity.embedding.clone())?;
        }

        let new_cost = entity_cost(entity);
        if new_cost > old_cost {
            self.mem_bytes
                .fetch_add(new_cost - old_cost, Ordering::Relaxed);
        } else {
            self.mem_bytes
                .fetch_sub(old_cost - new_cost, Ordering::Relaxed);
        }
        Ok(entity.clone())
    }

    /// Removes the entity, its vector, its incident relationships and the
    /// back-references held by linked textunits.
    pub async fn delete_entity(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let entity = self
            .entities
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("entity", id))?;

        self.entities_by_ext
            .write()
            .await
            .remove(&entity.external_id);
        self.entities_by_title
            .write()
            .await
            .remove(&entity.canonical_title);
        self.entity_index.write().await.remove(id);

        let incident = self.adjacency.read().await.incident(id);
        if !incident.is_empty() {
            let mut rels = self.rels.write().await;
            let mut rels_by_ext = self.rels_by_ext.write().await;
            let mut adjacency = self.adjacency.write().await;
            for rel_id in incident {
                if let Some(rel) = rels.remove(&rel_id) {
                    if !rel.external_id.is_empty() {
                        rels_by_ext.remove(&rel.external_id);
                    }
                    adjacency.remove(rel.id, rel.source_id, rel.target_id);
                    self.mem_bytes
                        .fetch_sub(relationship_cost(&rel), Ordering::Relaxed);
                }
            }
        }

        let mut textunits = self.textunits.write().await;
        for tu_id in &entity.textunit_ids {
            if let Some(tu) = textunits.get_mut(tu_id) {
                tu.entity_ids.retain(|e| *e != id);
            }
        }

        self.mem_bytes
            .fetch_sub(entity_cost(&entity), Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_entities(&self, cursor: u64, limit: usize) -> (Vec<Entity>, u64) {
        page_items(&*self.entities.read().await, cursor, limit)
    }

    // -- relationships ------------------------------------------------------

    pub async fn add_relationship(
        &self,
        spec: RelationshipSpec,
    ) -> Result<Relationship, StoreError> {
        if spec.weight < 0.0 {
            return Err(StoreError::InvalidArgument(
                "relationship weight must be non-negative".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        self.check_count_quota(
            self.rels.read().await.len(),
            self.quotas.relationships,
            "relationships",
        )?;

        {
            let entities = self.entities.read().await;
            if !entities.contains_key(&spec.source_id) {
                return Err(StoreError::not_found("entity", spec.source_id));
            }
            if !entities.contains_key(&spec.target_id) {
                return Err(StoreError::not_found("entity", spec.target_id));
            }
        }
        if self
            .adjacency
            .read()
            .await
            .contains_pair(spec.source_id, spec.target_id)
        {
            return Err(StoreError::already_exists(
                "relationship pair",
                format!("({}, {})", spec.source_id, spec.target_id),
            ));
        }
        if !spec.external_id.is_empty()
            && self
                .rels_by_ext
                .read()
                .await
                .contains_key(&spec.external_id)
        {
            return Err(StoreError::already_exists("relationship", spec.external_id));
        }

        let rel = Relationship {
            id: self.ids.next(Kind::Relationship),
            external_id: spec.external_id,
            source_id: spec.source_id,
            target_id: spec.target_id,
            rel_type: spec.rel_type,
            description: spec.description,
            weight: spec.weight,
        };
        self.check_memory_quota(relationship_cost(&rel))?;

        if !rel.external_id.is_empty() {
            self.rels_by_ext
                .write()
                .await
                .insert(rel.external_id.clone(), rel.id);
        }
        self.adjacency
            .write()
            .await
            .insert(rel.id, rel.source_id, rel.target_id);
        self.mem_bytes
            .fetch_add(relationship_cost(&rel), Ordering::Relaxed);
        self.rels.write().await.insert(rel.id, rel.clone());
        Ok(rel)
    }

    pub async fn get_relationship(&self, id: u64) -> Result<Relationship, StoreError> {
        self.rels
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("relationship", id))
    }

    pub async fn relationships_by_ids(&self, ids: &[u64]) -> Vec<Relationship> {
        let map = self.rels.read().await;
        ids.iter().filter_map(|id| map.get(id).cloned()).collect()
    }

    pub async fn delete_relationship(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let rel = self
            .rels
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("relationship", id))?;
        if !rel.external_id.is_empty() {
            self.rels_by_ext.write().await.remove(&rel.external_id);
        }
        self.adjacency
            .write()
            .await
            .remove(rel.id, rel.source_id, rel.target_id);
        self.mem_bytes
            .fetch_sub(relationship_cost(&rel), Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_relationships(&self, cursor: u64, limit: usize) -> (Vec<Relationship>, u64) {
        page_items(&*self.rels.read().await, cursor, limit)
    }

    // -- bulk upserts -------------------------------------------------------
    //
    // Per-item upsert keyed by external_id: an item whose external_id is
    // already taken resolves to the existing id instead of failing, which is
    // what makes client retries of MSet* converge. Items apply one at a
    // time; a hard failure aborts the remainder.

    pub async fn mset_textunits(
        &self,
        items: Vec<TextUnitSpec>,
    ) -> Result<Vec<u64>, StoreError> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let existing = self
                .textunits_by_ext
                .read()
                .await
                .get(&item.external_id)
                .copied();
            match existing {
                Some(id) => ids.push(id),
                None => ids.push(self.add_textunit(item).await?.id),
            }
        }
        Ok(ids)
    }

    pub async fn mset_entities(&self, items: Vec<EntitySpec>) -> Result<Vec<u64>, StoreError> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let existing = self
                .entities_by_ext
                .read()
                .await
                .get(&item.external_id)
                .copied();
            match existing {
                Some(id) => ids.push(id),
                None => ids.push(self.add_entity(item).await?.id),
            }
        }
        Ok(ids)
    }

    /// Relationships dedupe by external_id when present, then by the
    /// `(source, target)` pair.
    pub async fn mset_relationships(
        &self,
        items: Vec<RelationshipSpec>,
    ) -> Result<Vec<u64>, StoreError> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            if !item.external_id.is_empty() {
                if let Some(id) = self.rels_by_ext.read().await.get(&item.external_id).copied()
                {
                    ids.push(id);
                    continue;
                }
            }
            if let Some(id) = self
                .adjacency
                .read()
                .await
                .pair(item.source_id, item.target_id)
            {
                ids.push(id);
                continue;
            }
            ids.push(self.add_relationship(item).await?.id);
        }
        Ok(ids)
    }

    // -- communities --------------------------------------------------------

    pub async fn add_community(&self, spec: CommunitySpec) -> Result<Community, StoreError> {
        self.check_embedding_dim(&spec.embedding)?;

        let _guard = self.write_lock.lock().await;

        if !spec.external_id.is_empty()
            && self
                .communities_by_ext
                .read()
                .await
                .contains_key(&spec.external_id)
        {
            return Err(StoreError::already_exists("community", spec.external_id));
        }

        let community = Community {
            id: self.ids.next(Kind::Community),
            external_id: spec.external_id,
            title: spec.title,
            summary: spec.summary,
            full_content: spec.full_content,
            level: spec.level,
            entity_ids: spec.entity_ids,
            relationship_ids: spec.relationship_ids,
            embedding: spec.embedding,
        };
        self.check_memory_quota(community_cost(&community))?;

        if !community.external_id.is_empty() {
            self.communities_by_ext
                .write()
                .await
                .insert(community.external_id.clone(), community.id);
        }
        if !community.embedding.is_empty() {
            self.community_index
                .write()
                .await
                .add(community.id, community.embedding.clone())?;
        }
        self.mem_bytes
            .fetch_add(community_cost(&community), Ordering::Relaxed);
        self.communities
            .write()
            .await
            .insert(community.id, community.clone());
        Ok(community)
    }

    pub async fn get_community(&self, id: u64) -> Result<Community, StoreError> {
        self.communities
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("community", id))
    }

    pub async fn delete_community(&self, id: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let community = self
            .communities
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("community", id))?;
        if !community.external_id.is_empty() {
            self.communities_by_ext
                .write()
                .await
                .remove(&community.external_id);
        }
        self.community_index.write().await.remove(id);
        self.mem_bytes
            .fetch_sub(community_cost(&community), Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_communities(&self, cursor: u64, limit: usize) -> (Vec<Community>, u64) {
        page_items(&*self.communities.read().await, cursor, limit)
    }

    // -- community detection ------------------------------------------------

    pub fn leiden_params(
        defaults: &rhizome_core::config::LeidenConfig,
        overrides: Option<&LeidenOverrides>,
    ) -> LeidenParams {
        let mut params = LeidenParams::from(defaults);
        if let Some(o) = overrides {
            if let Some(v) = o.resolution {
                params.resolution = v;
            }
            if let Some(v) = o.iterations {
                params.iterations = v;
            }
            if let Some(v) = o.min_delta {
                params.min_delta = v;
            }
            if let Some(v) = o.random_seed {
                params.random_seed = v;
            }
            if let Some(v) = o.max_levels {
                params.max_levels = v.clamp(1, 5);
            }
            if let Some(v) = o.min_community_size {
                params.min_community_size = v.max(2);
            }
            if let Some(v) = o.level_resolution {
                if v > 0.0 && v < 1.0 {
                    params.level_resolution = v;
                }
            }
        }
        params
    }

    /// Flat Leiden: recompute and atomically replace all communities.
    pub async fn compute_communities(&self, params: &LeidenParams) -> Result<u64, StoreError> {
        let graph = self.graph_snapshot().await;
        let levels = vec![LeidenLevel {
            level: 0,
            clusters: leiden::detect_communities(&graph, params),
        }];
        self.materialize_communities(&levels, &graph).await
    }

    /// Hierarchical Leiden: every produced level is materialized; the
    /// returned levels carry parent indices for the caller.
    pub async fn compute_hierarchy(
        &self,
        params: &LeidenParams,
    ) -> Result<(Vec<LeidenLevel>, u64), StoreError> {
        let graph = self.graph_snapshot().await;
        let levels = leiden::detect_hierarchy(&graph, params);
        let count = self.materialize_communities(&levels, &graph).await?;
        Ok((levels, count))
    }

    /// The heavy compute already happened against a private snapshot; this
    /// performs the clear-then-insert swap in one write-barrier critical
    /// section so readers only ever observe the old or the new generation.
    async fn materialize_communities(
        &self,
        levels: &[LeidenLevel],
        graph: &GraphSnapshot,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        // Community titles name the highest-ranked members.
        let rank = pagerank(graph, 0.85, 30);

        let mut fresh: Vec<Community> = Vec::new();
        {
            let entities = self.entities.read().await;
            let rels = self.rels.read().await;
            let adjacency = self.adjacency.read().await;

            for level in levels {
                for (ordinal, cluster) in level.clusters.iter().enumerate() {
                    let member_set: HashSet<u64> =
                        cluster.entity_ids.iter().copied().collect();

                    let mut ranked_members = cluster.entity_ids.clone();
                    ranked_members.sort_by(|a, b| {
                        let rank_a = rank.get(a).copied().unwrap_or(0.0);
                        let rank_b = rank.get(b).copied().unwrap_or(0.0);
                        rank_b
                            .partial_cmp(&rank_a)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(b))
                    });
                    let title = ranked_members
                        .iter()
                        .filter_map(|id| entities.get(id).map(|e| e.title.clone()))
                        .take(3)
                        .collect::<Vec<_>>()
                        .join(", ");

                    let mut relationship_ids = BTreeSet::new();
                    for member in &cluster.entity_ids {
                        for rel_id in adjacency.outgoing(*member) {
                            if let Some(rel) = rels.get(rel_id) {
                                if member_set.contains(&rel.target_id) {
                                    relationship_ids.insert(*rel_id);
                                }
                            }
                        }
                    }

                    fresh.push(Community {
                        id: self.ids.next(Kind::Community),
                        external_id: format!("community:{}:{}", level.level, ordinal),
                        title,
                        summary: String::new(),
                        full_content: String::new(),
                        level: level.level,
                        entity_ids: cluster.entity_ids.clone(),
                        relationship_ids: relationship_ids.into_iter().collect(),
                        embedding: Vec::new(),
                    });
                }
            }
        }

        let fresh_cost: u64 = fresh.iter().map(community_cost).sum();
        self.check_memory_quota(fresh_cost)?;
        tracing::debug!(
            session_id = %self.id,
            communities = fresh.len(),
            "replacing community generation"
        );

        let mut communities = self.communities.write().await;
        let mut by_ext = self.communities_by_ext.write().await;
        let mut index = self.community_index.write().await;

        let old_cost: u64 = communities.values().map(community_cost).sum();
        communities.clear();
        by_ext.clear();
        *index = VectorIndex::new(self.dim, Metric::Cosine);

        let count = fresh.len() as u64;
        for community in fresh {
            by_ext.insert(community.external_id.clone(), community.id);
            communities.insert(community.id, community);
        }

        self.mem_bytes.fetch_sub(old_cost, Ordering::Relaxed);
        self.mem_bytes.fetch_add(fresh_cost, Ordering::Relaxed);
        Ok(count)
    }

    // -- graph & search views ----------------------------------------------

    /// Private copy of the entity/relationship structure for graph
    /// algorithms; taken under short read locks.
    pub async fn graph_snapshot(&self) -> GraphSnapshot {
        let nodes: Vec<u64> = self.entities.read().await.keys().copied().collect();
        let edges: Vec<GraphEdge> = self
            .rels
            .read()
            .await
            .values()
            .map(|rel| GraphEdge {
                rel_id: rel.id,
                source: rel.source_id,
                target: rel.target_id,
                weight: rel.weight,
            })
            .collect();
        GraphSnapshot::from_parts(nodes, edges)
    }

    pub async fn search_textunits(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(u64, f32)>, StoreError> {
        self.textunit_index.read().await.search(query, k)
    }

    pub async fn search_entities(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(u64, f32)>, StoreError> {
        self.entity_index.read().await.search(query, k)
    }

    pub async fn search_communities(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(u64, f32)>, StoreError> {
        self.community_index.read().await.search(query, k)
    }

    pub async fn index_sizes(&self) -> (usize, usize, usize) {
        (
            self.textunit_index.read().await.count(),
            self.entity_index.read().await.count(),
            self.community_index.read().await.count(),
        )
    }

    pub async fn counters(&self) -> SessionCounters {
        SessionCounters {
            documents: self.docs.read().await.len() as u64,
            textunits: self.textunits.read().await.len() as u64,
            entities: self.entities.read().await.len() as u64,
            relationships: self.rels.read().await.len() as u64,
            communities: self.communities.read().await.len() as u64,
        }
    }

    pub fn quotas(&self) -> QuotaConfig {
        self.quotas
    }
}
