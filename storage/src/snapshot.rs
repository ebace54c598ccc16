//! Engine snapshot encoding and the snapshot file manager.
//!
//! The wire model stays serde/JSON; snapshots use dedicated rkyv records so
//! the persisted layout is decoupled from the live structs. The encoded
//! payload is prefixed with a crc32 so a truncated or corrupted file fails
//! loudly instead of restoring garbage.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use crc32fast::Hasher;
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use tokio::fs;

use rhizome_core::config::QuotaConfig;
use rhizome_core::model::{
    canonical_title, Community, Document, DocumentStatus, Entity, Relationship, TextUnit,
};

use crate::error::StoreError;
use crate::ids::Kind;
use crate::session::SessionStore;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct DocumentRecord {
    pub id: u64,
    pub external_id: String,
    pub filename: String,
    pub status: u8,
    pub created_at_ms: u64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct TextUnitRecord {
    pub id: u64,
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: u32,
    pub entity_ids: Vec<u64>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct EntityRecord {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub entity_type: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub textunit_ids: Vec<u64>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct RelationshipRecord {
    pub id: u64,
    pub external_id: String,
    pub source_id: u64,
    pub target_id: u64,
    pub rel_type: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct CommunityRecord {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub summary: String,
    pub full_content: String,
    pub level: u32,
    pub entity_ids: Vec<u64>,
    pub relationship_ids: Vec<u64>,
    pub embedding: Vec<f32>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    pub idle_ttl_ms: u64,
    pub documents: Vec<DocumentRecord>,
    pub textunits: Vec<TextUnitRecord>,
    pub entities: Vec<EntityRecord>,
    pub relationships: Vec<RelationshipRecord>,
    pub communities: Vec<CommunityRecord>,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct EngineSnapshotRecord {
    pub format_version: u32,
    pub vector_dim: u32,
    pub sessions: Vec<SessionRecord>,
}

fn status_to_u8(status: DocumentStatus) -> u8 {
    match status {
        DocumentStatus::Uploaded => 0,
        DocumentStatus::Processing => 1,
        DocumentStatus::Ready => 2,
        DocumentStatus::Failed => 3,
    }
}

fn status_from_u8(value: u8) -> Result<DocumentStatus, StoreError> {
    match value {
        0 => Ok(DocumentStatus::Uploaded),
        1 => Ok(DocumentStatus::Processing),
        2 => Ok(DocumentStatus::Ready),
        3 => Ok(DocumentStatus::Failed),
        other => Err(StoreError::Codec(format!(
            "unknown document status tag: {other}"
        ))),
    }
}

/// Serialize a snapshot: `[4 bytes crc32 BE][rkyv payload]`.
pub fn encode_snapshot(record: &EngineSnapshotRecord) -> Result<Vec<u8>, StoreError> {
    let mut serializer = AllocSerializer::<1024>::default();
    serializer
        .serialize_value(record)
        .map_err(|err| StoreError::Codec(err.to_string()))?;
    let payload = serializer.into_serializer().into_inner();

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_snapshot(data: &[u8]) -> Result<EngineSnapshotRecord, StoreError> {
    if data.len() < 4 {
        return Err(StoreError::Codec("snapshot shorter than its header".into()));
    }
    let (crc_bytes, payload) = data.split_at(4);
    let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected {
        return Err(StoreError::Codec("snapshot crc mismatch".into()));
    }

    let archived = rkyv::check_archived_root::<EngineSnapshotRecord>(payload)
        .map_err(|err| StoreError::Codec(err.to_string()))?;
    let record: EngineSnapshotRecord = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| StoreError::Codec("snapshot deserialization failed".into()))?;

    if record.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(StoreError::Codec(format!(
            "unsupported snapshot format version: {}",
            record.format_version
        )));
    }
    Ok(record)
}

impl SessionStore {
    pub async fn export_record(&self) -> SessionRecord {
        fn sorted_values<T: Clone>(
            map: &std::collections::HashMap<u64, T>,
            id_of: impl Fn(&T) -> u64,
        ) -> Vec<T> {
            let mut values: Vec<T> = map.values().cloned().collect();
            values.sort_by_key(id_of);
            values
        }

        let documents = sorted_values(&*self.docs.read().await, |d: &Document| d.id)
            .into_iter()
            .map(|d| DocumentRecord {
                id: d.id,
                external_id: d.external_id,
                filename: d.filename,
                status: status_to_u8(d.status),
                created_at_ms: d.created_at_ms,
            })
            .collect();

        let textunits = sorted_values(&*self.textunits.read().await, |t: &TextUnit| t.id)
            .into_iter()
            .map(|t| TextUnitRecord {
                id: t.id,
                external_id: t.external_id,
                document_id: t.document_id,
                content: t.content,
                embedding: t.embedding,
                token_count: t.token_count,
                entity_ids: t.entity_ids,
            })
            .collect();

        let entities = sorted_values(&*self.entities.read().await, |e: &Entity| e.id)
            .into_iter()
            .map(|e| EntityRecord {
                id: e.id,
                external_id: e.external_id,
                title: e.title,
                entity_type: e.entity_type,
                description: e.description,
                embedding: e.embedding,
                textunit_ids: e.textunit_ids,
            })
            .collect();

        let relationships = sorted_values(&*self.rels.read().await, |r: &Relationship| r.id)
            .into_iter()
            .map(|r| RelationshipRecord {
                id: r.id,
                external_id: r.external_id,
                source_id: r.source_id,
                target_id: r.target_id,
                rel_type: r.rel_type,
                description: r.description,
                weight: r.weight,
            })
            .collect();

        let communities = sorted_values(&*self.communities.read().await, |c: &Community| c.id)
            .into_iter()
            .map(|c| CommunityRecord {
                id: c.id,
                external_id: c.external_id,
                title: c.title,
                summary: c.summary,
                full_content: c.full_content,
                level: c.level,
                entity_ids: c.entity_ids,
                relationship_ids: c.relationship_ids,
                embedding: c.embedding,
            })
            .collect();

        SessionRecord {
            session_id: self.session_id().to_string(),
            created_at_ms: self.created_at_ms(),
            ttl_ms: self.ttl_ms(),
            idle_ttl_ms: self.idle_ttl_ms(),
            documents,
            textunits,
            entities,
            relationships,
            communities,
        }
    }

    /// Rebuild a session from its record: by-id maps, reverse indices,
    /// adjacency and vector indexes are all reconstructed, and id counters
    /// resume above the highest restored id.
    pub async fn from_record(
        record: SessionRecord,
        dim: usize,
        quotas: QuotaConfig,
    ) -> Result<SessionStore, StoreError> {
        let store = SessionStore::new(
            record.session_id,
            dim,
            record.ttl_ms,
            record.idle_ttl_ms,
            quotas,
        );
        let mut mem = 0u64;

        {
            let mut docs = store.docs.write().await;
            let mut by_ext = store.docs_by_ext.write().await;
            for r in record.documents {
                let doc = Document {
                    id: r.id,
                    external_id: r.external_id,
                    filename: r.filename,
                    status: status_from_u8(r.status)?,
                    created_at_ms: r.created_at_ms,
                };
                store.ids.advance_past(Kind::Document, doc.id);
                mem += crate::session::document_cost(&doc);
                by_ext.insert(doc.external_id.clone(), doc.id);
                docs.insert(doc.id, doc);
            }
        }

        {
            let mut textunits = store.textunits.write().await;
            let mut by_ext = store.textunits_by_ext.write().await;
            let mut index = store.textunit_index.write().await;
            for r in record.textunits {
                let tu = TextUnit {
                    id: r.id,
                    external_id: r.external_id,
                    document_id: r.document_id,
                    content: r.content,
                    embedding: r.embedding,
                    token_count: r.token_count,
                    entity_ids: r.entity_ids,
                };
                store.ids.advance_past(Kind::TextUnit, tu.id);
                if !tu.embedding.is_empty() {
                    index.add(tu.id, tu.embedding.clone())?;
                }
                mem += crate::session::textunit_cost(&tu);
                by_ext.insert(tu.external_id.clone(), tu.id);
                textunits.insert(tu.id, tu);
            }
        }

        {
            let mut entities = store.entities.write().await;
            let mut by_ext = store.entities_by_ext.write().await;
            let mut by_title = store.entities_by_title.write().await;
            let mut index = store.entity_index.write().await;
            for r in record.entities {
                let entity = Entity {
                    id: r.id,
                    external_id: r.external_id,
                    canonical_title: canonical_title(&r.title),
                    title: r.title,
                    entity_type: r.entity_type,
                    description: r.description,
                    embedding: r.embedding,
                    textunit_ids: r.textunit_ids,
                };
                store.ids.advance_past(Kind::Entity, entity.id);
                if !entity.embedding.is_empty() {
                    index.add(entity.id, entity.embedding.clone())?;
                }
                mem += crate::session::entity_cost(&entity);
                by_ext.insert(entity.external_id.clone(), entity.id);
                by_title.insert(entity.canonical_title.clone(), entity.id);
                entities.insert(entity.id, entity);
            }
        }

        {
            let mut rels = store.rels.write().await;
            let mut by_ext = store.rels_by_ext.write().await;
            let mut adjacency = store.adjacency.write().await;
            for r in record.relationships {
                let rel = Relationship {
                    id: r.id,
                    external_id: r.external_id,
                    source_id: r.source_id,
                    target_id: r.target_id,
                    rel_type: r.rel_type,
                    description: r.description,
                    weight: r.weight,
                };
                store.ids.advance_past(Kind::Relationship, rel.id);
                adjacency.insert(rel.id, rel.source_id, rel.target_id);
                mem += crate::session::relationship_cost(&rel);
                if !rel.external_id.is_empty() {
                    by_ext.insert(rel.external_id.clone(), rel.id);
                }
                rels.insert(rel.id, rel);
            }
        }

        {
            let mut communities = store.communities.write().await;
            let mut by_ext = store.communities_by_ext.write().await;
            let mut index = store.community_index.write().await;
            for r in record.communities {
                let community = Community {
                    id: r.id,
                    external_id: r.external_id,
                    title: r.title,
                    summary: r.summary,
                    full_content: r.full_content,
                    level: r.level,
                    entity_ids: r.entity_ids,
                    relationship_ids: r.relationship_ids,
                    embedding: r.embedding,
                };
                store.ids.advance_past(Kind::Community, community.id);
                if !community.embedding.is_empty() {
                    index.add(community.id, community.embedding.clone())?;
                }
                mem += crate::session::community_cost(&community);
                if !community.external_id.is_empty() {
                    by_ext.insert(community.external_id.clone(), community.id);
                }
                communities.insert(community.id, community);
            }
        }

        store.set_memory_bytes(mem);
        store.touch();
        tracing::debug!(
            session_id = store.session_id(),
            bytes = mem,
            "session rebuilt from snapshot record"
        );
        Ok(store)
    }

    pub(crate) fn set_memory_bytes(&self, value: u64) {
        self.mem_bytes_handle().store(value, Ordering::Relaxed);
    }
}

/// Atomic tmp-then-rename snapshot files named by epoch millis.
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub async fn create_snapshot(&self, stamp_ms: u64, data: &[u8]) -> Result<PathBuf, StoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }

        let path = self.dir.join(format!("snapshot_{:020}.rkyv", stamp_ms));
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(path)
    }

    pub async fn latest_snapshot(&self) -> Result<Option<(u64, PathBuf)>, StoreError> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut best: Option<(u64, PathBuf)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(stamp) = parse_snapshot_stamp(name) {
                    if best.as_ref().map(|(s, _)| stamp > *s).unwrap_or(true) {
                        best = Some((stamp, path));
                    }
                }
            }
        }

        Ok(best)
    }
}

fn parse_snapshot_stamp(file_name: &str) -> Option<u64> {
    let stamp = file_name
        .strip_prefix("snapshot_")?
        .strip_suffix(".rkyv")?;
    stamp.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhizome_core::protocol::{EntitySpec, RelationshipSpec, TextUnitSpec};
    use tempfile::tempdir;

    async fn populated_store() -> SessionStore {
        let store = SessionStore::new("s1", 4, 0, 0, QuotaConfig::default());
        let doc = store
            .add_document("d1".into(), "report.pdf".into())
            .await
            .unwrap();
        let tu = store
            .add_textunit(TextUnitSpec {
                external_id: "t1".into(),
                document_id: doc.id,
                content: "QRIS expansion".into(),
                embedding: vec![0.0, 1.0, 0.0, 0.0],
                token_count: 2,
            })
            .await
            .unwrap();
        let a = store
            .add_entity(EntitySpec {
                external_id: "e1".into(),
                title: "Bank Indonesia".into(),
                entity_type: "org".into(),
                description: "central bank".into(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
            })
            .await
            .unwrap();
        let b = store
            .add_entity(EntitySpec {
                external_id: "e2".into(),
                title: "QRIS".into(),
                entity_type: "concept".into(),
                description: String::new(),
                embedding: vec![0.0, 1.0, 0.0, 0.0],
            })
            .await
            .unwrap();
        store
            .add_relationship(RelationshipSpec {
                external_id: "r1".into(),
                source_id: a.id,
                target_id: b.id,
                rel_type: "OPERATES".into(),
                description: String::new(),
                weight: 1.0,
            })
            .await
            .unwrap();
        store.link_textunit_to_entity(tu.id, b.id).await.unwrap();
        store
    }

    #[tokio::test]
    async fn session_record_round_trips_observable_state() {
        let store = populated_store().await;
        let record = store.export_record().await;

        let snapshot = EngineSnapshotRecord {
            format_version: SNAPSHOT_FORMAT_VERSION,
            vector_dim: 4,
            sessions: vec![record],
        };
        let encoded = encode_snapshot(&snapshot).unwrap();
        let decoded = decode_snapshot(&encoded).unwrap();

        let restored =
            SessionStore::from_record(decoded.sessions[0].clone(), 4, QuotaConfig::default())
                .await
                .unwrap();

        assert_eq!(restored.counters().await, store.counters().await);

        let original = store.get_entity_by_title("bank indonesia").await.unwrap();
        let roundtrip = restored.get_entity_by_title("bank indonesia").await.unwrap();
        assert_eq!(original, roundtrip);

        let hits = restored.search_entities(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].0, original.id);

        // Fresh ids continue above the restored watermark.
        let next = restored
            .add_entity(EntitySpec {
                external_id: "e3".into(),
                title: "OJK".into(),
                entity_type: "org".into(),
                description: String::new(),
                embedding: vec![],
            })
            .await
            .unwrap();
        assert!(next.id > original.id);
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_rejected() {
        let store = populated_store().await;
        let snapshot = EngineSnapshotRecord {
            format_version: SNAPSHOT_FORMAT_VERSION,
            vector_dim: 4,
            sessions: vec![store.export_record().await],
        };
        let mut encoded = encode_snapshot(&snapshot).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        assert!(matches!(
            decode_snapshot(&encoded),
            Err(StoreError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn manager_picks_the_latest_snapshot() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path());

        manager.create_snapshot(100, b"old").await.unwrap();
        manager.create_snapshot(300, b"new").await.unwrap();
        manager.create_snapshot(200, b"mid").await.unwrap();

        let (stamp, path) = manager.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(stamp, 300);
        assert_eq!(fs::read(path).await.unwrap(), b"new");
    }
}
