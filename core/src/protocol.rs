//! Wire protocol: length-prefixed frames carrying JSON request/response
//! envelopes.
//!
//! Frame layout: `[1 byte codec tag][4 bytes big-endian length][payload]`.
//! The only codec currently assigned is JSON (`0x01`); the tag exists so a
//! binary codec can be added without breaking old clients.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::auth::Permission;
use crate::error::{ErrorCode, RhizomeError};
use crate::model::{
    Community, Document, DocumentStatus, Entity, Relationship, SessionCounters, TextUnit,
};

pub const PROTOCOL_VERSION: u8 = 1;
pub const CODEC_JSON: u8 = 0x01;
pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unsupported codec tag: {0:#04x}")]
    UnsupportedCodec(u8),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl RhizomeError for ProtocolError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// Frame a payload for the wire.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Bytes, ProtocolError> {
    if payload.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(CODEC_JSON);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Validate a frame header and return the payload length to read.
pub fn decode_frame_header(
    header: &[u8; FRAME_HEADER_LEN],
    max_frame_size: usize,
) -> Result<usize, ProtocolError> {
    if header[0] != CODEC_JSON {
        return Err(ProtocolError::UnsupportedCodec(header[0]));
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }
    Ok(len)
}

// ---------------------------------------------------------------------------
// Command payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnitSpec {
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub token_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    #[serde(default)]
    pub external_id: String,
    pub source_id: u64,
    pub target_id: u64,
    #[serde(default)]
    pub rel_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunitySpec {
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub full_content: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub entity_ids: Vec<u64>,
    #[serde(default)]
    pub relationship_ids: Vec<u64>,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Per-request overrides of the configured Leiden defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LeidenOverrides {
    #[serde(default)]
    pub resolution: Option<f64>,
    #[serde(default)]
    pub iterations: Option<usize>,
    #[serde(default)]
    pub min_delta: Option<f64>,
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub max_levels: Option<usize>,
    #[serde(default)]
    pub min_community_size: Option<usize>,
    #[serde(default)]
    pub level_resolution: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    TextUnit,
    Entity,
    Community,
}

fn default_top_k() -> usize {
    10
}
fn default_max_textunits() -> usize {
    20
}
fn default_max_entities() -> usize {
    20
}
fn default_max_communities() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query_vector: Vec<f32>,
    /// Empty means all three kinds.
    #[serde(default)]
    pub search_types: Vec<SearchKind>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub k_hops: u32,
    #[serde(default = "default_max_textunits")]
    pub max_textunits: usize,
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_communities")]
    pub max_communities: usize,
    /// Advisory; 0 disables the deadline.
    #[serde(default)]
    pub deadline_ms: u64,
}

impl QuerySpec {
    pub fn effective_search_types(&self) -> Vec<SearchKind> {
        if self.search_types.is_empty() {
            vec![SearchKind::TextUnit, SearchKind::Entity, SearchKind::Community]
        } else {
            let mut seen = Vec::new();
            for kind in &self.search_types {
                if !seen.contains(kind) {
                    seen.push(*kind);
                }
            }
            seen
        }
    }
}

// ---------------------------------------------------------------------------
// Query result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTextUnit {
    pub textunit: TextUnit,
    pub similarity: f32,
    pub score: f32,
    pub hop: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub similarity: f32,
    pub score: f32,
    pub hop: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCommunity {
    pub community: Community,
    pub similarity: f32,
    pub score: f32,
    pub hop: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipOut {
    pub relationship: Relationship,
    pub source_title: Option<String>,
    pub target_title: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub duration_micros: u64,
    pub textunits_searched: u64,
    pub entities_searched: u64,
    pub communities_searched: u64,
    pub edges_scanned: u64,
    /// Set when the advisory deadline cut the pipeline short.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    pub query_id: u64,
    pub textunits: Vec<ScoredTextUnit>,
    pub entities: Vec<ScoredEntity>,
    pub communities: Vec<ScoredCommunity>,
    pub relationships: Vec<RelationshipOut>,
    pub stats: QueryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedInfo {
    pub kind: SearchKind,
    pub id: u64,
    pub external_id: String,
    pub similarity: f32,
    pub linked_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalStep {
    pub from_id: u64,
    pub to_id: u64,
    pub relationship_id: u64,
    pub hop: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub query_id: u64,
    pub seeds: Vec<SeedInfo>,
    pub traversal: Vec<TraversalStep>,
    pub stats: QueryStats,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Info,
    Health,
    Auth { api_key: String },

    AddDocument { external_id: String, filename: String },
    GetDocument { id: u64 },
    SetDocumentStatus { id: u64, status: DocumentStatus },
    DeleteDocument { id: u64 },
    ListDocuments { cursor: u64, limit: usize },

    AddTextUnit(TextUnitSpec),
    GetTextUnit { id: u64 },
    DeleteTextUnit { id: u64 },
    LinkTextUnitEntity { textunit_id: u64, entity_id: u64 },
    MSetTextUnits { items: Vec<TextUnitSpec> },
    MGetTextUnits { ids: Vec<u64> },
    ListTextUnits { cursor: u64, limit: usize },

    AddEntity(EntitySpec),
    GetEntity { id: u64 },
    GetEntityByTitle { title: String },
    UpdateEntityDesc { id: u64, description: String, embedding: Vec<f32> },
    DeleteEntity { id: u64 },
    MSetEntities { items: Vec<EntitySpec> },
    MGetEntities { ids: Vec<u64> },
    ListEntities { cursor: u64, limit: usize },

    AddRelationship(RelationshipSpec),
    GetRelationship { id: u64 },
    DeleteRelationship { id: u64 },
    MSetRelationships { items: Vec<RelationshipSpec> },
    MGetRelationships { ids: Vec<u64> },
    ListRelationships { cursor: u64, limit: usize },

    AddCommunity(CommunitySpec),
    GetCommunity { id: u64 },
    DeleteCommunity { id: u64 },
    ListCommunities { cursor: u64, limit: usize },
    ComputeCommunities { params: Option<LeidenOverrides> },
    HierarchicalLeiden { params: Option<LeidenOverrides> },

    Query(QuerySpec),
    Explain { query_id: u64 },

    Save,
    BgSave,
    LastSave,
    BgRestore,
    BackupStatus,

    ListSessions,
    DeleteSession,
    SetSessionTtl { ttl_ms: u64, idle_ttl_ms: u64 },
    TouchSession,
}

impl Command {
    /// The only commands accepted without a session id.
    pub fn session_exempt(&self) -> bool {
        matches!(
            self,
            Command::Ping
                | Command::Info
                | Command::Health
                | Command::Auth { .. }
                | Command::ListSessions
        )
    }

    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            Command::Ping | Command::Auth { .. } => None,
            Command::Info
            | Command::Health
            | Command::GetDocument { .. }
            | Command::ListDocuments { .. }
            | Command::GetTextUnit { .. }
            | Command::MGetTextUnits { .. }
            | Command::ListTextUnits { .. }
            | Command::GetEntity { .. }
            | Command::GetEntityByTitle { .. }
            | Command::MGetEntities { .. }
            | Command::ListEntities { .. }
            | Command::GetRelationship { .. }
            | Command::MGetRelationships { .. }
            | Command::ListRelationships { .. }
            | Command::GetCommunity { .. }
            | Command::ListCommunities { .. }
            | Command::Query(_)
            | Command::Explain { .. }
            | Command::LastSave
            | Command::BackupStatus
            | Command::ListSessions => Some(Permission::Read),
            Command::Save | Command::BgSave | Command::BgRestore | Command::DeleteSession
            | Command::SetSessionTtl { .. } => Some(Permission::Admin),
            _ => Some(Permission::Write),
        }
    }

    /// Safe to replay after a transport failure: reads, external-id-deduped
    /// bulk writes, and touch-style commands.
    pub fn retry_safe(&self) -> bool {
        match self.required_permission() {
            None | Some(Permission::Read) => true,
            _ => matches!(
                self,
                Command::MSetTextUnits { .. }
                    | Command::MSetEntities { .. }
                    | Command::MSetRelationships { .. }
                    | Command::TouchSession
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoBody {
    pub version: String,
    pub vector_dim: usize,
    pub session_count: u64,
    pub counters: SessionCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub components: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
    pub idle_ms: u64,
    pub ttl_ms: u64,
    pub idle_ttl_ms: u64,
    pub counters: SessionCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub entity_ids: Vec<u64>,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyLevel {
    pub level: u32,
    pub clusters: Vec<ClusterInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainBody {
    pub query_id: u64,
    pub seeds: Vec<SeedInfo>,
    pub traversal: Vec<TraversalStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type", content = "payload", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Ack,
    InfoResponse(InfoBody),
    HealthResponse(HealthBody),
    AuthResponse {
        success: bool,
        message: String,
        permissions: Vec<Permission>,
    },

    DocumentResponse(Document),
    TextUnitResponse(TextUnit),
    EntityResponse(Entity),
    RelationshipResponse(Relationship),
    CommunityResponse(Community),
    Deleted { id: u64 },
    Ids { ids: Vec<u64> },

    Documents { items: Vec<Document>, next_cursor: u64 },
    TextUnits { items: Vec<TextUnit>, next_cursor: u64 },
    Entities { items: Vec<Entity>, next_cursor: u64 },
    Relationships { items: Vec<Relationship>, next_cursor: u64 },
    Communities { items: Vec<Community>, next_cursor: u64 },

    CommunitiesComputed { count: u64, levels: u32 },
    Hierarchy { levels: Vec<HierarchyLevel> },

    QueryResponse(ContextPack),
    ExplainResponse(ExplainBody),

    SaveResponse { completed: bool, path: Option<String> },
    LastSaveResponse { last_save: Option<String> },
    BackupStatusResponse {
        in_progress: bool,
        last_save: Option<String>,
        last_error: Option<String>,
    },

    Sessions { items: Vec<SessionInfo> },

    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub version: u8,
    pub request_id: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub command: Command,
}

impl RequestEnvelope {
    pub fn new(request_id: u64, session_id: impl Into<String>, command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            session_id: session_id.into(),
            command,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: RequestEnvelope = serde_json::from_slice(payload)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub version: u8,
    pub request_id: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub body: Response,
}

impl ResponseEnvelope {
    pub fn new(request_id: u64, session_id: impl Into<String>, body: Response) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            session_id: session_id.into(),
            body,
        }
    }

    pub fn error(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            request_id,
            String::new(),
            Response::Error(ErrorBody {
                code,
                message: message.into(),
            }),
        )
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}
