use serde::{Deserialize, Serialize};

/// Canonical form of an entity title: whitespace collapsed, trimmed,
/// upper-cased. This is the sole key for title lookup.
pub fn canonical_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    fn rank(self) -> u8 {
        match self {
            DocumentStatus::Uploaded => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::Ready => 2,
            DocumentStatus::Failed => 3,
        }
    }

    /// Transitions are forward-only, except an explicit reset back to
    /// `Uploaded`.
    pub fn can_transition(self, next: DocumentStatus) -> bool {
        next == DocumentStatus::Uploaded || next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub external_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: u64,
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: u32,
    /// Linked entity ids, insert order, no duplicates.
    pub entity_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    /// Stored beside the entity so title round-trips are O(1).
    pub canonical_title: String,
    pub entity_type: String,
    pub description: String,
    pub embedding: Vec<f32>,
    /// Linked textunit ids, insert order, no duplicates.
    pub textunit_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: u64,
    pub external_id: String,
    pub source_id: u64,
    pub target_id: u64,
    pub rel_type: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    /// Left empty by community detection; an external agent fills it.
    pub summary: String,
    pub full_content: String,
    pub level: u32,
    pub entity_ids: Vec<u64>,
    pub relationship_ids: Vec<u64>,
    pub embedding: Vec<f32>,
}

/// Per-kind live counts, derived from map sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub documents: u64,
    pub textunits: u64,
    pub entities: u64,
    pub relationships: u64,
    pub communities: u64,
}

impl SessionCounters {
    pub fn add(&mut self, other: &SessionCounters) {
        self.documents += other.documents;
        self.textunits += other.textunits;
        self.entities += other.entities;
        self.relationships += other.relationships;
        self.communities += other.communities;
    }
}
