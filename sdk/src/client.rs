//! Typed client surface over the pooled wire protocol.
//!
//! Transport failures close the connection and, for retry-safe commands
//! (reads, `MSet*`, touch), transparently retry on a fresh connection up to
//! `max_retries` times. Single `Add*` writes are never auto-retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use rhizome_core::model::{Community, Document, DocumentStatus, Entity, Relationship, TextUnit};
use rhizome_core::protocol::{
    Command, CommunitySpec, ContextPack, EntitySpec, ExplainBody, HealthBody, HierarchyLevel,
    InfoBody, LeidenOverrides, QuerySpec, RelationshipSpec, RequestEnvelope, Response,
    SessionInfo, TextUnitSpec,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::pool::ConnectionPool;

pub struct Client {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    request_ids: AtomicU64,
}

fn unexpected(body: Response) -> ClientError {
    ClientError::Unexpected(format!("{body:?}"))
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let _ = pool.spawn_cleaner();
        Self {
            config,
            pool,
            request_ids: AtomicU64::new(0),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Send one command and return the response body. `Error` bodies become
    /// typed `ClientError::Server` values.
    pub async fn request(
        &self,
        session_id: &str,
        command: Command,
    ) -> Result<Response, ClientError> {
        let mut attempt = 0usize;
        loop {
            let mut conn = self.pool.acquire().await?;
            let envelope =
                RequestEnvelope::new(self.next_request_id(), session_id, command.clone());

            match conn.call(&envelope, &self.config).await {
                Ok(response) => {
                    self.pool.release(conn).await;
                    return match response.body {
                        Response::Error(body) => Err(ClientError::Server {
                            code: body.code,
                            message: body.message,
                        }),
                        body => Ok(body),
                    };
                }
                Err(err) => {
                    // A failed connection never goes back to the pool.
                    drop(conn);
                    self.pool.discard().await;

                    attempt += 1;
                    let retry = err.is_transport()
                        && command.retry_safe()
                        && attempt <= self.config.max_retries;
                    if !retry {
                        return Err(err);
                    }
                    debug!(attempt, "retrying retry-safe command on a fresh connection");
                }
            }
        }
    }

    // -- meta ---------------------------------------------------------------

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.request("", Command::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Engine-wide info with an empty session id, per-session otherwise.
    pub async fn info(&self, session_id: &str) -> Result<InfoBody, ClientError> {
        match self.request(session_id, Command::Info).await? {
            Response::InfoResponse(body) => Ok(body),
            other => Err(unexpected(other)),
        }
    }

    pub async fn health(&self) -> Result<HealthBody, ClientError> {
        match self.request("", Command::Health).await? {
            Response::HealthResponse(body) => Ok(body),
            other => Err(unexpected(other)),
        }
    }

    // -- documents ----------------------------------------------------------

    pub async fn add_document(
        &self,
        session_id: &str,
        external_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Document, ClientError> {
        let command = Command::AddDocument {
            external_id: external_id.into(),
            filename: filename.into(),
        };
        match self.request(session_id, command).await? {
            Response::DocumentResponse(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_document(&self, session_id: &str, id: u64) -> Result<Document, ClientError> {
        match self.request(session_id, Command::GetDocument { id }).await? {
            Response::DocumentResponse(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_document_status(
        &self,
        session_id: &str,
        id: u64,
        status: DocumentStatus,
    ) -> Result<Document, ClientError> {
        match self
            .request(session_id, Command::SetDocumentStatus { id, status })
            .await?
        {
            Response::DocumentResponse(doc) => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_document(&self, session_id: &str, id: u64) -> Result<(), ClientError> {
        match self
            .request(session_id, Command::DeleteDocument { id })
            .await?
        {
            Response::Deleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_documents(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Document>, u64), ClientError> {
        match self
            .request(session_id, Command::ListDocuments { cursor, limit })
            .await?
        {
            Response::Documents { items, next_cursor } => Ok((items, next_cursor)),
            other => Err(unexpected(other)),
        }
    }

    // -- textunits ----------------------------------------------------------

    pub async fn add_textunit(
        &self,
        session_id: &str,
        spec: TextUnitSpec,
    ) -> Result<TextUnit, ClientError> {
        match self.request(session_id, Command::AddTextUnit(spec)).await? {
            Response::TextUnitResponse(tu) => Ok(tu),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_textunit(&self, session_id: &str, id: u64) -> Result<TextUnit, ClientError> {
        match self.request(session_id, Command::GetTextUnit { id }).await? {
            Response::TextUnitResponse(tu) => Ok(tu),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_textunit(&self, session_id: &str, id: u64) -> Result<(), ClientError> {
        match self
            .request(session_id, Command::DeleteTextUnit { id })
            .await?
        {
            Response::Deleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn link_textunit_entity(
        &self,
        session_id: &str,
        textunit_id: u64,
        entity_id: u64,
    ) -> Result<(), ClientError> {
        match self
            .request(
                session_id,
                Command::LinkTextUnitEntity {
                    textunit_id,
                    entity_id,
                },
            )
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mset_textunits(
        &self,
        session_id: &str,
        items: Vec<TextUnitSpec>,
    ) -> Result<Vec<u64>, ClientError> {
        match self
            .request(session_id, Command::MSetTextUnits { items })
            .await?
        {
            Response::Ids { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mget_textunits(
        &self,
        session_id: &str,
        ids: Vec<u64>,
    ) -> Result<Vec<TextUnit>, ClientError> {
        match self
            .request(session_id, Command::MGetTextUnits { ids })
            .await?
        {
            Response::TextUnits { items, .. } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_textunits(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<TextUnit>, u64), ClientError> {
        match self
            .request(session_id, Command::ListTextUnits { cursor, limit })
            .await?
        {
            Response::TextUnits { items, next_cursor } => Ok((items, next_cursor)),
            other => Err(unexpected(other)),
        }
    }

    // -- entities -----------------------------------------------------------

    pub async fn add_entity(
        &self,
        session_id: &str,
        spec: EntitySpec,
    ) -> Result<Entity, ClientError> {
        match self.request(session_id, Command::AddEntity(spec)).await? {
            Response::EntityResponse(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_entity(&self, session_id: &str, id: u64) -> Result<Entity, ClientError> {
        match self.request(session_id, Command::GetEntity { id }).await? {
            Response::EntityResponse(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_entity_by_title(
        &self,
        session_id: &str,
        title: impl Into<String>,
    ) -> Result<Entity, ClientError> {
        match self
            .request(
                session_id,
                Command::GetEntityByTitle {
                    title: title.into(),
                },
            )
            .await?
        {
            Response::EntityResponse(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_entity_description(
        &self,
        session_id: &str,
        id: u64,
        description: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Result<Entity, ClientError> {
        match self
            .request(
                session_id,
                Command::UpdateEntityDesc {
                    id,
                    description: description.into(),
                    embedding,
                },
            )
            .await?
        {
            Response::EntityResponse(entity) => Ok(entity),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_entity(&self, session_id: &str, id: u64) -> Result<(), ClientError> {
        match self.request(session_id, Command::DeleteEntity { id }).await? {
            Response::Deleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mset_entities(
        &self,
        session_id: &str,
        items: Vec<EntitySpec>,
    ) -> Result<Vec<u64>, ClientError> {
        match self
            .request(session_id, Command::MSetEntities { items })
            .await?
        {
            Response::Ids { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mget_entities(
        &self,
        session_id: &str,
        ids: Vec<u64>,
    ) -> Result<Vec<Entity>, ClientError> {
        match self
            .request(session_id, Command::MGetEntities { ids })
            .await?
        {
            Response::Entities { items, .. } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_entities(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Entity>, u64), ClientError> {
        match self
            .request(session_id, Command::ListEntities { cursor, limit })
            .await?
        {
            Response::Entities { items, next_cursor } => Ok((items, next_cursor)),
            other => Err(unexpected(other)),
        }
    }

    // -- relationships ------------------------------------------------------

    pub async fn add_relationship(
        &self,
        session_id: &str,
        spec: RelationshipSpec,
    ) -> Result<Relationship, ClientError> {
        match self
            .request(session_id, Command::AddRelationship(spec))
            .await?
        {
            Response::RelationshipResponse(rel) => Ok(rel),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_relationship(
        &self,
        session_id: &str,
        id: u64,
    ) -> Result<Relationship, ClientError> {
        match self
            .request(session_id, Command::GetRelationship { id })
            .await?
        {
            Response::RelationshipResponse(rel) => Ok(rel),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_relationship(&self, session_id: &str, id: u64) -> Result<(), ClientError> {
        match self
            .request(session_id, Command::DeleteRelationship { id })
            .await?
        {
            Response::Deleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mset_relationships(
        &self,
        session_id: &str,
        items: Vec<RelationshipSpec>,
    ) -> Result<Vec<u64>, ClientError> {
        match self
            .request(session_id, Command::MSetRelationships { items })
            .await?
        {
            Response::Ids { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mget_relationships(
        &self,
        session_id: &str,
        ids: Vec<u64>,
    ) -> Result<Vec<Relationship>, ClientError> {
        match self
            .request(session_id, Command::MGetRelationships { ids })
            .await?
        {
            Response::Relationships { items, .. } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_relationships(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Relationship>, u64), ClientError> {
        match self
            .request(session_id, Command::ListRelationships { cursor, limit })
            .await?
        {
            Response::Relationships { items, next_cursor } => Ok((items, next_cursor)),
            other => Err(unexpected(other)),
        }
    }

    // -- communities --------------------------------------------------------

    pub async fn add_community(
        &self,
        session_id: &str,
        spec: CommunitySpec,
    ) -> Result<Community, ClientError> {
        match self.request(session_id, Command::AddCommunity(spec)).await? {
            Response::CommunityResponse(community) => Ok(community),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_community(
        &self,
        session_id: &str,
        id: u64,
    ) -> Result<Community, ClientError> {
        match self.request(session_id, Command::GetCommunity { id }).await? {
            Response::CommunityResponse(community) => Ok(community),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_community(&self, session_id: &str, id: u64) -> Result<(), ClientError> {
        match self
            .request(session_id, Command::DeleteCommunity { id })
            .await?
        {
            Response::Deleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_communities(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Community>, u64), ClientError> {
        match self
            .request(session_id, Command::ListCommunities { cursor, limit })
            .await?
        {
            Response::Communities { items, next_cursor } => Ok((items, next_cursor)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn compute_communities(
        &self,
        session_id: &str,
        params: Option<LeidenOverrides>,
    ) -> Result<u64, ClientError> {
        match self
            .request(session_id, Command::ComputeCommunities { params })
            .await?
        {
            Response::CommunitiesComputed { count, .. } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn hierarchical_leiden(
        &self,
        session_id: &str,
        params: Option<LeidenOverrides>,
    ) -> Result<Vec<HierarchyLevel>, ClientError> {
        match self
            .request(session_id, Command::HierarchicalLeiden { params })
            .await?
        {
            Response::Hierarchy { levels } => Ok(levels),
            other => Err(unexpected(other)),
        }
    }

    // -- query --------------------------------------------------------------

    pub async fn query(
        &self,
        session_id: &str,
        spec: QuerySpec,
    ) -> Result<ContextPack, ClientError> {
        match self.request(session_id, Command::Query(spec)).await? {
            Response::QueryResponse(pack) => Ok(pack),
            other => Err(unexpected(other)),
        }
    }

    /// The query log is engine-global; the session id only satisfies the
    /// envelope requirement.
    pub async fn explain(
        &self,
        session_id: &str,
        query_id: u64,
    ) -> Result<ExplainBody, ClientError> {
        match self
            .request(session_id, Command::Explain { query_id })
            .await?
        {
            Response::ExplainResponse(body) => Ok(body),
            other => Err(unexpected(other)),
        }
    }

    // -- backup -------------------------------------------------------------

    pub async fn save(&self, session_id: &str) -> Result<Option<String>, ClientError> {
        match self.request(session_id, Command::Save).await? {
            Response::SaveResponse { path, .. } => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bg_save(&self, session_id: &str) -> Result<(), ClientError> {
        match self.request(session_id, Command::BgSave).await? {
            Response::SaveResponse { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn last_save(&self, session_id: &str) -> Result<Option<String>, ClientError> {
        match self.request(session_id, Command::LastSave).await? {
            Response::LastSaveResponse { last_save } => Ok(last_save),
            other => Err(unexpected(other)),
        }
    }

    pub async fn bg_restore(&self, session_id: &str) -> Result<(), ClientError> {
        match self.request(session_id, Command::BgRestore).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn backup_status(
        &self,
        session_id: &str,
    ) -> Result<(bool, Option<String>, Option<String>), ClientError> {
        match self.request(session_id, Command::BackupStatus).await? {
            Response::BackupStatusResponse {
                in_progress,
                last_save,
                last_error,
            } => Ok((in_progress, last_save, last_error)),
            other => Err(unexpected(other)),
        }
    }

    // -- sessions -----------------------------------------------------------

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        match self.request("", Command::ListSessions).await? {
            Response::Sessions { items } => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        match self.request(session_id, Command::DeleteSession).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_session_ttl(
        &self,
        session_id: &str,
        ttl_ms: u64,
        idle_ttl_ms: u64,
    ) -> Result<(), ClientError> {
        match self
            .request(
                session_id,
                Command::SetSessionTtl {
                    ttl_ms,
                    idle_ttl_ms,
                },
            )
            .await?
        {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<(), ClientError> {
        match self.request(session_id, Command::TouchSession).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
