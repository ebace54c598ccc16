//! Per-connection request loop: frame decode, auth handshake, permission
//! checks, command dispatch, error translation.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use rhizome_core::auth::{ApiKeyAuthenticator, AuthError, Permission, Principal};
use rhizome_core::error::{ErrorCode, RhizomeError};
use rhizome_core::protocol::{
    encode_frame, decode_frame_header, Command, ErrorBody, HierarchyLevel, ClusterInfo,
    InfoBody, ProtocolError, RequestEnvelope, Response, ResponseEnvelope, FRAME_HEADER_LEN,
};

use crate::engine::{Engine, EngineError};

#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    pub max_frame_size: usize,
    /// Write deadline; the payload read deadline is twice this.
    pub conn_timeout: Duration,
}

enum ReadOutcome {
    Frame(Vec<u8>),
    Closed,
}

async fn read_frame<R>(reader: &mut R, limits: &ConnLimits) -> Result<ReadOutcome, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    // No deadline on the header: a pooled connection may sit idle between
    // requests. The deadline starts once a frame begins arriving.
    let mut header = [0u8; FRAME_HEADER_LEN];
    if reader.read_exact(&mut header).await.is_err() {
        return Ok(ReadOutcome::Closed);
    }

    let len = decode_frame_header(&header, limits.max_frame_size)?;
    let mut payload = vec![0u8; len];
    match timeout(limits.conn_timeout * 2, reader.read_exact(&mut payload)).await {
        Ok(Ok(_)) => Ok(ReadOutcome::Frame(payload)),
        Ok(Err(_)) => Ok(ReadOutcome::Closed),
        Err(_) => {
            warn!("frame body read deadline exceeded");
            Ok(ReadOutcome::Closed)
        }
    }
}

async fn write_response<W>(
    writer: &mut W,
    response: &ResponseEnvelope,
    limits: &ConnLimits,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = match response
        .to_payload()
        .and_then(|payload| encode_frame(&payload, limits.max_frame_size))
    {
        Ok(frame) => frame,
        Err(err) => {
            // The response itself could not be framed; degrade to an error
            // envelope of the same request id.
            let fallback =
                ResponseEnvelope::error(response.request_id, err.error_code(), err.to_string());
            let payload = fallback
                .to_payload()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            encode_frame(&payload, limits.max_frame_size)
                .map_err(|e| std::io::Error::other(e.to_string()))?
        }
    };

    timeout(limits.conn_timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))?
}

fn error_response(err: &dyn RhizomeError) -> Response {
    Response::Error(ErrorBody {
        code: err.error_code(),
        message: err.to_string(),
    })
}

/// Serve one connection until it closes. `stream` is the plain TCP stream or
/// the server side of a TLS session.
pub async fn serve_connection<S>(
    stream: S,
    engine: Arc<Engine>,
    auth: Arc<ApiKeyAuthenticator>,
    limits: ConnLimits,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Without configured keys every connection is implicitly authenticated.
    let mut principal: Option<Principal> = if auth.required() {
        None
    } else {
        Some(ApiKeyAuthenticator::open_principal())
    };

    loop {
        let payload = match read_frame(&mut reader, &limits).await {
            Ok(ReadOutcome::Frame(payload)) => payload,
            Ok(ReadOutcome::Closed) => break,
            Err(err) => {
                let response = ResponseEnvelope::error(0, err.error_code(), err.to_string());
                let _ = write_response(&mut writer, &response, &limits).await;
                break;
            }
        };

        let envelope = match RequestEnvelope::from_payload(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let response = ResponseEnvelope::error(0, err.error_code(), err.to_string());
                if write_response(&mut writer, &response, &limits).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let request_id = envelope.request_id;
        let session_id = envelope.session_id.clone();
        debug!(request_id, session_id = %session_id, "request");

        let (body, close_after) =
            handle_command(&engine, &auth, &mut principal, &envelope.command, &session_id).await;

        let response = ResponseEnvelope::new(request_id, session_id, body);
        if write_response(&mut writer, &response, &limits).await.is_err() {
            break;
        }
        if close_after {
            break;
        }
    }
}

async fn handle_command(
    engine: &Arc<Engine>,
    auth: &Arc<ApiKeyAuthenticator>,
    principal: &mut Option<Principal>,
    command: &Command,
    session_id: &str,
) -> (Response, bool) {
    // Auth is the one command allowed before a principal exists. A failed
    // handshake closes the connection.
    if let Command::Auth { api_key } = command {
        return match auth.authenticate(api_key) {
            Ok(authenticated) => {
                let mut permissions: Vec<Permission> =
                    authenticated.permissions.iter().copied().collect();
                permissions.sort();
                *principal = Some(authenticated);
                (
                    Response::AuthResponse {
                        success: true,
                        message: "authenticated".to_string(),
                        permissions,
                    },
                    false,
                )
            }
            Err(err) => (error_response(&err), true),
        };
    }

    let Some(current) = principal.as_ref() else {
        return (error_response(&AuthError::Unauthenticated), true);
    };

    if let Some(required) = command.required_permission() {
        if !current.allows(required) {
            return (error_response(&AuthError::Forbidden(required)), false);
        }
    }

    if !command.session_exempt() && session_id.is_empty() {
        return (
            Response::Error(ErrorBody {
                code: ErrorCode::SessionRequired,
                message: "a session_id is required for this command".to_string(),
            }),
            false,
        );
    }

    let body = execute(engine, command, session_id)
        .await
        .unwrap_or_else(|err| error_response(&err));
    (body, false)
}

async fn execute(
    engine: &Arc<Engine>,
    command: &Command,
    session_id: &str,
) -> Result<Response, EngineError> {
    match command {
        Command::Ping => Ok(Response::Pong),
        // Handled in handle_command; reaching here means a duplicate Auth on
        // an open connection, which is answered like the first.
        Command::Auth { .. } => Ok(Response::Pong),

        Command::Info => {
            if session_id.is_empty() {
                Ok(Response::InfoResponse(engine.info().await))
            } else {
                let session = engine.info_for_session(session_id).await?;
                Ok(Response::InfoResponse(InfoBody {
                    version: crate::engine::ENGINE_VERSION.to_string(),
                    vector_dim: engine.vector_dim(),
                    session_count: 1,
                    counters: session.counters,
                }))
            }
        }
        Command::Health => Ok(Response::HealthResponse(engine.health().await)),

        // -- documents ------------------------------------------------------
        Command::AddDocument {
            external_id,
            filename,
        } => {
            let store = engine.get_or_create(session_id).await?;
            let doc = store
                .add_document(external_id.clone(), filename.clone())
                .await?;
            Ok(Response::DocumentResponse(doc))
        }
        Command::GetDocument { id } => {
            let store = engine.get(session_id).await?;
            Ok(Response::DocumentResponse(store.get_document(*id).await?))
        }
        Command::SetDocumentStatus { id, status } => {
            let store = engine.get(session_id).await?;
            Ok(Response::DocumentResponse(
                store.set_document_status(*id, *status).await?,
            ))
        }
        Command::DeleteDocument { id } => {
            let store = engine.get(session_id).await?;
            store.delete_document(*id).await?;
            Ok(Response::Deleted { id: *id })
        }
        Command::ListDocuments { cursor, limit } => {
            let store = engine.get(session_id).await?;
            let (items, next_cursor) = store.list_documents(*cursor, *limit).await;
            Ok(Response::Documents { items, next_cursor })
        }

        // -- textunits ------------------------------------------------------
        Command::AddTextUnit(spec) => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::TextUnitResponse(
                store.add_textunit(spec.clone()).await?,
            ))
        }
        Command::GetTextUnit { id } => {
            let store = engine.get(session_id).await?;
            Ok(Response::TextUnitResponse(store.get_textunit(*id).await?))
        }
        Command::DeleteTextUnit { id } => {
            let store = engine.get(session_id).await?;
            store.delete_textunit(*id).await?;
            Ok(Response::Deleted { id: *id })
        }
        Command::LinkTextUnitEntity {
            textunit_id,
            entity_id,
        } => {
            let store = engine.get(session_id).await?;
            store
                .link_textunit_to_entity(*textunit_id, *entity_id)
                .await?;
            Ok(Response::Ack)
        }
        Command::MSetTextUnits { items } => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::Ids {
                ids: store.mset_textunits(items.clone()).await?,
            })
        }
        Command::MGetTextUnits { ids } => {
            let store = engine.get(session_id).await?;
            Ok(Response::TextUnits {
                items: store.textunits_by_ids(ids).await,
                next_cursor: 0,
            })
        }
        Command::ListTextUnits { cursor, limit } => {
            let store = engine.get(session_id).await?;
            let (items, next_cursor) = store.list_textunits(*cursor, *limit).await;
            Ok(Response::TextUnits { items, next_cursor })
        }

        // -- entities -------------------------------------------------------
        Command::AddEntity(spec) => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::EntityResponse(store.add_entity(spec.clone()).await?))
        }
        Command::GetEntity { id } => {
            let store = engine.get(session_id).await?;
            Ok(Response::EntityResponse(store.get_entity(*id).await?))
        }
        Command::GetEntityByTitle { title } => {
            let store = engine.get(session_id).await?;
            Ok(Response::EntityResponse(
                store.get_entity_by_title(title).await?,
            ))
        }
        Command::UpdateEntityDesc {
            id,
            description,
            embedding,
        } => {
            let store = engine.get(session_id).await?;
            Ok(Response::EntityResponse(
                store
                    .update_entity_description(*id, description.clone(), embedding.clone())
                    .await?,
            ))
        }
        Command::DeleteEntity { id } => {
            let store = engine.get(session_id).await?;
            store.delete_entity(*id).await?;
            Ok(Response::Deleted { id: *id })
        }
        Command::MSetEntities { items } => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::Ids {
                ids: store.mset_entities(items.clone()).await?,
            })
        }
        Command::MGetEntities { ids } => {
            let store = engine.get(session_id).await?;
            Ok(Response::Entities {
                items: store.entities_by_ids(ids).await,
                next_cursor: 0,
            })
        }
        Command::ListEntities { cursor, limit } => {
            let store = engine.get(session_id).await?;
            let (items, next_cursor) = store.list_entities(*cursor, *limit).await;
            Ok(Response::Entities { items, next_cursor })
        }

        // -- relationships --------------------------------------------------
        Command::AddRelationship(spec) => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::RelationshipResponse(
                store.add_relationship(spec.clone()).await?,
            ))
        }
        Command::GetRelationship { id } => {
            let store = engine.get(session_id).await?;
            Ok(Response::RelationshipResponse(
                store.get_relationship(*id).await?,
            ))
        }
        Command::DeleteRelationship { id } => {
            let store = engine.get(session_id).await?;
            store.delete_relationship(*id).await?;
            Ok(Response::Deleted { id: *id })
        }
        Command::MSetRelationships { items } => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::Ids {
                ids: store.mset_relationships(items.clone()).await?,
            })
        }
        Command::MGetRelationships { ids } => {
            let store = engine.get(session_id).await?;
            Ok(Response::Relationships {
                items: store.relationships_by_ids(ids).await,
                next_cursor: 0,
            })
        }
        Command::ListRelationships { cursor, limit } => {
            let store = engine.get(session_id).await?;
            let (items, next_cursor) = store.list_relationships(*cursor, *limit).await;
            Ok(Response::Relationships { items, next_cursor })
        }

        // -- communities ----------------------------------------------------
        Command::AddCommunity(spec) => {
            let store = engine.get_or_create(session_id).await?;
            Ok(Response::CommunityResponse(
                store.add_community(spec.clone()).await?,
            ))
        }
        Command::GetCommunity { id } => {
            let store = engine.get(session_id).await?;
            Ok(Response::CommunityResponse(store.get_community(*id).await?))
        }
        Command::DeleteCommunity { id } => {
            let store = engine.get(session_id).await?;
            store.delete_community(*id).await?;
            Ok(Response::Deleted { id: *id })
        }
        Command::ListCommunities { cursor, limit } => {
            let store = engine.get(session_id).await?;
            let (items, next_cursor) = store.list_communities(*cursor, *limit).await;
            Ok(Response::Communities { items, next_cursor })
        }
        Command::ComputeCommunities { params } => {
            let count = engine
                .compute_communities(session_id, params.as_ref())
                .await?;
            Ok(Response::CommunitiesComputed { count, levels: 1 })
        }
        Command::HierarchicalLeiden { params } => {
            let (levels, _count) = engine
                .compute_hierarchy(session_id, params.as_ref())
                .await?;
            Ok(Response::Hierarchy {
                levels: levels
                    .into_iter()
                    .map(|level| HierarchyLevel {
                        level: level.level,
                        clusters: level
                            .clusters
                            .into_iter()
                            .map(|cluster| ClusterInfo {
                                entity_ids: cluster.entity_ids,
                                parent: cluster.parent,
                            })
                            .collect(),
                    })
                    .collect(),
            })
        }

        // -- query ----------------------------------------------------------
        Command::Query(spec) => Ok(Response::QueryResponse(
            engine.query(session_id, spec).await?,
        )),
        Command::Explain { query_id } => {
            Ok(Response::ExplainResponse(engine.explain(*query_id)?))
        }

        // -- backup ---------------------------------------------------------
        Command::Save => {
            let path = engine.save().await?;
            Ok(Response::SaveResponse {
                completed: true,
                path: Some(path.display().to_string()),
            })
        }
        Command::BgSave => {
            let _ = engine.spawn_save();
            Ok(Response::SaveResponse {
                completed: false,
                path: None,
            })
        }
        Command::LastSave => Ok(Response::LastSaveResponse {
            last_save: engine.last_save().await,
        }),
        Command::BgRestore => {
            let _ = engine.spawn_restore();
            Ok(Response::Ack)
        }
        Command::BackupStatus => {
            let (in_progress, last_save, last_error) = engine.backup_status().await;
            Ok(Response::BackupStatusResponse {
                in_progress,
                last_save,
                last_error,
            })
        }

        // -- sessions -------------------------------------------------------
        Command::ListSessions => Ok(Response::Sessions {
            items: engine.list_sessions().await,
        }),
        Command::DeleteSession => {
            engine.delete_session(session_id).await?;
            Ok(Response::Ack)
        }
        Command::SetSessionTtl {
            ttl_ms,
            idle_ttl_ms,
        } => {
            let store = engine.get(session_id).await?;
            store.set_ttl(*ttl_ms, *idle_ttl_ms);
            Ok(Response::Ack)
        }
        Command::TouchSession => {
            // get() already touches on a successful lookup.
            engine.get(session_id).await?;
            Ok(Response::Ack)
        }
    }
}
