//! The engine owns every session and everything engine-global: the query-id
//! counter, the query log, backup state and the cleanup loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use query::{run_query, QueryLogLru, MAX_QUERY_LOG_ENTRIES};
use rhizome_core::config::AppConfig;
use rhizome_core::error::{ErrorCode, RhizomeError};
use rhizome_core::metrics::MetricsCollector;
use rhizome_core::model::SessionCounters;
use rhizome_core::protocol::{
    ContextPack, ExplainBody, HealthBody, InfoBody, LeidenOverrides, QuerySpec, SessionInfo,
};
use storage::error::StoreError;
use storage::leiden::LeidenLevel;
use storage::session::SessionStore;
use storage::snapshot::{
    decode_snapshot, encode_snapshot, EngineSnapshotRecord, SnapshotManager,
    SNAPSHOT_FORMAT_VERSION,
};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session expired: {0}")]
    SessionExpired(String),
    #[error("session id is required")]
    SessionRequired,
    #[error("session limit reached: {0}")]
    MaxSessions(usize),
    #[error("vector dimension mismatch: engine {expected}, snapshot {got}")]
    SnapshotDimension { expected: usize, got: usize },
    #[error("query not found: {0}")]
    QueryNotFound(u64),
    #[error("a backup operation is already running")]
    BackupBusy,
    #[error("no snapshot available to restore")]
    NoSnapshot,
}

impl RhizomeError for EngineError {
    fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Store(err) => err.error_code(),
            EngineError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            EngineError::SessionExpired(_) => ErrorCode::SessionExpired,
            EngineError::SessionRequired => ErrorCode::SessionRequired,
            EngineError::MaxSessions(_) => ErrorCode::QuotaExceeded,
            EngineError::SnapshotDimension { .. } => ErrorCode::DimensionMismatch,
            EngineError::QueryNotFound(_) => ErrorCode::NotFound,
            EngineError::BackupBusy => ErrorCode::RateLimited,
            EngineError::NoSnapshot => ErrorCode::NotFound,
        }
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn rfc3339(epoch_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct BackupState {
    in_progress: bool,
    last_save_ms: Option<u64>,
    last_error: Option<String>,
}

pub struct Engine {
    config: AppConfig,
    sessions: RwLock<HashMap<String, Arc<SessionStore>>>,
    query_ids: AtomicU64,
    query_log: QueryLogLru,
    metrics: MetricsCollector,
    backup: Mutex<BackupState>,
    snapshots: SnapshotManager,
}

impl Engine {
    pub fn new(config: AppConfig) -> Self {
        let snapshots = SnapshotManager::new(&config.storage.data_dir);
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            query_ids: AtomicU64::new(0),
            query_log: QueryLogLru::new(MAX_QUERY_LOG_ENTRIES),
            metrics: MetricsCollector::new(1024),
            backup: Mutex::new(BackupState::default()),
            snapshots,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn vector_dim(&self) -> usize {
        self.config.storage.vector_dim
    }

    // -- session lookup -----------------------------------------------------

    /// Write path: expired sessions are reaped lazily and a fresh session is
    /// created up to `max_sessions`. Every hit touches.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<SessionStore>, EngineError> {
        if session_id.is_empty() {
            return Err(EngineError::SessionRequired);
        }

        {
            let sessions = self.sessions.read().await;
            if let Some(store) = sessions.get(session_id) {
                if !store.is_expired() {
                    store.touch();
                    return Ok(store.clone());
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(store) = sessions.get(session_id) {
            if !store.is_expired() {
                store.touch();
                return Ok(store.clone());
            }
            debug!(session_id, "reaping expired session on write");
            sessions.remove(session_id);
        }

        if sessions.len() >= self.config.session.max_sessions {
            return Err(EngineError::MaxSessions(self.config.session.max_sessions));
        }

        let store = Arc::new(SessionStore::new(
            session_id,
            self.config.storage.vector_dim,
            self.config.session.default_ttl_ms,
            self.config.session.default_idle_ttl_ms,
            self.config.quotas,
        ));
        store.touch();
        sessions.insert(session_id.to_string(), store.clone());
        info!(session_id, "session created");
        Ok(store)
    }

    /// Read path: never creates. An expired hit is reaped and surfaces as
    /// `SessionExpired`.
    pub async fn get(&self, session_id: &str) -> Result<Arc<SessionStore>, EngineError> {
        if session_id.is_empty() {
            return Err(EngineError::SessionRequired);
        }

        {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                None => return Err(EngineError::SessionNotFound(session_id.to_string())),
                Some(store) if !store.is_expired() => {
                    store.touch();
                    return Ok(store.clone());
                }
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(store) = sessions.get(session_id) {
            if !store.is_expired() {
                store.touch();
                return Ok(store.clone());
            }
            sessions.remove(session_id);
        }
        Err(EngineError::SessionExpired(session_id.to_string()))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        if session_id.is_empty() {
            return Err(EngineError::SessionRequired);
        }
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|_| info!(session_id, "session deleted"))
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let stores: Vec<Arc<SessionStore>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut out = Vec::new();
        for store in stores {
            if store.is_expired() {
                continue;
            }
            out.push(SessionInfo {
                session_id: store.session_id().to_string(),
                created_at: rfc3339(store.created_at_ms()),
                idle_ms: store.idle_ms(),
                ttl_ms: store.ttl_ms(),
                idle_ttl_ms: store.idle_ttl_ms(),
                counters: store.counters().await,
            });
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    // -- cleanup loop -------------------------------------------------------

    /// One sweep: snapshot the expired ids under a read lock, then re-check
    /// and delete each under the write lock (a session may have been touched
    /// between the two).
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, store)| store.is_expired())
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut sessions = self.sessions.write().await;
        for id in expired {
            if sessions.get(&id).map(|s| s.is_expired()).unwrap_or(false) {
                sessions.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleanup reaped expired sessions");
        }
        removed
    }

    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = Duration::from_millis(self.config.session.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.cleanup_expired().await;
            }
        })
    }

    // -- info / health ------------------------------------------------------

    pub async fn info(&self) -> InfoBody {
        let stores: Vec<Arc<SessionStore>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut counters = SessionCounters::default();
        let mut session_count = 0u64;
        for store in stores {
            if store.is_expired() {
                continue;
            }
            session_count += 1;
            counters.add(&store.counters().await);
        }

        InfoBody {
            version: ENGINE_VERSION.to_string(),
            vector_dim: self.config.storage.vector_dim,
            session_count,
            counters,
        }
    }

    pub async fn info_for_session(&self, session_id: &str) -> Result<SessionInfo, EngineError> {
        let store = self.get(session_id).await?;
        Ok(SessionInfo {
            session_id: store.session_id().to_string(),
            created_at: rfc3339(store.created_at_ms()),
            idle_ms: store.idle_ms(),
            ttl_ms: store.ttl_ms(),
            idle_ttl_ms: store.idle_ttl_ms(),
            counters: store.counters().await,
        })
    }

    pub async fn health(&self) -> HealthBody {
        let backup = self.backup.lock().await;
        let metrics = self.metrics.snapshot();

        let mut components = HashMap::new();
        components.insert("sessions".to_string(), "ok".to_string());
        components.insert(
            "query_log".to_string(),
            format!("{} entries", self.query_log.len()),
        );
        components.insert(
            "backup".to_string(),
            if backup.in_progress {
                "saving".to_string()
            } else {
                "idle".to_string()
            },
        );
        components.insert(
            "queries".to_string(),
            format!(
                "{} total, p99 {}us",
                metrics.total_queries, metrics.p99_us
            ),
        );

        HealthBody {
            status: "ok".to_string(),
            components,
        }
    }

    // -- query / explain ----------------------------------------------------

    pub async fn query(
        &self,
        session_id: &str,
        spec: &QuerySpec,
    ) -> Result<ContextPack, EngineError> {
        let store = self.get(session_id).await?;
        let query_id = self.query_ids.fetch_add(1, Ordering::SeqCst) + 1;

        let result = run_query(&store, spec, query_id).await;
        match result {
            Ok(outcome) => {
                self.metrics
                    .record_query(outcome.pack.stats.duration_micros, true);
                self.query_log.insert(outcome.log);
                Ok(outcome.pack)
            }
            Err(err) => {
                self.metrics.record_query(0, false);
                Err(err.into())
            }
        }
    }

    pub fn explain(&self, query_id: u64) -> Result<ExplainBody, EngineError> {
        self.query_log
            .explain(query_id)
            .ok_or(EngineError::QueryNotFound(query_id))
    }

    // -- community detection ------------------------------------------------

    pub async fn compute_communities(
        &self,
        session_id: &str,
        overrides: Option<&LeidenOverrides>,
    ) -> Result<u64, EngineError> {
        let store = self.get_or_create(session_id).await?;
        let params = SessionStore::leiden_params(&self.config.leiden, overrides);
        Ok(store.compute_communities(&params).await?)
    }

    pub async fn compute_hierarchy(
        &self,
        session_id: &str,
        overrides: Option<&LeidenOverrides>,
    ) -> Result<(Vec<LeidenLevel>, u64), EngineError> {
        let store = self.get_or_create(session_id).await?;
        let params = SessionStore::leiden_params(&self.config.leiden, overrides);
        Ok(store.compute_hierarchy(&params).await?)
    }

    // -- snapshot / restore -------------------------------------------------

    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let stores: Vec<Arc<SessionStore>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut records = Vec::with_capacity(stores.len());
        for store in stores {
            if store.is_expired() {
                continue;
            }
            records.push(store.export_record().await);
        }
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        let snapshot = EngineSnapshotRecord {
            format_version: SNAPSHOT_FORMAT_VERSION,
            vector_dim: self.config.storage.vector_dim as u32,
            sessions: records,
        };
        Ok(encode_snapshot(&snapshot)?)
    }

    /// Rebuilds the whole session map from the snapshot, then swaps it in
    /// atomically. Any failure leaves the current state untouched.
    pub async fn restore_bytes(&self, data: &[u8]) -> Result<(), EngineError> {
        let snapshot = decode_snapshot(data)?;
        if snapshot.vector_dim as usize != self.config.storage.vector_dim {
            return Err(EngineError::SnapshotDimension {
                expected: self.config.storage.vector_dim,
                got: snapshot.vector_dim as usize,
            });
        }

        let mut restored: HashMap<String, Arc<SessionStore>> = HashMap::new();
        for record in snapshot.sessions {
            let session_id = record.session_id.clone();
            let store = SessionStore::from_record(
                record,
                self.config.storage.vector_dim,
                self.config.quotas,
            )
            .await?;
            restored.insert(session_id, Arc::new(store));
        }

        let count = restored.len();
        *self.sessions.write().await = restored;
        info!(sessions = count, "engine state restored from snapshot");
        Ok(())
    }

    pub async fn save(&self) -> Result<PathBuf, EngineError> {
        {
            let mut backup = self.backup.lock().await;
            if backup.in_progress {
                return Err(EngineError::BackupBusy);
            }
            backup.in_progress = true;
        }

        let result = async {
            let data = self.snapshot_bytes().await?;
            let stamp = now_epoch_ms();
            Ok::<PathBuf, EngineError>(self.snapshots.create_snapshot(stamp, &data).await?)
        }
        .await;

        let mut backup = self.backup.lock().await;
        backup.in_progress = false;
        match &result {
            Ok(path) => {
                backup.last_save_ms = Some(now_epoch_ms());
                backup.last_error = None;
                info!(path = %path.display(), "snapshot saved");
            }
            Err(err) => {
                backup.last_error = Some(err.to_string());
                error!(%err, "snapshot save failed");
            }
        }
        result
    }

    /// Kick off a save in the background; completion lands in BackupStatus.
    pub fn spawn_save(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.save().await {
                warn!(%err, "background save failed");
            }
        })
    }

    pub async fn restore_latest(&self) -> Result<(), EngineError> {
        let (_, path) = self
            .snapshots
            .latest_snapshot()
            .await?
            .ok_or(EngineError::NoSnapshot)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(StoreError::from)?;
        self.restore_bytes(&data).await
    }

    pub fn spawn_restore(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.restore_latest().await {
                warn!(%err, "background restore failed");
            }
        })
    }

    pub async fn last_save(&self) -> Option<String> {
        self.backup.lock().await.last_save_ms.map(rfc3339)
    }

    pub async fn backup_status(&self) -> (bool, Option<String>, Option<String>) {
        let backup = self.backup.lock().await;
        (
            backup.in_progress,
            backup.last_save_ms.map(rfc3339),
            backup.last_error.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhizome_core::protocol::{EntitySpec, SearchKind};

    fn test_config(dim: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.vector_dim = dim;
        config.session.default_ttl_ms = 0;
        config.session.default_idle_ttl_ms = 0;
        config
    }

    fn entity(external_id: &str, title: &str, embedding: Vec<f32>) -> EntitySpec {
        EntitySpec {
            external_id: external_id.to_string(),
            title: title.to_string(),
            entity_type: String::new(),
            description: String::new(),
            embedding,
        }
    }

    #[tokio::test]
    async fn read_path_never_creates_sessions() {
        let engine = Engine::new(test_config(4));
        assert!(matches!(
            engine.get("missing").await,
            Err(EngineError::SessionNotFound(_))
        ));
        engine.get_or_create("s1").await.unwrap();
        assert!(engine.get("s1").await.is_ok());
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let engine = Engine::new(test_config(4));
        assert!(matches!(
            engine.get_or_create("").await,
            Err(EngineError::SessionRequired)
        ));
    }

    #[tokio::test]
    async fn max_sessions_caps_the_map() {
        let mut config = test_config(4);
        config.session.max_sessions = 1;
        let engine = Engine::new(config);
        engine.get_or_create("s1").await.unwrap();
        assert!(matches!(
            engine.get_or_create("s2").await,
            Err(EngineError::MaxSessions(1))
        ));
    }

    #[tokio::test]
    async fn expired_sessions_surface_and_are_reaped() {
        let mut config = test_config(4);
        config.session.default_idle_ttl_ms = 50;
        let engine = Engine::new(config);

        let store = engine.get_or_create("s1").await.unwrap();
        store
            .add_entity(entity("e1", "A", vec![]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            engine.get("s1").await,
            Err(EngineError::SessionExpired(_))
        ));
        // The reap happened; a second read reports NotFound.
        assert!(matches!(
            engine.get("s1").await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_sweep_removes_expired_sessions() {
        let mut config = test_config(4);
        config.session.default_idle_ttl_ms = 50;
        let engine = Engine::new(config);
        engine.get_or_create("s1").await.unwrap();
        engine.get_or_create("s2").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.cleanup_expired().await, 2);
        assert_eq!(engine.info().await.session_count, 0);
    }

    #[tokio::test]
    async fn info_aggregates_across_sessions() {
        let engine = Engine::new(test_config(4));
        let s1 = engine.get_or_create("s1").await.unwrap();
        let s2 = engine.get_or_create("s2").await.unwrap();
        s1.add_entity(entity("e1", "A", vec![])).await.unwrap();
        s2.add_entity(entity("e1", "B", vec![])).await.unwrap();

        let info = engine.info().await;
        assert_eq!(info.session_count, 2);
        assert_eq!(info.counters.entities, 2);
        assert_eq!(info.vector_dim, 4);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips_and_checks_dimension() {
        let engine = Engine::new(test_config(4));
        let store = engine.get_or_create("s1").await.unwrap();
        store
            .add_entity(entity("e1", "Bank Indonesia", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        let data = engine.snapshot_bytes().await.unwrap();

        let other = Engine::new(test_config(4));
        other.restore_bytes(&data).await.unwrap();
        let info = other.info().await;
        assert_eq!(info.session_count, 1);
        assert_eq!(info.counters.entities, 1);

        let restored = other.get("s1").await.unwrap();
        let entity = restored.get_entity_by_title("bank indonesia").await.unwrap();
        assert_eq!(entity.external_id, "e1");

        let mismatched = Engine::new(test_config(8));
        assert!(matches!(
            mismatched.restore_bytes(&data).await,
            Err(EngineError::SnapshotDimension { expected: 8, got: 4 })
        ));
        // A failed restore leaves the engine untouched.
        assert_eq!(mismatched.info().await.session_count, 0);
    }

    #[tokio::test]
    async fn query_ids_are_engine_global_and_explainable() {
        let engine = Engine::new(test_config(4));
        let store = engine.get_or_create("s1").await.unwrap();
        store
            .add_entity(entity("e1", "A", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        let spec = QuerySpec {
            query_vector: vec![1.0, 0.0, 0.0, 0.0],
            search_types: vec![SearchKind::Entity],
            top_k: 1,
            k_hops: 0,
            max_textunits: 10,
            max_entities: 10,
            max_communities: 10,
            deadline_ms: 0,
        };
        let first = engine.query("s1", &spec).await.unwrap();
        let second = engine.query("s1", &spec).await.unwrap();
        assert_eq!(first.query_id, 1);
        assert_eq!(second.query_id, 2);

        let explain = engine.explain(1).unwrap();
        assert_eq!(explain.seeds.len(), 1);
        assert!(matches!(
            engine.explain(99),
            Err(EngineError::QueryNotFound(99))
        ));
    }
}
