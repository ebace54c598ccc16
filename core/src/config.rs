use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::auth::ApiKeyConfig;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub max_frame_size: usize,
    /// Write deadline for a single frame; read deadline is twice this.
    pub conn_timeout_ms: u64,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7687".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            conn_timeout_ms: 5_000,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub vector_dim: usize,
    /// Snapshot directory for Save / BgSave.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            vector_dim: 768,
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub default_ttl_ms: u64,
    pub default_idle_ttl_ms: u64,
    pub max_sessions: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 24 * 60 * 60 * 1_000,
            default_idle_ttl_ms: 60 * 60 * 1_000,
            max_sessions: 10_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Per-session quotas. Zero means unlimited.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(default)]
pub struct QuotaConfig {
    pub entities: u64,
    pub relationships: u64,
    pub textunits: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct LeidenConfig {
    pub resolution: f64,
    pub iterations: usize,
    pub min_delta: f64,
    pub random_seed: u64,
    pub max_levels: usize,
    pub min_community_size: usize,
    pub level_resolution: f64,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            iterations: 20,
            min_delta: 1e-7,
            random_seed: 42,
            max_levels: 3,
            min_community_size: 2,
            level_resolution: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub quotas: QuotaConfig,
    pub leiden: LeidenConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("RHIZOME").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.storage.vector_dim == 0 {
            return Err("storage.vector_dim must be positive".to_string());
        }
        if self.leiden.max_levels == 0 || self.leiden.max_levels > 5 {
            return Err("leiden.max_levels must be in 1..=5".to_string());
        }
        if self.leiden.level_resolution <= 0.0 || self.leiden.level_resolution >= 1.0 {
            return Err("leiden.level_resolution must be in (0, 1)".to_string());
        }
        if self.leiden.min_community_size < 2 {
            return Err("leiden.min_community_size must be at least 2".to_string());
        }
        if self.server.tls.enabled
            && (self.server.tls.cert_path.is_empty() || self.server.tls.key_path.is_empty())
        {
            return Err("tls.cert_path and tls.key_path are required when tls is enabled".into());
        }
        Ok(())
    }
}
