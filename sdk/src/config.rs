use rhizome_core::config::DEFAULT_MAX_FRAME_SIZE;

#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub enabled: bool,
    /// Accept any server certificate. Only for self-signed test deployments.
    pub skip_verify: bool,
    /// Extra trust root (PEM). Platform roots are used when absent.
    pub ca_path: Option<String>,
    /// SNI name; defaults to the host part of `address`.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    /// Sent as the first command on every new connection when set.
    pub api_key: Option<String>,
    pub max_connections: usize,
    /// Write deadline and acquire deadline; reads allow twice this.
    pub conn_timeout_ms: u64,
    /// Idle connections older than this are not reused.
    pub idle_timeout_ms: u64,
    /// Transport-failure retries for retry-safe commands.
    pub max_retries: usize,
    pub max_frame_size: usize,
    pub tls: ClientTlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7687".to_string(),
            api_key: None,
            max_connections: 8,
            conn_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            max_retries: 2,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tls: ClientTlsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}
