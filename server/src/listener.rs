//! TCP (optionally TLS) accept loop feeding per-connection handler tasks.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use rhizome_core::auth::ApiKeyAuthenticator;
use rhizome_core::config::AppConfig;

use crate::engine::Engine;
use crate::handler::{serve_connection, ConnLimits};
use crate::tls;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub struct Server {
    config: AppConfig,
    engine: Arc<Engine>,
    auth: Arc<ApiKeyAuthenticator>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let tls = if config.server.tls.enabled {
            Some(tls::load_acceptor(
                &config.server.tls.cert_path,
                &config.server.tls.key_path,
            )?)
        } else {
            None
        };

        let engine = Arc::new(Engine::new(config.clone()));
        let auth = Arc::new(ApiKeyAuthenticator::new(&config.auth.keys));

        Ok(Self {
            config,
            engine,
            auth,
            tls,
        })
    }

    /// The engine handle, mainly for embedding and tests.
    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.server.listen_address).await?;
        info!(
            address = %listener.local_addr()?,
            tls = self.tls.is_some(),
            auth = self.auth.required(),
            "rhizome listening"
        );
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind an ephemeral
    /// port themselves).
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let _cleanup = self.engine.spawn_cleanup();
        let limits = ConnLimits {
            max_frame_size: self.config.server.max_frame_size,
            conn_timeout: Duration::from_millis(self.config.server.conn_timeout_ms.max(1)),
        };

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let engine = self.engine.clone();
            let auth = self.auth.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            serve_connection(tls_stream, engine, auth, limits).await
                        }
                        Err(err) => warn!(%peer, %err, "tls handshake failed"),
                    },
                    None => serve_connection(stream, engine, auth, limits).await,
                }
            });
        }
    }
}
