//! A single framed connection: dial, optional TLS, auth handshake, then
//! request/response calls under per-frame deadlines.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use rhizome_core::protocol::{
    decode_frame_header, encode_frame, Command, RequestEnvelope, Response, ResponseEnvelope,
    FRAME_HEADER_LEN,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tls::connect_tls;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) struct Connection {
    stream: Box<dyn AsyncStream>,
    last_used: Instant,
}

impl Connection {
    /// Dial, wrap in TLS when configured, and authenticate when an api key
    /// is present. The returned connection is ready for requests.
    pub(crate) async fn open(config: &ClientConfig) -> Result<Connection, ClientError> {
        let conn_timeout = Duration::from_millis(config.conn_timeout_ms.max(1));
        let stream = timeout(conn_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let stream: Box<dyn AsyncStream> = if config.tls.enabled {
            Box::new(connect_tls(stream, config).await?)
        } else {
            Box::new(stream)
        };

        let mut conn = Connection {
            stream,
            last_used: Instant::now(),
        };

        if let Some(api_key) = &config.api_key {
            let envelope = RequestEnvelope::new(
                0,
                "",
                Command::Auth {
                    api_key: api_key.clone(),
                },
            );
            match conn.call(&envelope, config).await?.body {
                Response::AuthResponse { success: true, .. } => {
                    debug!("connection authenticated");
                }
                Response::AuthResponse { message, .. } => {
                    return Err(ClientError::AuthFailed(message));
                }
                Response::Error(body) => return Err(ClientError::AuthFailed(body.message)),
                other => {
                    return Err(ClientError::Unexpected(format!(
                        "auth handshake answered with {other:?}"
                    )))
                }
            }
        }

        Ok(conn)
    }

    pub(crate) async fn call(
        &mut self,
        envelope: &RequestEnvelope,
        config: &ClientConfig,
    ) -> Result<ResponseEnvelope, ClientError> {
        let write_deadline = Duration::from_millis(config.conn_timeout_ms.max(1));
        let read_deadline = write_deadline * 2;

        let payload = envelope.to_payload()?;
        let frame = encode_frame(&payload, config.max_frame_size)?;

        timeout(write_deadline, async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let response = timeout(read_deadline, async {
            let mut header = [0u8; FRAME_HEADER_LEN];
            self.stream.read_exact(&mut header).await?;
            let len = decode_frame_header(&header, config.max_frame_size)
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            Ok::<Vec<u8>, std::io::Error>(body)
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        self.last_used = Instant::now();
        Ok(ResponseEnvelope::from_payload(&response)?)
    }

    pub(crate) fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
    }
}
