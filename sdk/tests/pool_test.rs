//! Pool behavior against a minimal framed mock server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rhizome_core::auth::Permission;
use rhizome_core::protocol::{
    decode_frame_header, encode_frame, Command, RequestEnvelope, Response, ResponseEnvelope,
    FRAME_HEADER_LEN,
};
use rhizome_sdk::{Client, ClientConfig, ClientError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const MAX_FRAME: usize = 1024 * 1024;

/// Answer every command with Pong (or an auth verdict) after an optional
/// delay; counts accepted connections.
async fn spawn_mock(
    response_delay: Duration,
    accept_key: Option<&'static str>,
) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; FRAME_HEADER_LEN];
                    if stream.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let len = decode_frame_header(&header, MAX_FRAME).unwrap();
                    let mut payload = vec![0u8; len];
                    if stream.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    let request = RequestEnvelope::from_payload(&payload).unwrap();

                    tokio::time::sleep(response_delay).await;

                    let body = match &request.command {
                        Command::Auth { api_key } => match accept_key {
                            Some(expected) if api_key == expected => Response::AuthResponse {
                                success: true,
                                message: "authenticated".into(),
                                permissions: vec![Permission::Read, Permission::Write],
                            },
                            _ => Response::AuthResponse {
                                success: false,
                                message: "unknown api key".into(),
                                permissions: vec![],
                            },
                        },
                        _ => Response::Pong,
                    };
                    let response = ResponseEnvelope::new(request.request_id, "", body);
                    let frame =
                        encode_frame(&response.to_payload().unwrap(), MAX_FRAME).unwrap();
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, accepted)
}

fn config_for(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        address: addr.to_string(),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let (addr, accepted) = spawn_mock(Duration::ZERO, None).await;
    let client = Client::new(config_for(addr));

    for _ in 0..5 {
        client.ping().await.unwrap();
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pool_exhaustion_fails_after_the_acquire_deadline() {
    let (addr, _) = spawn_mock(Duration::from_millis(500), None).await;
    let client = Arc::new(Client::new(ClientConfig {
        max_connections: 1,
        conn_timeout_ms: 300,
        ..config_for(addr)
    }));

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.ping().await })
    };
    // Let the first request claim the only slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::Exhausted));

    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_idle_connections_are_replaced() {
    let (addr, accepted) = spawn_mock(Duration::ZERO, None).await;
    let client = Client::new(ClientConfig {
        idle_timeout_ms: 50,
        ..config_for(addr)
    });

    client.ping().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.ping().await.unwrap();

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn auth_handshake_runs_on_every_new_connection() {
    let (addr, _) = spawn_mock(Duration::ZERO, Some("s3cret")).await;

    let good = Client::new(ClientConfig {
        api_key: Some("s3cret".to_string()),
        ..config_for(addr)
    });
    good.ping().await.unwrap();

    let bad = Client::new(ClientConfig {
        api_key: Some("wrong".to_string()),
        ..config_for(addr)
    });
    assert!(matches!(
        bad.ping().await.unwrap_err(),
        ClientError::AuthFailed(_)
    ));
}

#[tokio::test]
async fn oversized_requests_fail_client_side() {
    let (addr, _) = spawn_mock(Duration::ZERO, None).await;
    let client = Client::new(ClientConfig {
        max_frame_size: 64,
        ..config_for(addr)
    });

    let err = client
        .add_document("s1", "d1", "x".repeat(1024))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol(rhizome_core::protocol::ProtocolError::FrameTooLarge { .. })
    ));
}
