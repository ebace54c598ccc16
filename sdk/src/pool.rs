//! Bounded pool of open, authenticated connections with idle cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ClientConfig;
use crate::conn::Connection;
use crate::error::ClientError;

pub(crate) struct ConnectionPool {
    config: ClientConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

struct PoolState {
    idle: Vec<Connection>,
    /// Live connections, idle or checked out.
    total: usize,
}

impl ConnectionPool {
    pub(crate) fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            released: Notify::new(),
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.idle_timeout_ms.max(1))
    }

    /// Reuse a fresh-enough idle connection, dial a new one below the cap,
    /// or wait for a release until the acquire deadline runs out.
    pub(crate) async fn acquire(&self) -> Result<Connection, ClientError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.conn_timeout_ms.max(1));

        loop {
            let open_slot = {
                let mut state = self.state.lock().await;

                // Stale idle connections are dropped, not handed out.
                while let Some(mut conn) = state.idle.pop() {
                    if conn.idle() > self.idle_timeout() {
                        state.total -= 1;
                        continue;
                    }
                    conn.mark_used();
                    return Ok(conn);
                }

                if state.total < self.config.max_connections {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if open_slot {
                match Connection::open(&self.config).await {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        self.state.lock().await.total -= 1;
                        self.released.notify_one();
                        return Err(err);
                    }
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ClientError::Exhausted);
            };
            if timeout(remaining, self.released.notified()).await.is_err() {
                return Err(ClientError::Exhausted);
            }
        }
    }

    pub(crate) async fn release(&self, conn: Connection) {
        self.state.lock().await.idle.push(conn);
        self.released.notify_one();
    }

    /// The connection was already dropped (closed); free its slot.
    pub(crate) async fn discard(&self) {
        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    /// Periodically close connections idle beyond the timeout.
    pub(crate) fn spawn_cleaner(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = self.clone();
        let period = pool.idle_timeout().min(Duration::from_secs(30)).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let mut state = pool.state.lock().await;
                let before = state.idle.len();
                let idle_timeout = pool.idle_timeout();
                state.idle.retain(|conn| conn.idle() <= idle_timeout);
                let closed = before - state.idle.len();
                state.total -= closed;
                if closed > 0 {
                    debug!(closed, "pool cleaner closed idle connections");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.idle.len(), state.total)
    }
}
