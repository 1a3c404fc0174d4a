use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::KeepAliveConfig;
use crate::error::{Error, Result};
use crate::session::datagram::DatagramSession;
use crate::session::streaming::StreamingSession;

/// A session that can be probed for liveness: 7.02 Ping / 7.03 Pong on
/// streaming connections, an empty confirmable (ACK and Reset both count) on
/// datagram sessions.
#[async_trait]
pub trait Pingable: Send + Sync {
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;
    async fn close(&self);
    fn closed_token(&self) -> CancellationToken;
}

#[async_trait]
impl Pingable for DatagramSession {
    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        DatagramSession::ping(self, cancel).await
    }

    async fn close(&self) {
        DatagramSession::close(self).await
    }

    fn closed_token(&self) -> CancellationToken {
        DatagramSession::closed_token(self)
    }
}

#[async_trait]
impl Pingable for StreamingSession {
    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        StreamingSession::ping(self, cancel).await
    }

    async fn close(&self) {
        StreamingSession::close(self).await
    }

    fn closed_token(&self) -> CancellationToken {
        StreamingSession::closed_token(self)
    }
}

/// Periodic liveness probing; closes the session after the configured number
/// of consecutive failures. Does nothing when no interval is configured.
pub fn spawn_keepalive(config: KeepAliveConfig, session: Arc<dyn Pingable>) {
    let Some(interval) = config.interval else {
        return;
    };

    tokio::spawn(async move {
        let shutdown = session.closed_token();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(interval) => {}
            }

            let cancel = CancellationToken::new();
            let ping = session.ping(&cancel);
            tokio::pin!(ping);
            let result = tokio::select! {
                result = &mut ping => result,
                _ = sleep(config.timeout) => {
                    // cancel so the session cleans up its waiter, then let
                    // the ping observe the cancellation
                    cancel.cancel();
                    ping.await
                }
            };

            match result {
                Ok(()) => failures = 0,
                Err(Error::ConnectionClosed) => return,
                Err(e) => {
                    failures += 1;
                    debug!("keep-alive ping failed ({}/{}): {}", failures, config.max_failures, e);
                    if failures >= config.max_failures {
                        warn!("peer unresponsive, closing session");
                        session.close().await;
                        return;
                    }
                }
            }
        }
    });
}
