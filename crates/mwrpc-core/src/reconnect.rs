//! Reconnection supervisor and keepalive.
//!
//! One supervisor task per client waits for the dispatcher to report that a
//! Ready link was lost, then re-runs the session handshake with backoff. It
//! never resends calls: whatever was in flight already failed with
//! `ConnectionLost`, and calls made while reconnecting fail fast with
//! `NotConnected`.
//!
//! Both tasks watch the client's shutdown context. Closing the client cancels
//! it, which drops any in-progress dial or handshake immediately.

use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::config::ProtocolConfig;
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, RpcError};
use crate::session::SessionManager;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Call `core.ping` and require the literal `"pong"`.
pub(crate) async fn ping(dispatcher: &Dispatcher, ctx: &Context) -> Result<()> {
    match dispatcher.call(ctx, ProtocolConfig::PING_METHOD, vec![]).await? {
        Value::String(s) if s == "pong" => Ok(()),
        other => Err(RpcError::protocol(format!(
            "unexpected ping reply {}",
            other
        ))),
    }
}

pub(crate) struct Reconnector {
    session: Arc<SessionManager>,
    policy: BackoffConfig,
    shutdown: Context,
}

impl Reconnector {
    pub(crate) fn new(session: Arc<SessionManager>, shutdown: Context) -> Self {
        let policy = session.options().reconnect.clone();
        Self {
            session,
            policy,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let dispatcher = Arc::clone(self.session.dispatcher());

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.done() => break,
                _ = dispatcher.connection_dropped() => {}
            }

            info!(
                "Reconnecting (up to {} attempts)",
                self.policy.max_attempts
            );
            let (result, attempts) = retry_with_backoff(
                &self.policy,
                &self.shutdown,
                || self.session.establish(),
                RpcError::is_retryable,
            )
            .await;

            match result {
                Ok(()) => info!("Reconnected after {} attempt(s)", attempts),
                Err(RpcError::Cancelled) | Err(RpcError::Closed) => break,
                Err(e) => {
                    error!(
                        "Giving up reconnecting after {} attempt(s): {}",
                        attempts, e
                    );
                    break;
                }
            }
        }

        debug!("Reconnector stopped");
    }
}

/// Ping while Ready. A ping that outlives its interval tears down the link it
/// was sent on, so the normal connection-lost path (and the reconnector)
/// takes over.
pub(crate) fn spawn_keepalive(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    shutdown: Context,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.done() => break,
                _ = ticker.tick() => {}
            }
            let Some(generation) = dispatcher.ready_generation() else {
                continue;
            };

            let ctx = shutdown.with_timeout(interval);
            match ping(&dispatcher, &ctx).await {
                Ok(()) => debug!("Keepalive ok"),
                Err(RpcError::DeadlineExceeded) => {
                    warn!("Keepalive ping got no reply within {:?}", interval);
                    // Only the link the ping went out on; a newer one stays up.
                    if !dispatcher.connection_lost(generation, "keepalive ping timed out") {
                        debug!("Link {} already replaced", generation);
                    }
                }
                Err(RpcError::Cancelled) | Err(RpcError::Closed) => break,
                Err(e) => debug!("Keepalive ping failed: {}", e),
            }
        }
    })
}
