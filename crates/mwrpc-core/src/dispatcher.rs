//! Call dispatcher: request/response correlation over the live link.
//!
//! The dispatcher owns the only state shared between callers and the read
//! loop: the connection state, the current link (writer channel + task
//! handles), and the pending-call table. All three sit behind one mutex, so a
//! response can never be matched to a call that a concurrent cancellation or
//! teardown is removing. Each pending slot is a `oneshot` sender and whoever
//! removes the entry from the table is the only party that may fulfil it.
//!
//! # Thread Safety
//!
//! The registry lock is a `std::sync::Mutex` and is never held across an
//! `.await`; frames are handed to the writer task through an unbounded channel
//! while the lock is held, so registration and enqueueing are atomic with
//! respect to teardown.

use crate::config::TimeoutConfig;
use crate::context::Context;
use crate::envelope::{Envelope, Notification, MSG_PING, MSG_PONG};
use crate::error::{Result, RpcError};
use crate::read_loop;
use crate::transport::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Correlation ids are unique across every client in the process.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Authenticating,
    Ready,
    /// Terminal: entered on explicit close and never left.
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which states a call may be issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Ordinary calls: only a Ready session.
    Ready,
    /// Login calls made by the session manager while Authenticating.
    Session,
}

struct PendingCall {
    method: String,
    created: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

/// Handle to one physical connection's background tasks.
struct Link {
    generation: u64,
    session_id: String,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Stop the reader now; let the writer close the transport gracefully, but
    /// not for longer than the transport close timeout.
    fn shutdown(self) {
        self.reader.abort();
        drop(self.frames);
        let mut writer = self.writer;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let graceful =
                        tokio::time::timeout(TimeoutConfig::TRANSPORT_CLOSE_TIMEOUT, &mut writer)
                            .await;
                    if graceful.is_err() {
                        writer.abort();
                    }
                });
            }
            Err(_) => writer.abort(),
        }
    }
}

struct Registry {
    state: ConnectionState,
    generation: u64,
    link: Option<Link>,
    pending: HashMap<String, PendingCall>,
}

/// Issues calls and matches responses to their callers.
pub struct Dispatcher {
    registry: Mutex<Registry>,
    state_tx: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Notification>,
    dropped: Notify,
}

/// Removes a pending entry if the waiting future is dropped mid-call.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.dispatcher.forget(self.id).is_some() {
            debug!("Call {} abandoned by its caller", self.id);
        }
    }
}

impl Dispatcher {
    pub fn new(notification_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            registry: Mutex::new(Registry {
                state: ConnectionState::Disconnected,
                generation: 0,
                link: None,
                pending: HashMap::new(),
            }),
            state_tx,
            notifications,
            dropped: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().link.as_ref().map(|link| link.session_id.clone())
    }

    pub fn pending_calls(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn transition(&self, reg: &mut Registry, next: ConnectionState) {
        if reg.state == next || reg.state == ConnectionState::Closing {
            return;
        }
        debug!("Connection state {} -> {}", reg.state, next);
        reg.state = next;
        self.state_tx.send_replace(next);
    }

    /// Mark the start of a connect attempt.
    pub(crate) fn begin_attempt(&self) -> Result<()> {
        let mut reg = self.lock();
        if reg.state == ConnectionState::Closing {
            return Err(RpcError::Closed);
        }
        self.transition(&mut reg, ConnectionState::Handshaking);
        Ok(())
    }

    /// Roll back a failed connect attempt.
    pub(crate) fn abandon_attempt(&self, reason: &str) {
        let mut reg = self.lock();
        let link = reg.link.take();
        let pending = std::mem::take(&mut reg.pending);
        self.transition(&mut reg, ConnectionState::Disconnected);
        drop(reg);

        if let Some(link) = link {
            link.shutdown();
        }
        fail_all(pending, || RpcError::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    /// Install a freshly handshaken connection and start its reader and writer.
    ///
    /// Returns the link generation, used to ignore stale teardown signals from
    /// an older connection.
    pub(crate) fn attach(
        self: &Arc<Self>,
        connection: Connection,
        session_id: String,
        authenticate: bool,
    ) -> Result<u64> {
        let mut reg = self.lock();
        if reg.state == ConnectionState::Closing {
            return Err(RpcError::Closed);
        }
        if let Some(stale) = reg.link.take() {
            stale.shutdown();
        }

        reg.generation += 1;
        let generation = reg.generation;
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let Connection { sink, source } = connection;

        // Spawned under the lock: neither task can touch the registry until
        // the link below is installed.
        let writer = tokio::spawn(read_loop::write_frames(
            sink,
            frames_rx,
            Arc::clone(self),
            generation,
        ));
        let reader = tokio::spawn(read_loop::read_frames(source, Arc::clone(self), generation));

        reg.link = Some(Link {
            generation,
            session_id,
            frames,
            reader,
            writer,
        });
        let next = if authenticate {
            ConnectionState::Authenticating
        } else {
            ConnectionState::Ready
        };
        self.transition(&mut reg, next);
        Ok(generation)
    }

    /// Promote an authenticated link to Ready.
    pub(crate) fn mark_ready(&self, generation: u64) -> Result<()> {
        let mut reg = self.lock();
        if reg.state == ConnectionState::Closing {
            return Err(RpcError::Closed);
        }
        match &reg.link {
            Some(link) if link.generation == generation => {
                self.transition(&mut reg, ConnectionState::Ready);
                Ok(())
            }
            _ => Err(RpcError::ConnectionLost {
                reason: "connection dropped during authentication".to_string(),
            }),
        }
    }

    /// Issue a call and wait for its response, a context finish, or teardown.
    pub async fn call(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        self.dispatch(ctx, method, params, Admission::Ready).await
    }

    pub(crate) async fn call_in_session(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value> {
        self.dispatch(ctx, method, params, Admission::Session).await
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
        admission: Admission,
    ) -> Result<Value> {
        ctx.check()?;

        let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = Envelope::request(id.as_str(), method, params).encode()?;
        let mut slot = self.register(&id, method, frame, admission)?;
        let mut guard = PendingGuard {
            dispatcher: self,
            id: &id,
            armed: true,
        };

        tokio::select! {
            biased;
            delivered = &mut slot => {
                guard.armed = false;
                delivered.unwrap_or_else(|_| {
                    Err(RpcError::ConnectionLost {
                        reason: "call slot dropped without a response".to_string(),
                    })
                })
            }
            reason = ctx.done() => {
                guard.armed = false;
                if self.forget(&id).is_some() {
                    debug!("Call {} ({}) finished locally: {}", id, method, reason);
                    Err(reason.into())
                } else {
                    // The read loop removed the entry first, so its delivery
                    // owns the slot.
                    slot.try_recv().unwrap_or_else(|_| Err(reason.into()))
                }
            }
        }
    }

    fn register(
        &self,
        id: &str,
        method: &str,
        frame: Vec<u8>,
        admission: Admission,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut reg = self.lock();

        {
            let admitted = match (reg.state, admission) {
                (ConnectionState::Ready, _)
                | (ConnectionState::Authenticating, Admission::Session) => true,
                (ConnectionState::Closing, _) => return Err(RpcError::Closed),
                _ => false,
            };
            let link = reg
                .link
                .as_ref()
                .filter(|_| admitted)
                .ok_or(RpcError::NotConnected)?;
            link.frames
                .send(frame)
                .map_err(|_| RpcError::ConnectionLost {
                    reason: "writer task has stopped".to_string(),
                })?;
        }

        let (slot, receiver) = oneshot::channel();
        reg.pending.insert(
            id.to_string(),
            PendingCall {
                method: method.to_string(),
                created: Instant::now(),
                slot,
            },
        );
        Ok(receiver)
    }

    fn forget(&self, id: &str) -> Option<PendingCall> {
        self.lock().pending.remove(id)
    }

    /// Route one decoded inbound frame.
    pub(crate) fn route(&self, generation: u64, envelope: Envelope) {
        if envelope.is_response() {
            let Some(id) = envelope.id.clone() else {
                debug!("Dropping response without a correlation id");
                return;
            };
            let pending = self.forget(&id);
            match pending {
                Some(call) => {
                    debug!(
                        "Call {} ({}) answered after {:?}",
                        id,
                        call.method,
                        call.created.elapsed()
                    );
                    // The caller may have just given up; nothing else to do.
                    let _ = call.slot.send(envelope.into_outcome());
                }
                None => debug!("Dropping response for unknown or abandoned call {}", id),
            }
            return;
        }

        if envelope.msg.as_deref() == Some(MSG_PING) {
            let pong = Envelope {
                msg: Some(MSG_PONG.to_string()),
                id: envelope.id,
                ..Envelope::default()
            };
            if let Ok(frame) = pong.encode() {
                self.send_frame(generation, frame);
            }
            return;
        }

        // No subscribers is fine; events are advisory.
        let _ = self.notifications.send(Notification::from(envelope));
    }

    fn send_frame(&self, generation: u64, frame: Vec<u8>) {
        let reg = self.lock();
        if let Some(link) = reg.link.as_ref().filter(|l| l.generation == generation) {
            let _ = link.frames.send(frame);
        }
    }

    /// Tear down the link of `generation` after a read or write failure.
    ///
    /// Fails every pending call with `ConnectionLost`. Wakes the reconnector if
    /// the session was Ready. Returns false for stale generations.
    pub(crate) fn connection_lost(&self, generation: u64, reason: &str) -> bool {
        let mut reg = self.lock();
        if reg.link.as_ref().map(|l| l.generation) != Some(generation) {
            return false;
        }
        let link = reg.link.take();
        let was_ready = reg.state == ConnectionState::Ready;
        let pending = std::mem::take(&mut reg.pending);
        self.transition(&mut reg, ConnectionState::Disconnected);
        drop(reg);

        if let Some(link) = link {
            link.shutdown();
        }
        if !pending.is_empty() {
            info!("Failing {} pending calls: connection lost", pending.len());
        }
        fail_all(pending, || RpcError::ConnectionLost {
            reason: reason.to_string(),
        });

        if was_ready {
            warn!("Connection lost: {}", reason);
            self.dropped.notify_one();
        }
        true
    }

    /// Generation of the current link, if the session is Ready.
    pub(crate) fn ready_generation(&self) -> Option<u64> {
        let reg = self.lock();
        match (reg.state, reg.link.as_ref()) {
            (ConnectionState::Ready, Some(link)) => Some(link.generation),
            _ => None,
        }
    }

    /// Wait until a Ready link is lost.
    pub(crate) async fn connection_dropped(&self) {
        self.dropped.notified().await
    }

    /// Enter the terminal Closing state, drop the link and fail every pending
    /// call. Never blocks on the network.
    pub fn close(&self) {
        let mut reg = self.lock();
        self.transition(&mut reg, ConnectionState::Closing);
        let link = reg.link.take();
        let pending = std::mem::take(&mut reg.pending);
        drop(reg);

        if let Some(link) = link {
            link.shutdown();
        }
        fail_all(pending, || RpcError::Closed);
    }
}

fn fail_all(pending: HashMap<String, PendingCall>, error: impl Fn() -> RpcError) {
    for (_, call) in pending {
        let _ = call.slot.send(Err(error()));
    }
}
