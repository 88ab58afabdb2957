//! In-process mock backend for integration tests.
//!
//! [`serve`] speaks the server side of the protocol over any [`Connection`]:
//! it answers the connect handshake, then handles each call in its own task so
//! slow and hanging methods never block the others. [`MockConnector`] wires a
//! backend to the client over in-memory pipes; [`spawn_tcp_server`] and
//! [`spawn_ws_server`] expose the same backend on real sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use mwrpc::envelope::MSG_METHOD;
use mwrpc::transport::{framed, websocket};
use mwrpc::{Connection, Connector, Envelope, ErrorDescriptor, Result, RpcError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

pub const MAX_FRAME: usize = 1 << 20;

/// How the server answers the connect frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    Accept,
    EmptySession,
    /// Reply `failed`, as on a protocol version mismatch.
    Refuse,
    /// Never reply.
    Silent,
}

/// How the server answers login calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginReply {
    Accept,
    /// Answer with a literal `false`.
    Reject,
    /// Answer with an error response.
    Error,
}

/// Scripted server state shared by every connection to it.
pub struct MockBackend {
    handshake: Mutex<HandshakeMode>,
    login: Mutex<LoginReply>,
    scripts: Mutex<HashMap<String, (i64, Vec<Value>)>>,
    jobs: Mutex<HashMap<i64, (String, VecDeque<Value>)>>,
    logins: Mutex<Vec<(String, Vec<Value>)>>,
    aborted: Mutex<Vec<i64>>,
    sessions: AtomicUsize,
    unanswered_pings: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(HandshakeMode::Accept),
            login: Mutex::new(LoginReply::Accept),
            scripts: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            logins: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
            unanswered_pings: AtomicUsize::new(0),
        })
    }

    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.handshake.lock().unwrap() = mode;
    }

    pub fn set_login(&self, reply: LoginReply) {
        *self.login.lock().unwrap() = reply;
    }

    /// Make `method` submit job `id`. Each poll of the job returns the next
    /// snapshot; the last one repeats.
    pub fn script_job(&self, method: &str, id: i64, snapshots: Vec<Value>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(method.to_string(), (id, snapshots));
    }

    /// Leave the next `n` pings without a reply.
    pub fn ignore_pings(&self, n: usize) {
        self.unanswered_pings.store(n, Ordering::SeqCst);
    }

    /// Login calls received so far, as (method, params).
    pub fn logins(&self) -> Vec<(String, Vec<Value>)> {
        self.logins.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<i64> {
        self.aborted.lock().unwrap().clone()
    }

    /// Number of handshakes accepted.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn connect_reply(&self) -> Option<Value> {
        match *self.handshake.lock().unwrap() {
            HandshakeMode::Accept => {
                let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                Some(json!({"msg": "connected", "session": format!("mock-session-{}", n)}))
            }
            HandshakeMode::EmptySession => Some(json!({"msg": "connected", "session": ""})),
            HandshakeMode::Refuse => Some(json!({"msg": "failed", "version": "2"})),
            HandshakeMode::Silent => None,
        }
    }

    /// Produce the response for one call. `None` means never answer.
    async fn handle(&self, method: &str, params: Vec<Value>) -> Option<std::result::Result<Value, ErrorDescriptor>> {
        match method {
            "auth.login" | "auth.login_with_api_key" => {
                self.logins
                    .lock()
                    .unwrap()
                    .push((method.to_string(), params));
                let reply = *self.login.lock().unwrap();
                Some(match reply {
                    LoginReply::Accept => Ok(json!(true)),
                    LoginReply::Reject => Ok(json!(false)),
                    LoginReply::Error => Err(ErrorDescriptor::new(13, "invalid credentials")
                        .with_kind("EACCES")),
                })
            }
            "core.ping" => {
                let ignored = self
                    .unanswered_pings
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                (!ignored).then(|| Ok(json!("pong")))
            }
            "test.echo" => {
                if let Some(ms) = params.get(1).and_then(Value::as_u64) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Some(Ok(params.into_iter().next().unwrap_or(Value::Null)))
            }
            "test.null" => Some(Ok(Value::Null)),
            "test.fail" => Some(Err(ErrorDescriptor::new(22, "invalid argument")
                .with_reason("[EINVAL] name: must not be empty")
                .with_kind("EINVAL"))),
            "test.hang" => None,
            "core.get_jobs" => Some(Ok(self.query_jobs(&params))),
            "core.job_abort" => {
                let id = params.first().and_then(Value::as_i64).unwrap_or_default();
                self.aborted.lock().unwrap().push(id);
                if let Some((_, snapshots)) = self.jobs.lock().unwrap().get_mut(&id) {
                    snapshots.clear();
                    snapshots.push_back(json!({"state": "ABORTED", "error": null}));
                }
                Some(Ok(Value::Null))
            }
            other => {
                let script = self.scripts.lock().unwrap().get(other).cloned();
                match script {
                    Some((id, snapshots)) => {
                        self.jobs
                            .lock()
                            .unwrap()
                            .insert(id, (other.to_string(), snapshots.into()));
                        Some(Ok(json!(id)))
                    }
                    None => Some(Err(ErrorDescriptor::new(-32601, format!(
                        "method {} not found",
                        other
                    )))),
                }
            }
        }
    }

    /// Answer `core.get_jobs` for a `[["id", "=", id]]` filter.
    fn query_jobs(&self, params: &[Value]) -> Value {
        let Some(id) = params
            .first()
            .and_then(|filters| filters.pointer("/0/2"))
            .and_then(Value::as_i64)
        else {
            return json!([]);
        };

        let mut jobs = self.jobs.lock().unwrap();
        let Some((method, snapshots)) = jobs.get_mut(&id) else {
            return json!([]);
        };
        let snapshot = if snapshots.len() > 1 {
            snapshots.pop_front()
        } else {
            snapshots.front().cloned()
        };

        let mut record = json!({"id": id, "method": method.clone()});
        if let (Some(record), Some(Value::Object(fields))) = (record.as_object_mut(), snapshot) {
            record.extend(fields);
        }
        json!([record])
    }
}

/// Run the server side of one connection until either end goes away.
pub async fn serve(connection: Connection, backend: Arc<MockBackend>) {
    let Connection { mut sink, mut source } = connection;

    match source.recv().await {
        Ok(Some(frame)) => {
            let hello: Value = serde_json::from_slice(&frame).unwrap();
            assert_eq!(hello["msg"], "connect");
        }
        _ => return,
    }
    match backend.connect_reply() {
        Some(reply) => {
            if sink.send(serde_json::to_vec(&reply).unwrap()).await.is_err() {
                return;
            }
        }
        None => {
            // Hold the connection open without answering.
            let _ = source.recv().await;
            return;
        }
    }

    let (responses, mut outbox) = mpsc::unbounded_channel::<Envelope>();
    let mut handlers = JoinSet::new();

    let writer = async move {
        while let Some(envelope) = outbox.recv().await {
            if sink.send(envelope.encode().unwrap()).await.is_err() {
                break;
            }
        }
    };

    let reader = async {
        while let Ok(Some(frame)) = source.recv().await {
            let request = Envelope::decode(&frame).unwrap();
            if request.msg.as_deref() != Some(MSG_METHOD) {
                continue;
            }
            let backend = Arc::clone(&backend);
            let responses = responses.clone();
            handlers.spawn(async move {
                let id = request.id.unwrap_or_default();
                let method = request.method.unwrap_or_default();
                let params = request.params.unwrap_or_default();
                let reply = match backend.handle(&method, params).await {
                    Some(Ok(result)) => Envelope::success(id, result),
                    Some(Err(error)) => Envelope::failure(id, error),
                    None => return std::future::pending().await,
                };
                let _ = responses.send(reply);
            });
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    // Dropping `handlers` aborts calls still in progress.
}

/// What [`MockConnector::open`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    Up,
    /// Fail immediately, like a refused connection.
    Down,
    /// Never complete.
    Hang,
}

/// Connector that serves each connection from a [`MockBackend`] over an
/// in-memory pipe.
pub struct MockConnector {
    backend: Arc<MockBackend>,
    mode: Mutex<DialMode>,
    opens: AtomicUsize,
    links: Mutex<Vec<JoinHandle<()>>>,
}

impl MockConnector {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            mode: Mutex::new(DialMode::Up),
            opens: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: DialMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of dial attempts so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Kill every server-side connection, as if the network dropped.
    pub fn drop_connections(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Connection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            DialMode::Up => {
                let (client, server) = tokio::io::duplex(MAX_FRAME);
                let server = framed::connection(server, MAX_FRAME);
                let link = tokio::spawn(serve(server, Arc::clone(&self.backend)));
                self.links.lock().unwrap().push(link);
                Ok(framed::connection(client, MAX_FRAME))
            }
            DialMode::Down => Err(RpcError::Dial {
                address: self.address(),
                message: "connection refused".to_string(),
            }),
            DialMode::Hang => std::future::pending().await,
        }
    }

    fn address(&self) -> String {
        "mock://backend".to_string()
    }
}

/// Serve `backend` over length-prefixed TCP on an ephemeral local port.
pub async fn spawn_tcp_server(backend: Arc<MockBackend>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let connection = framed::connection(stream, MAX_FRAME);
            tokio::spawn(serve(connection, Arc::clone(&backend)));
        }
    });
    (addr, handle)
}

/// Serve `backend` over WebSocket on an ephemeral local port.
pub async fn spawn_ws_server(backend: Arc<MockBackend>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    serve(websocket::connection(ws), backend).await;
                }
            });
        }
    });
    (addr, handle)
}

/// Poll `condition` until it holds, failing the test after `within`.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            within
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
