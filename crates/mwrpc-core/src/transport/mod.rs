//! Physical connection to the backend.
//!
//! A [`Connector`] opens one [`Connection`], which is split into a
//! [`FrameSink`] (owned by the writer task) and a [`FrameSource`] (owned by the
//! read loop). Frames are opaque byte payloads here; the envelope codec sits
//! above this layer.
//!
//! Two wire transports are provided and selected by URL scheme:
//!
//! - `ws://` / `wss://`: WebSocket, one JSON document per text frame
//! - `tcp://host:port`: 4-byte big-endian length prefix + JSON payload

pub mod framed;
pub mod websocket;

use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Outgoing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Incoming half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive one frame. Returns `None` on clean close by the peer.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// An open connection, split into its two halves.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self { sink, source }
    }
}

/// Opens new connections to one backend.
///
/// The session manager calls [`Connector::open`] for the initial connect and
/// for every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Connection>;

    /// Human-readable target, for logs and errors.
    fn address(&self) -> String;
}

/// Which wire transport an endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Tcp,
}

/// Parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    kind: TransportKind,
}

impl Endpoint {
    /// Parse and validate an endpoint URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |message: String| RpcError::InvalidEndpoint {
            url: raw.to_string(),
            message,
        };

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        let kind = match url.scheme() {
            "ws" | "wss" => TransportKind::WebSocket,
            "tcp" => TransportKind::Tcp,
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        if kind == TransportKind::Tcp && url.port().is_none() {
            return Err(invalid("tcp endpoints need an explicit port".to_string()));
        }

        Ok(Self { url, kind })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` for TCP dialing.
    fn authority(&self) -> String {
        format!(
            "{}:{}",
            self.url.host_str().unwrap_or_default(),
            self.url.port_or_known_default().unwrap_or_default()
        )
    }
}

/// Connector for a URL endpoint, dialing with a timeout.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    endpoint: Endpoint,
    connect_timeout: Duration,
    max_message_size: usize,
}

impl DefaultConnector {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            endpoint,
            connect_timeout,
            max_message_size,
        }
    }

    async fn dial(&self) -> Result<Connection> {
        match self.endpoint.kind {
            TransportKind::Tcp => {
                let stream = tokio::net::TcpStream::connect(self.endpoint.authority()).await?;
                stream.set_nodelay(true)?;
                Ok(framed::connection(stream, self.max_message_size))
            }
            TransportKind::WebSocket => {
                websocket::dial(self.endpoint.url(), self.max_message_size).await
            }
        }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self) -> Result<Connection> {
        let address = self.address();
        debug!("Dialing {}", address);

        match tokio::time::timeout(self.connect_timeout, self.dial()).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(RpcError::Dial {
                address,
                message: e.to_string(),
            }),
            Err(_) => Err(RpcError::Dial {
                address,
                message: format!("timed out after {:?}", self.connect_timeout),
            }),
        }
    }

    fn address(&self) -> String {
        self.endpoint.url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_schemes() {
        let ws = Endpoint::parse("wss://nas.local/api/current").unwrap();
        assert_eq!(ws.kind(), TransportKind::WebSocket);

        let tcp = Endpoint::parse("tcp://127.0.0.1:6000").unwrap();
        assert_eq!(tcp.kind(), TransportKind::Tcp);
        assert_eq!(tcp.authority(), "127.0.0.1:6000");
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        for raw in ["http://nas.local", "tcp://127.0.0.1", "not a url"] {
            assert!(
                matches!(Endpoint::parse(raw), Err(RpcError::InvalidEndpoint { .. })),
                "{} should be rejected",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_dial_refused_is_a_dial_error() {
        // Bind then drop so the port is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let connector = DefaultConnector::new(endpoint, Duration::from_secs(2), 1024);

        match connector.open().await {
            Err(RpcError::Dial { address, .. }) => assert!(address.contains(&port.to_string())),
            Err(other) => panic!("Expected Dial, got: {:?}", other),
            Ok(_) => panic!("Expected Dial error, got a connection"),
        }
    }
}
