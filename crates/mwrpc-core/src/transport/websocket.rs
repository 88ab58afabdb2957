//! WebSocket transport (tokio-tungstenite).
//!
//! Each envelope travels as one text frame. Binary frames are accepted on
//! receive for servers that send them; control frames are skipped.

use super::{Connection, FrameSink, FrameSource};
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use url::Url;

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> RpcError {
    RpcError::Transport {
        message: err.to_string(),
        source: None,
    }
}

pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let text = String::from_utf8(frame)
            .map_err(|_| RpcError::protocol("outgoing frame is not valid UTF-8"))?;
        self.inner.send(Message::text(text)).await.map_err(ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await.map_err(ws_error)
    }
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().as_bytes().to_vec())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite on the next write.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }
}

/// Wrap an established WebSocket stream (client or server side).
pub fn connection<S>(stream: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    Connection::new(
        Box::new(WsSink { inner: sink }),
        Box::new(WsSource { inner: source }),
    )
}

/// Open a client WebSocket to `url`, refusing inbound messages larger than
/// `max_message_size`.
pub async fn dial(url: &Url, max_message_size: usize) -> Result<Connection> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);

    let (stream, _response) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(config), false)
            .await
            .map_err(ws_error)?;
    Ok(connection(stream))
}
