//! Duplex transports carrying JSON text frames.
//!
//! Both transports are split into a read half owned by the listener's read
//! task and a write half owned by its write loop.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::client::ClientError;
use super::framing::{read_message, write_message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default RPC path appended to bare server URLs.
const RPC_PATH: &str = "/rpc";

/// Where the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `ws://` or `wss://` URL.
    WebSocket(Url),
    /// Unix domain socket path, from `unix:///path/to.sock`.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a server URL.
    ///
    /// `http`/`https` are rewritten to `ws`/`wss`, and a URL without a path
    /// gets `/rpc`.
    ///
    /// # Errors
    ///
    /// `ClientError::Config` for unparsable URLs and unsupported schemes.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let mut url = Url::parse(raw)
            .map_err(|e| ClientError::Config(format!("invalid endpoint {}: {}", raw, e)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(ClientError::Config(format!(
                        "unix endpoint {} has no socket path",
                        raw
                    )));
                }
                return Ok(Endpoint::Unix(PathBuf::from(path)));
            }
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported scheme {} in {}",
                    other, raw
                )))
            }
        };

        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ClientError::Config(format!(
                "cannot use {} as a {} endpoint",
                raw, scheme
            )));
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(RPC_PATH);
        }
        Ok(Endpoint::WebSocket(url))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::WebSocket(url) => write!(f, "{}", url),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Read half of an open transport.
pub(crate) enum FrameReader {
    WebSocket(SplitStream<WsStream>),
    Unix(BufReader<OwnedReadHalf>),
}

impl FrameReader {
    /// Next inbound text frame, or `None` once the peer closed the connection.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<String>> {
        match self {
            FrameReader::WebSocket(stream) => loop {
                let message = match stream.next().await {
                    Some(message) => message.context("WebSocket read failed")?,
                    None => return Ok(None),
                };
                match message {
                    Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                    Message::Binary(bytes) => {
                        return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                    }
                    Message::Close(frame) => {
                        debug!("Server sent close frame: {:?}", frame);
                        return Ok(None);
                    }
                    // Pings are answered by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            },
            FrameReader::Unix(reader) => read_message(reader).await,
        }
    }
}

/// Write half of an open transport.
pub(crate) enum FrameWriter {
    WebSocket(SplitSink<WsStream, Message>),
    Unix(OwnedWriteHalf),
}

impl FrameWriter {
    pub(crate) async fn send(&mut self, text: String) -> Result<()> {
        match self {
            FrameWriter::WebSocket(sink) => sink
                .send(Message::Text(text.into()))
                .await
                .context("WebSocket write failed"),
            FrameWriter::Unix(writer) => write_message(writer, &text).await,
        }
    }

    /// Close the outbound direction, sending a close frame on WebSockets.
    pub(crate) async fn close(&mut self) -> Result<()> {
        match self {
            FrameWriter::WebSocket(sink) => sink.close().await.context("WebSocket close failed"),
            FrameWriter::Unix(writer) => writer
                .shutdown()
                .await
                .context("Unix socket shutdown failed"),
        }
    }
}

/// Open `endpoint`, failing if the handshake does not finish within `timeout`.
pub(crate) async fn open(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<(FrameReader, FrameWriter)> {
    tokio::time::timeout(timeout, connect(endpoint))
        .await
        .map_err(|_| anyhow!("not connected within {:?}", timeout))?
}

async fn connect(endpoint: &Endpoint) -> Result<(FrameReader, FrameWriter)> {
    match endpoint {
        Endpoint::WebSocket(url) => {
            let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .with_context(|| format!("WebSocket handshake with {} failed", url))?;
            debug!("WebSocket handshake status {}", response.status());
            let (sink, stream) = stream.split();
            Ok((FrameReader::WebSocket(stream), FrameWriter::WebSocket(sink)))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .with_context(|| format!("Failed to connect to {}", path.display()))?;
            let (read_half, write_half) = stream.into_split();
            Ok((
                FrameReader::Unix(BufReader::new(read_half)),
                FrameWriter::Unix(write_half),
            ))
        }
    }
}
