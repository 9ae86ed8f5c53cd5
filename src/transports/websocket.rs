//! WebSocket transports.
//!
//! Two flavours share one interface: [`WsClientTransport`] dials an outbound
//! WebSocket (the voice-bot side), [`WsServerTransport`] wraps an accepted
//! provider connection. Each transport runs a writer task fed over an mpsc
//! channel so multiple loops can send on the same socket while a single loop
//! owns `recv()`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// A message crossing a transport. The binary/text distinction is preserved
/// end to end: audio rides binary frames, control messages ride text.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Binary(Vec<u8>),
    Text(String),
}

impl WireMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireMessage::Text(t) => Some(t),
            WireMessage::Binary(_) => None,
        }
    }

    fn into_ws(self) -> Message {
        match self {
            WireMessage::Binary(b) => Message::Binary(b),
            WireMessage::Text(t) => Message::Text(t),
        }
    }
}

/// Clonable send handle for a transport. Backed by the transport's writer
/// task, so sends from the two forwarding loops interleave safely.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

impl TransportSender {
    pub async fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(msg.into_ws())
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection from a send handle. Used by tasks that end the
    /// call without owning the receive half.
    pub async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None)).await;
        }
    }
}

/// Common transport interface for the provider and bot sides.
#[async_trait]
pub trait Transport: Send {
    /// Clonable handle for sending on this transport.
    fn sender(&self) -> TransportSender;

    /// Receive the next message. Returns `None` when the peer disconnects.
    async fn recv(&mut self) -> Option<WireMessage>;

    /// Close the connection gracefully.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Writer-task plumbing shared by both transport flavours.
struct WriterHalf {
    tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

fn spawn_writer<S>(mut sink: SplitSink<WebSocketStream<S>, Message>, connected: Arc<AtomicBool>) -> WriterHalf
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let task_connected = connected.clone();
    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                task_connected.store(false, Ordering::SeqCst);
                break;
            }
            if is_close {
                break;
            }
        }
    });
    WriterHalf { tx, connected, task }
}

async fn next_wire<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    connected: &AtomicBool,
) -> Option<WireMessage>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Some(WireMessage::Binary(data)),
            Some(Ok(Message::Text(text))) => return Some(WireMessage::Text(text)),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                connected.store(false, Ordering::SeqCst);
                return None;
            }
            Some(Err(e)) => {
                debug!("websocket receive error: {e}");
                connected.store(false, Ordering::SeqCst);
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client transport (outbound, bot side)
// ---------------------------------------------------------------------------

/// WebSocket client transport dialing a remote endpoint.
pub struct WsClientTransport {
    writer: WriterHalf,
    receiver: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsClientTransport {
    /// Dial `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        info!("connecting to websocket: {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        let (sink, receiver) = ws.split();
        let connected = Arc::new(AtomicBool::new(true));
        Ok(Self {
            writer: spawn_writer(sink, connected),
            receiver,
        })
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    fn sender(&self) -> TransportSender {
        TransportSender {
            tx: self.writer.tx.clone(),
            connected: self.writer.connected.clone(),
        }
    }

    async fn recv(&mut self) -> Option<WireMessage> {
        next_wire(&mut self.receiver, &self.writer.connected).await
    }

    async fn disconnect(&mut self) {
        if self.writer.connected.swap(false, Ordering::SeqCst) {
            let _ = self.writer.tx.send(Message::Close(None)).await;
        }
        self.writer.task.abort();
    }

    fn is_connected(&self) -> bool {
        self.writer.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Server transport (inbound, provider side)
// ---------------------------------------------------------------------------

/// Wraps an already-accepted provider WebSocket.
pub struct WsServerTransport {
    writer: WriterHalf,
    receiver: SplitStream<WebSocketStream<TcpStream>>,
    pub peer_addr: SocketAddr,
}

impl WsServerTransport {
    pub fn new(ws: WebSocketStream<TcpStream>, peer_addr: SocketAddr) -> Self {
        let (sink, receiver) = ws.split();
        let connected = Arc::new(AtomicBool::new(true));
        Self {
            writer: spawn_writer(sink, connected),
            receiver,
            peer_addr,
        }
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    fn sender(&self) -> TransportSender {
        TransportSender {
            tx: self.writer.tx.clone(),
            connected: self.writer.connected.clone(),
        }
    }

    async fn recv(&mut self) -> Option<WireMessage> {
        next_wire(&mut self.receiver, &self.writer.connected).await
    }

    async fn disconnect(&mut self) {
        if self.writer.connected.swap(false, Ordering::SeqCst) {
            let _ = self.writer.tx.send(Message::Close(None)).await;
        }
        self.writer.task.abort();
    }

    fn is_connected(&self) -> bool {
        self.writer.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts provider WebSocket connections on a configured host/port/path.
pub struct WsListener {
    listener: TcpListener,
    path: String,
}

impl WsListener {
    pub async fn bind(host: &str, port: u16, path: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("listening on ws://{host}:{port}{path}");
        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next provider connection, enforcing the URL path during the
    /// upgrade. Connections to other paths are rejected and skipped.
    pub async fn accept(&self) -> Result<WsServerTransport, TransportError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let expected = self.path.clone();
            let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let path = req.uri().path();
                if expected == "/" || path.starts_with(&expected) {
                    Ok(resp)
                } else {
                    warn!("rejected connection to {path} (expected {expected})");
                    let mut not_found = ErrorResponse::new(Some("not found".into()));
                    *not_found.status_mut() =
                        tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                    Err(not_found)
                }
            };

            match accept_hdr_async(stream, check_path).await {
                Ok(ws) => {
                    info!("provider websocket accepted from {peer_addr}");
                    return Ok(WsServerTransport::new(ws, peer_addr));
                }
                Err(e) => {
                    debug!("websocket handshake failed for {peer_addr}: {e}");
                    continue;
                }
            }
        }
    }
}
