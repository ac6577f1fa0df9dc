//! WebSocket transport for the session RPC runtime.
//!
//! - For accepting: [`WebSocketListener`] provides an Axum handler that can be
//!   mounted into an existing router, and hands every upgraded socket to an
//!   [`RpcServer`] as a transport. [`WebSocketServer`] and [`serve`] wire up a
//!   complete server on a TCP port.
//! - For connecting: [`connect`] and [`connect_blocking`] dial a `ws://` URL
//!   with a standard WebSocket client and start a connection on it.
//!
//! Frames travel as binary messages. Text messages are accepted as their UTF-8
//! bytes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use proven_session_rpc::{
    BlockingConfig, BlockingConnection, Connection, ConnectionConfig, Error, Listener, Result,
    RootRegistry, RpcServer, ServerConfig, Transport, TransportError,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument};
use url::Url;
use uuid::Uuid;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of a WebSocket connection.
pub struct WebSocketClientTransport {
    id: Uuid,
    sink: Mutex<SplitSink<ClientStream, Message>>,
    stream: Mutex<SplitStream<ClientStream>>,
    closed: AtomicBool,
}

impl WebSocketClientTransport {
    fn new(ws_stream: ClientStream) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

impl Debug for WebSocketClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClientTransport")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WebSocketClientTransport {
    async fn send(&self, message: Bytes) -> std::result::Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(message))
            .await
            .map_err(|e| TransportError::Io(format!("websocket send: {e}")))
    }

    async fn recv(&self) -> std::result::Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::ConnectionClosed);
                }
                // Ping, pong and raw frames carry no payload for us.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(format!("websocket recv: {e}"))),
            }
        }
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("Closing WebSocket client transport {}", self.id);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        Ok(())
    }
}

/// Server side of a WebSocket connection, produced by the Axum handler.
pub struct WebSocketServerTransport {
    id: Uuid,
    sink: Mutex<SplitSink<WebSocket, AxumMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WebSocketServerTransport {
    fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

impl Debug for WebSocketServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServerTransport")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WebSocketServerTransport {
    async fn send(&self, message: Bytes) -> std::result::Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(AxumMessage::Binary(message))
            .await
            .map_err(|e| TransportError::Io(format!("websocket send: {e}")))
    }

    async fn recv(&self) -> std::result::Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(AxumMessage::Binary(data))) => return Ok(data),
                Some(Ok(AxumMessage::Text(text))) => {
                    return Ok(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(AxumMessage::Close(_))) | None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(format!("websocket recv: {e}"))),
            }
        }
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("Closing WebSocket server transport {}", self.id);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        Ok(())
    }
}

/// Listener that receives upgraded sockets from the Axum handler.
#[derive(Debug, Clone)]
pub struct WebSocketListener {
    incoming_tx: mpsc::Sender<WebSocketServerTransport>,
    incoming_rx: Arc<Mutex<mpsc::Receiver<WebSocketServerTransport>>>,
    max_message_size: usize,
}

impl WebSocketListener {
    /// Create a listener accepting messages up to `max_message_size` bytes.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        Self {
            incoming_tx,
            incoming_rx: Arc::new(Mutex::new(incoming_rx)),
            max_message_size,
        }
    }

    /// Mount the WebSocket endpoint into an Axum router at `path`.
    #[must_use]
    pub fn mount_into_router(&self, router: Router, path: &str) -> Router {
        let incoming_tx = self.incoming_tx.clone();
        let max_message_size = self.max_message_size;

        let handler = move |ws: WebSocketUpgrade| {
            let incoming_tx = incoming_tx.clone();

            async move {
                ws.max_message_size(max_message_size)
                    .on_upgrade(move |socket| async move {
                        let transport = WebSocketServerTransport::new(socket);
                        debug!("Upgraded WebSocket {}", transport.id);
                        if incoming_tx.send(transport).await.is_err() {
                            error!("WebSocket listener is gone, dropping connection");
                        }
                    })
            }
        };

        router.route(path, axum::routing::get(handler))
    }
}

impl Default for WebSocketListener {
    fn default() -> Self {
        Self::new(proven_session_rpc::protocol::codec::MAX_MESSAGE_SIZE)
    }
}

#[async_trait]
impl Listener for WebSocketListener {
    async fn accept(&self) -> std::result::Result<Box<dyn Transport>, TransportError> {
        let mut incoming = self.incoming_rx.lock().await;
        let transport = incoming.recv().await.ok_or(TransportError::ConnectionClosed)?;
        Ok(Box::new(transport))
    }
}

/// Dial a `ws://` or `wss://` URL.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] for malformed or non-WebSocket
/// URLs and [`TransportError::ConnectionFailed`] if the handshake fails.
pub async fn connect_transport(
    url: &str,
) -> std::result::Result<WebSocketClientTransport, TransportError> {
    let url = Url::parse(url)
        .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL {url}: {e}")))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidAddress(format!(
            "Unsupported scheme '{}', expected ws or wss",
            url.scheme()
        )));
    }

    debug!("Connecting to WebSocket at {}", url);

    let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
        TransportError::ConnectionFailed(format!("WebSocket connect to {url} failed: {e}"))
    })?;

    Ok(WebSocketClientTransport::new(ws_stream))
}

/// Connect to a WebSocket endpoint and start a connection on it.
///
/// # Errors
///
/// Returns a transport error if the endpoint cannot be reached.
#[instrument(skip(config))]
pub async fn connect(url: &str, config: ConnectionConfig) -> Result<Connection> {
    let transport = connect_transport(url).await?;
    Ok(Connection::connect(transport, config))
}

/// Connect to a WebSocket endpoint for blocking use.
///
/// Must not be called from inside an async context.
///
/// # Errors
///
/// Returns a transport error if the endpoint cannot be reached.
pub fn connect_blocking(url: &str, config: BlockingConfig) -> Result<BlockingConnection> {
    let url = url.to_string();
    BlockingConnection::connect(config, move || async move {
        Ok::<_, Error>(connect_transport(&url).await?)
    })
}

/// A running WebSocket RPC server.
#[derive(Debug)]
pub struct WebSocketServer {
    local_addr: SocketAddr,
    rpc: Arc<RpcServer>,
    http: JoinHandle<()>,
    accept: JoinHandle<Result<()>>,
}

impl WebSocketServer {
    /// Bind `addr` and start serving `registry` on the root path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    #[instrument(skip(registry, config))]
    pub async fn bind(
        addr: SocketAddr,
        registry: impl Into<Arc<RootRegistry>>,
        config: ServerConfig,
    ) -> Result<Self> {
        let tcp = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;

        let listener = WebSocketListener::new(config.connection.max_message_size);
        let router = listener.mount_into_router(Router::new(), "/");

        let http = tokio::spawn(async move {
            if let Err(e) = axum::serve(tcp, router).await {
                error!("WebSocket HTTP server failed: {}", e);
            }
        });

        let rpc = Arc::new(RpcServer::new(registry, config));
        let accept = {
            let rpc = Arc::clone(&rpc);
            tokio::spawn(async move { rpc.serve(listener).await })
        };

        info!("WebSocket RPC server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            rpc,
            http,
            accept,
        })
    }

    /// Address the server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients can connect to.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        self.rpc.shutdown();
    }

    /// Wait until the server stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop failed.
    pub async fn wait(self) -> Result<()> {
        let result = self
            .accept
            .await
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;
        self.http.abort();
        result
    }
}

/// Serve `registry` over WebSocket on `port` until the process ends.
///
/// Sessions opened without a root type get the registry's default.
///
/// # Errors
///
/// Returns an I/O error if the port cannot be bound.
pub async fn serve(port: u16, registry: impl Into<Arc<RootRegistry>>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    WebSocketServer::bind(addr, registry, ServerConfig::default())
        .await?
        .wait()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_websocket_urls() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        assert!(matches!(
            connect_transport("http://localhost:1").await,
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            connect_transport("not a url").await,
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = connect(&format!("ws://127.0.0.1:{port}/"), ConnectionConfig::default()).await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::ConnectionFailed(_)))
        ));
    }
}
