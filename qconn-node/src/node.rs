//! TCP (and WebSocket) endpoints that attach a [`Connection`] to every
//! socket.

use qconn_core::{Connection, MessageChannel, RpcError, Value};
use qconn_transport::stream_channel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::config::{NodeConfig, TransportKind};
use crate::registry::ConnectionRegistry;

/// Exposes one local value to every peer that connects, and to every peer
/// it connects to.
#[derive(Debug, Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    local: Value,
    registry: ConnectionRegistry,
}

impl Node {
    pub fn new(config: NodeConfig, local: impl Into<Value>) -> Self {
        Self {
            config: Arc::new(config),
            local: local.into(),
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Binds the configured address. Port 0 picks a free port.
    pub async fn bind(&self) -> anyhow::Result<NodeListener> {
        let listener = TcpListener::bind(self.config.address()).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, transport = ?self.config.transport, "listening");
        Ok(NodeListener {
            node: self.clone(),
            listener,
            local_addr,
        })
    }

    /// Dials `addr` and returns the connection; its root is the peer's value.
    pub async fn connect(&self, addr: &str) -> anyhow::Result<Connection> {
        let channel: Arc<dyn MessageChannel> = match self.config.transport {
            TransportKind::Tcp => {
                let socket = TcpStream::connect(addr).await?;
                socket.set_nodelay(true)?;
                Arc::new(stream_channel(socket, self.config.codec(), Some(addr.to_string())))
            }
            TransportKind::WebSocket => websocket_connect(addr).await?,
        };
        let connection = self.attach(channel);
        info!(connection = %connection.id(), peer = addr, "connected");
        Ok(connection)
    }

    /// Closes every live connection.
    pub fn shutdown(&self, reason: Option<RpcError>) {
        self.registry.close_all(reason);
    }

    fn attach(&self, channel: Arc<dyn MessageChannel>) -> Connection {
        let connection = Connection::with_config(
            channel,
            self.local.clone(),
            self.config.connection_config(),
        );
        self.registry.track(connection.clone());
        connection
    }

    async fn accept_socket(&self, socket: TcpStream, peer: SocketAddr) -> anyhow::Result<Connection> {
        socket.set_nodelay(true)?;
        let channel: Arc<dyn MessageChannel> = match self.config.transport {
            TransportKind::Tcp => Arc::new(stream_channel(
                socket,
                self.config.codec(),
                Some(peer.to_string()),
            )),
            TransportKind::WebSocket => websocket_accept(socket, peer).await?,
        };
        let connection = self.attach(channel);
        info!(connection = %connection.id(), peer = %peer, "accepted");
        Ok(connection)
    }
}

#[cfg(feature = "websocket")]
async fn websocket_connect(addr: &str) -> anyhow::Result<Arc<dyn MessageChannel>> {
    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("ws://{}", addr)
    };
    Ok(Arc::new(qconn_transport::websocket::connect(&url).await?))
}

#[cfg(feature = "websocket")]
async fn websocket_accept(
    socket: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<Arc<dyn MessageChannel>> {
    Ok(Arc::new(
        qconn_transport::websocket::accept(socket, Some(peer.to_string())).await?,
    ))
}

#[cfg(not(feature = "websocket"))]
async fn websocket_connect(_addr: &str) -> anyhow::Result<Arc<dyn MessageChannel>> {
    anyhow::bail!("built without WebSocket support")
}

#[cfg(not(feature = "websocket"))]
async fn websocket_accept(
    _socket: TcpStream,
    _peer: SocketAddr,
) -> anyhow::Result<Arc<dyn MessageChannel>> {
    anyhow::bail!("built without WebSocket support")
}

/// A bound listening socket.
#[derive(Debug)]
pub struct NodeListener {
    node: Node,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl NodeListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one peer.
    pub async fn accept(&self) -> anyhow::Result<Connection> {
        let (socket, peer) = self.listener.accept().await?;
        self.node.accept_socket(socket, peer).await
    }

    /// Accepts peers until the listener fails. Handshakes run on their own
    /// tasks so a slow peer does not hold up the others.
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let node = self.node.clone();
            tokio::spawn(async move {
                if let Err(err) = node.accept_socket(socket, peer).await {
                    warn!(peer = %peer, error = %err, "failed to attach connection");
                }
            });
        }
    }
}
