//! Accepts incoming peer channels and tracks their connections.

use crate::config::NetworkConfig;
use crate::connection::{lock, PeerConnection};
use crate::error::NetworkError;
use crate::node::Node;
use crate::transport;
use cinder_gossip::Codec;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::{TcpListener, TcpStream};

/// Listens for incoming peer channels, validates the protocol handshake,
/// registers each accepted connection, and hands it to the node so the
/// symmetric peer entry can be created.
pub struct GossipServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    node: Weak<dyn Node>,
    config: Arc<NetworkConfig>,
    codec: Arc<Codec>,
    connections: Mutex<HashMap<u64, Arc<PeerConnection>>>,
}

impl GossipServer {
    /// Bind the listen socket. Port 0 picks an ephemeral port; the bound
    /// port is available via [`port`](Self::port).
    pub async fn bind(
        port: u16,
        node: Weak<dyn Node>,
        config: Arc<NetworkConfig>,
    ) -> Result<Arc<Self>, NetworkError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "gossip server listening");
        Ok(Arc::new(Self {
            listener,
            local_addr,
            node,
            codec: Arc::new(config.codec()),
            config,
            connections: Mutex::new(HashMap::new()),
        }))
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Accept loop. Runs until the server is dropped (spawn it).
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_accept(stream, remote).await;
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }

    async fn handle_accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let accepted = transport::accept_incoming(
            stream,
            remote.ip().to_string(),
            &self.config,
            Arc::clone(&self.codec),
        )
        .await;

        let (connection, handshake) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%remote, %error, "rejected incoming channel");
                return;
            }
        };

        let id = connection.id();
        let server = Arc::downgrade(&self);
        connection.set_on_disconnect(Box::new(move || {
            if let Some(server) = server.upgrade() {
                server.remove_connection(id);
            }
        }));
        lock(&self.connections).insert(id, Arc::clone(&connection));
        if !connection.is_open() {
            // The channel died before the disconnect hook was in place.
            self.remove_connection(id);
            return;
        }
        tracing::debug!(connection = id, %remote, "incoming channel accepted");

        match self.node.upgrade() {
            Some(node) => node.add_incoming_peer(connection, handshake),
            None => connection.close(),
        }
    }

    fn remove_connection(&self, id: u64) {
        if lock(&self.connections).remove(&id).is_some() {
            tracing::debug!(connection = id, "incoming channel removed");
        }
    }
}
