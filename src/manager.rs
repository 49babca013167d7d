//! Owns the accept loop and the live `ConnectionId -> ConnectionHandle`
//! table (spec §4.8).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::connection::{self, ConnectionHandle, ConnectionId, ConnectionIdAllocator};
use crate::packet::Packet;
use crate::pool::BufferPool;

/// Map id, used to scope a broadcast to one logical group of connections
/// (a game map, a zone, a guild channel) without the manager needing to
/// know anything about what a map *is*.
pub type MapId = u32;

/// Tracks every live connection and who should hear a given broadcast.
/// Cloning is cheap; every clone shares the same underlying table.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Arc<CoreConfig>,
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
    id_allocator: Arc<ConnectionIdAllocator>,
    cancel: CancellationToken,
    raw_buffer_pool: Arc<BufferPool>,
    frame_buffer_pool: Arc<BufferPool>,
}

impl ConnectionManager {
    pub fn new(config: Arc<CoreConfig>, cancel: CancellationToken) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            id_allocator: Arc::new(ConnectionIdAllocator::new()),
            cancel,
            raw_buffer_pool: Arc::new(BufferPool::new()),
            frame_buffer_pool: Arc::new(BufferPool::new()),
        }
    }

    /// Binds the configured listen address and accepts connections until
    /// cancelled. Each accepted socket becomes a new connection entry.
    pub async fn run_accept_loop(&self, inbound_tx: flume::Sender<(ConnectionId, Packet)>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        info!(addr = %self.config.socket_addr(), "listening for connections");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            self.accept_stream(stream, peer_addr, inbound_tx.clone());
                        }
                        Err(e) => warn!(error = %e, "failed to accept a connection"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawns the connection task trio over any duplex-capable stream and
    /// registers it in the connection table, the same way `run_accept_loop`
    /// handles a freshly accepted `TcpStream`. Generic so tests can drive a
    /// connection over `tokio::io::duplex` against the same dispatcher and
    /// middleware pipeline a real socket would go through, instead of
    /// standing up a TCP listener.
    pub fn accept_stream<S>(
        &self,
        stream: S,
        peer_addr: std::net::SocketAddr,
        inbound_tx: flume::Sender<(ConnectionId, Packet)>,
    ) -> ConnectionHandle
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.id_allocator.allocate();
        let handle = connection::spawn(
            stream,
            id,
            peer_addr,
            self.config.clone(),
            inbound_tx,
            self.cancel.clone(),
            self.raw_buffer_pool.clone(),
            self.frame_buffer_pool.clone(),
        );
        self.connections.write().insert(id, handle.clone());
        info!(connection = %id, peer = %peer_addr, active = self.connections.read().len(), "connection accepted");
        handle
    }

    /// Drops any connections whose state has become `Disconnected`. The
    /// manager doesn't otherwise get a callback when a connection dies,
    /// so this is called periodically (see [`crate::dispatch::Dispatcher`])
    /// rather than eagerly on every lookup.
    pub fn reap_disconnected(&self) {
        let mut connections = self.connections.write();
        connections.retain(|id, handle| {
            let alive = handle.state() != crate::connection::ConnectionState::Disconnected;
            if !alive {
                info!(connection = %id, "reaping disconnected connection");
            }
            alive
        });
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// A snapshot of every currently tracked connection. Useful for the
    /// embedder to build a player list, or for a caller that doesn't
    /// have a specific [`ConnectionId`] in hand.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    /// Sends `bytes` to every connection except `exclude`. A single
    /// connection's full outbound queue never stops the rest of the
    /// broadcast; the failure is logged and counted, not propagated.
    pub fn broadcast_all(&self, bytes: &[u8], exclude: Option<ConnectionId>) {
        let mut delivered = 0usize;
        for (id, handle) in self.connections.read().iter() {
            if Some(*id) == exclude {
                continue;
            }
            handle.send(bytes.to_vec());
            delivered += 1;
        }
        info!(delivered, "broadcast to all connections");
    }

    /// Sends `bytes` to every connection this manager believes belongs to
    /// `map_id`. Map membership is looked up through `member_of`, a
    /// caller-supplied function, since the manager itself has no concept
    /// of maps or players.
    pub fn broadcast_to_map(
        &self,
        bytes: &[u8],
        map_id: MapId,
        exclude: Option<ConnectionId>,
        member_of: impl Fn(ConnectionId) -> Option<MapId>,
    ) {
        let mut delivered = 0usize;
        for (id, handle) in self.connections.read().iter() {
            if Some(*id) == exclude {
                continue;
            }
            if member_of(*id) != Some(map_id) {
                continue;
            }
            handle.send(bytes.to_vec());
            delivered += 1;
        }
        info!(map_id, delivered, "broadcast to map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let manager = ConnectionManager::new(Arc::new(CoreConfig::default()), CancellationToken::new());
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let manager = ConnectionManager::new(Arc::new(CoreConfig::default()), CancellationToken::new());
        assert!(manager.get(ConnectionId(42)).is_none());
    }
}
