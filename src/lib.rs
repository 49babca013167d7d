#![doc = include_str!("../README.md")]

mod cipher;
mod codec;
mod config;
mod connection;
mod dh;
mod dispatch;
mod error;
mod manager;
mod middleware;
mod packet;
mod pool;
mod registry;
mod world;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{CoreConfig, DhParameters, HandlerMode};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, ConnectionStats};
pub use error::{CoreError, PacketError, TimeoutKind};
pub use manager::{ConnectionManager, MapId};
pub use middleware::{AuthPolicy, Metrics, MiddlewarePipeline, PermissiveAuthPolicy};
pub use packet::Packet;
pub use registry::{Handler, HandlerFactory, HandlerRegistry};
pub use world::{CellGrid, MapLoader, MapRecord, PlayerId, PlayerRecord, WorldRepository};

/// Capacity of the single channel every connection's receive-pump feeds
/// and the dispatcher drains. Bounded so a dispatcher wedged on a slow
/// handler applies backpressure instead of growing without limit.
const INBOUND_CHANNEL_CAPACITY: usize = 4096;

/// Top-level handle for one running instance of the protocol engine.
/// Built once by the embedding application from a [`CoreConfig`] and a
/// populated [`HandlerRegistry`]; holds no global or static state of its
/// own, per the "runtime struct, not service locator" design this crate
/// follows throughout.
pub struct Core {
    config: Arc<CoreConfig>,
    manager: ConnectionManager,
    pipeline: Arc<MiddlewarePipeline>,
    inbound_rx: flume::Receiver<(ConnectionId, Packet)>,
    inbound_tx: flume::Sender<(ConnectionId, Packet)>,
    cancel: CancellationToken,
}

impl Core {
    pub fn new(config: CoreConfig, registry: HandlerRegistry) -> Self {
        Self::with_auth_policy(config, registry, Arc::new(PermissiveAuthPolicy))
    }

    /// Like [`Core::new`], but lets the embedder supply a real
    /// [`AuthPolicy`] instead of the permissive default.
    pub fn with_auth_policy(config: CoreConfig, registry: HandlerRegistry, auth: Arc<dyn AuthPolicy>) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::new(config.clone(), cancel.clone());
        let pipeline = Arc::new(MiddlewarePipeline::with_auth_policy(
            config.handler_mode,
            Arc::new(registry),
            auth,
        ));
        let (inbound_tx, inbound_rx) = flume::bounded(INBOUND_CHANNEL_CAPACITY);

        Self {
            config,
            manager,
            pipeline,
            inbound_rx,
            inbound_tx,
            cancel,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The sending half of the channel every accepted connection's
    /// receive-pump feeds and the dispatcher drains. Exposed so a caller
    /// can register a connection directly (see
    /// [`ConnectionManager::accept_stream`]) against the same dispatcher
    /// [`Core::run`] spawns, without going through the TCP accept loop —
    /// the hook integration tests use to drive a connection over
    /// `tokio::io::duplex`.
    pub fn inbound_sender(&self) -> flume::Sender<(ConnectionId, Packet)> {
        self.inbound_tx.clone()
    }

    /// A token that cancels every connection task, the dispatcher, and
    /// the accept loop when triggered. Clone it out before calling
    /// [`Core::run`] if the embedder needs to trigger shutdown from
    /// elsewhere (a signal handler, an admin command).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("core shutdown requested");
        self.cancel.cancel();
    }

    /// Runs the accept loop and dispatcher until cancelled. Both are
    /// driven from this call; returning means the engine has fully
    /// stopped accepting and processing packets.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(metrics) = self.pipeline.metrics() {
            metrics.spawn_periodic_reporter(self.cancel.clone());
        }

        let dispatcher = dispatch::Dispatcher::new(
            self.inbound_rx.clone(),
            self.pipeline.clone(),
            self.manager.clone(),
            self.cancel.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let accept_result = self.manager.run_accept_loop(self.inbound_tx.clone()).await;

        self.cancel.cancel();
        let _ = dispatcher_task.await;

        accept_result
    }
}
