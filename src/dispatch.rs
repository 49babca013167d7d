//! Drains the global inbound channel and runs each packet through the
//! pipeline (spec §4.9). One task, independent of every connection's own
//! receive-pump: a slow handler stalls the dispatcher's queue, never a
//! peer's socket read.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ConnectionId;
use crate::manager::ConnectionManager;
use crate::middleware::MiddlewarePipeline;
use crate::packet::Packet;

/// Runs the dispatch loop. Takes the inbound receiver by value since only
/// one task is ever meant to drain it.
pub struct Dispatcher {
    inbound_rx: flume::Receiver<(ConnectionId, Packet)>,
    pipeline: Arc<MiddlewarePipeline>,
    manager: ConnectionManager,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        inbound_rx: flume::Receiver<(ConnectionId, Packet)>,
        pipeline: Arc<MiddlewarePipeline>,
        manager: ConnectionManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inbound_rx,
            pipeline,
            manager,
            cancel,
        }
    }

    /// Runs until the inbound channel closes or cancellation fires.
    /// A pipeline error for one packet never stops the loop; it's logged
    /// and attributed to the connection that sent it.
    pub async fn run(self) {
        let mut reap_interval = tokio::time::interval(Duration::from_secs(60));
        reap_interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = reap_interval.tick() => {
                    self.manager.reap_disconnected();
                }
                message = self.inbound_rx.recv_async() => {
                    match message {
                        Ok((connection_id, packet)) => self.dispatch_one(connection_id, packet).await,
                        Err(_) => {
                            info!("inbound channel closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_one(&self, connection_id: ConnectionId, packet: Packet) {
        let Some(handle) = self.manager.get(connection_id) else {
            warn!(connection = %connection_id, "packet arrived for an already-removed connection");
            return;
        };
        self.pipeline.dispatch(&handle, packet).await;
    }
}
