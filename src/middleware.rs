//! The ordered packet-processing pipeline (spec §4.7): rate-limit, auth,
//! logging, slow-detect, metrics, then the handler itself. Each stage can
//! short-circuit the rest by disconnecting the connection; none of them
//! block on a slow peer beyond their own bounded work.
//!
//! The stages are a fixed, closed set rather than a generic chain of
//! user-registered middleware objects — there's nothing in this crate
//! that plugs a new stage in at runtime, so a straight-line function
//! reads more honestly than a `next()`-continuation abstraction with only
//! one caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HandlerMode;
use crate::connection::{ConnectionHandle, RateLimitVerdict};
use crate::error::CoreError;
use crate::packet::Packet;
use crate::registry::HandlerRegistry;

/// The auth stage's extension point. The default policy is permissive:
/// nothing in the spec this pipeline implements says what "authorized"
/// means for a given packet type, so the stage exists structurally and
/// defers that decision to whoever embeds this crate.
pub trait AuthPolicy: Send + Sync {
    fn authorize(&self, conn: &ConnectionHandle, packet: &Packet) -> bool;
}

pub struct PermissiveAuthPolicy;

impl AuthPolicy for PermissiveAuthPolicy {
    fn authorize(&self, _conn: &ConnectionHandle, _packet: &Packet) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TypeMetrics {
    success: u64,
    failure: u64,
    total_elapsed: Duration,
}

/// Per-packet-type success/failure counters, reported on a fixed
/// interval. Connection-level counters (bytes, packet counts) already
/// live on [`crate::connection::ConnectionShared`]; this covers the
/// cross-connection, per-type aggregate the spec asks for in addition.
#[derive(Default)]
pub struct Metrics {
    by_type: Mutex<HashMap<u16, TypeMetrics>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, packet_type: u16, success: bool, elapsed: Duration) {
        let mut by_type = self.by_type.lock();
        let entry = by_type.entry(packet_type).or_default();
        if success {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
        entry.total_elapsed += elapsed;
    }

    /// Spawns a task that logs a per-type summary every five minutes
    /// until `cancel` fires.
    pub fn spawn_periodic_reporter(self: &Arc<Self>, cancel: CancellationToken) {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => metrics.report(),
                }
            }
        });
    }

    fn report(&self) {
        let by_type = self.by_type.lock();
        for (packet_type, metrics) in by_type.iter() {
            info!(
                packet_type,
                success = metrics.success,
                failure = metrics.failure,
                total_elapsed_ms = metrics.total_elapsed.as_millis() as u64,
                "packet metrics report"
            );
        }
    }
}

/// Resolved, ready-to-run pipeline for one [`HandlerMode`].
pub struct MiddlewarePipeline {
    auth: Arc<dyn AuthPolicy>,
    logging_enabled: bool,
    slow_detect_enabled: bool,
    metrics: Option<Arc<Metrics>>,
    registry: Arc<HandlerRegistry>,
}

impl MiddlewarePipeline {
    pub fn new(mode: HandlerMode, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_auth_policy(mode, registry, Arc::new(PermissiveAuthPolicy))
    }

    pub fn with_auth_policy(
        mode: HandlerMode,
        registry: Arc<HandlerRegistry>,
        auth: Arc<dyn AuthPolicy>,
    ) -> Self {
        let slow_detect_enabled = matches!(mode, HandlerMode::Development | HandlerMode::Production);
        let metrics_enabled = matches!(
            mode,
            HandlerMode::Development | HandlerMode::Production | HandlerMode::HighPerformance
        );
        let logging_enabled = cfg!(debug_assertions) && mode == HandlerMode::Development;

        Self {
            auth,
            logging_enabled,
            slow_detect_enabled,
            metrics: metrics_enabled.then(Metrics::new),
            registry,
        }
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Runs one packet through the full pipeline. Never panics on handler
    /// failure; a handler's `Err` is logged and counted, not propagated.
    pub async fn dispatch(&self, conn: &ConnectionHandle, packet: Packet) {
        let packet_type = packet.packet_type();

        match conn.check_rate_limit(packet_type) {
            RateLimitVerdict::Ok => {}
            RateLimitVerdict::TokenBucketExhausted => {
                conn.disconnect_on_security_violation("rate limit token bucket exhausted");
                return;
            }
            RateLimitVerdict::FloodDetected => {
                conn.disconnect_on_security_violation("packet flood detected");
                return;
            }
            RateLimitVerdict::DiversityExceeded => {
                conn.disconnect_on_security_violation("packet type diversity exceeded");
                return;
            }
        }

        if !self.auth.authorize(conn, &packet) {
            conn.disconnect_on_security_violation("rejected by auth policy");
            return;
        }

        if self.logging_enabled {
            debug!(connection = %conn.id(), packet_type, "dispatching packet");
        }

        let start = Instant::now();
        let outcome = match self.registry.resolve(&packet) {
            Ok(Some(handler)) => handler.handle(conn, &packet).await,
            Ok(None) => {
                debug!(connection = %conn.id(), packet_type, "no handler registered for packet type");
                Ok(())
            }
            Err(err) => Err(err),
        };
        let elapsed = start.elapsed();

        if self.slow_detect_enabled {
            conn.record_slow_packet(packet_type, elapsed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record(packet_type, outcome.is_ok(), elapsed);
        }
        if self.logging_enabled {
            debug!(
                connection = %conn.id(),
                packet_type,
                success = outcome.is_ok(),
                elapsed_ms = elapsed.as_millis() as u64,
                "dispatch outcome"
            );
        }
        if let Err(source) = outcome {
            let err = CoreError::Handler {
                connection_id: conn.id(),
                packet_type,
                source,
            };
            warn!(connection = %conn.id(), packet_type, error = %err, "handler returned an error");
        }
    }
}

/// Builds the pipeline [`crate::config::CoreConfig`] asks for.
pub fn build_default_pipeline(
    config: &crate::config::CoreConfig,
    registry: Arc<HandlerRegistry>,
) -> MiddlewarePipeline {
    MiddlewarePipeline::new(config.handler_mode, registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_enable_the_documented_stages() {
        let registry = Arc::new(HandlerRegistry::new());

        let dev = MiddlewarePipeline::new(HandlerMode::Development, registry.clone());
        assert!(dev.slow_detect_enabled);
        assert!(dev.metrics.is_some());

        let high_perf = MiddlewarePipeline::new(HandlerMode::HighPerformance, registry.clone());
        assert!(!high_perf.slow_detect_enabled);
        assert!(high_perf.metrics.is_some());
        assert!(!high_perf.logging_enabled);

        let testing = MiddlewarePipeline::new(HandlerMode::Testing, registry);
        assert!(!testing.slow_detect_enabled);
        assert!(testing.metrics.is_none());
        assert!(!testing.logging_enabled);
    }

    #[test]
    fn metrics_records_success_and_failure_counts() {
        let metrics = Metrics::new();
        metrics.record(1, true, Duration::from_millis(5));
        metrics.record(1, false, Duration::from_millis(10));
        let by_type = metrics.by_type.lock();
        let entry = by_type[&1];
        assert_eq!(entry.success, 1);
        assert_eq!(entry.failure, 1);
    }
}
