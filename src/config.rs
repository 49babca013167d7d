//! Typed configuration for the core, constructed once by the embedding
//! application and shared by `Arc` — see the Design Notes' "Runtime struct,
//! not service locator" guidance. Nothing in this crate reads configuration
//! from a global; every component that needs a setting receives it through
//! [`CoreConfig`] or a value derived from it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Selects which middlewares are wired into the default pipeline. See spec
/// §6 and [`crate::middleware::build_default_pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HandlerMode {
    /// Full pipeline, including the debug-build structured logging
    /// middleware.
    #[default]
    Development,
    /// Full pipeline minus the debug logging middleware.
    Production,
    /// Rate-limit, auth, and metrics only.
    HighPerformance,
    /// Minimal pipeline (rate-limit + auth only); used by integration
    /// tests that don't want slow-detect/metrics noise.
    Testing,
}

/// The Diffie-Hellman parameters used to seed every [`crate::dh::DhExchange`].
/// Process-wide constants per spec §4.2; stored as decimal strings in
/// configuration so they round-trip through `serde` cleanly and are parsed
/// once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhParameters {
    pub p: String,
    pub g: String,
}

impl DhParameters {
    /// A 1024-bit MODP group (RFC 3526 group 2) with generator 2. A
    /// reasonable default for a from-scratch deployment; real operators are
    /// expected to override this via configuration.
    pub fn default_group() -> Self {
        const P_HEX: &str = concat!(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
            "129024E088A67CC74020BBEA63B139B22514A08798E3404",
            "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
            "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406",
            "B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE",
            "45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD",
            "24CF5F83655D23DCA3AD961C62F356208552BB9ED529077",
            "096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
        );
        Self {
            p: BigUint::parse_bytes(P_HEX.as_bytes(), 16)
                .expect("built-in DH prime is valid hex")
                .to_str_radix(10),
            g: "2".to_owned(),
        }
    }

    pub(crate) fn p(&self) -> BigUint {
        self.p.parse().expect("DhParameters::p is valid decimal")
    }

    pub(crate) fn g(&self) -> BigUint {
        self.g.parse().expect("DhParameters::g is valid decimal")
    }
}

impl Default for DhParameters {
    fn default() -> Self {
        Self::default_group()
    }
}

/// Top-level configuration for the core. Cheap to clone; intended to be
/// wrapped in an `Arc` by the caller and shared with every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// TCP bind port for the accept loop.
    pub listen_port: u16,
    /// Bind address; defaults to all interfaces.
    pub listen_addr: IpAddr,
    /// Soft cap on concurrent players. Enforcement is a handler-layer
    /// concern; the core only logs milestones.
    pub max_players: usize,
    /// Selects which middlewares run.
    pub handler_mode: HandlerMode,
    /// DH parameters used for every handshake.
    pub dh_parameters: DhParameters,
    /// Capacity of each connection's bounded outbound queue.
    pub outbound_queue_capacity: usize,
    /// Handshake timeout, measured from accept.
    pub handshake_timeout: Duration,
    /// Idle timeout, measured from the last successfully received byte.
    pub idle_timeout: Duration,
    /// Interval of the per-connection health monitor.
    pub health_check_interval: Duration,
}

impl CoreConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen_port: 5816,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_players: 3000,
            handler_mode: HandlerMode::Development,
            dh_parameters: DhParameters::default(),
            outbound_queue_capacity: 100,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(30),
        }
    }
}
