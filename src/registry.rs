//! Packet-type to handler lookup (spec §4.6).
//!
//! Handlers come in two shapes. A "free" handler is a single stateless
//! object shared across every packet of its type, the way `connect.rs`'s
//! bare async functions handled a login packet. An "instance" handler is
//! built fresh per packet from the packet's own bytes and then invoked
//! once — useful for handlers that want to parse their payload once, up
//! front, before doing anything else. Both end up behind the same
//! [`Handler`] trait object so the dispatcher doesn't need to care which
//! shape registered for a given type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::connection::ConnectionHandle;
use crate::packet::Packet;

/// Invoked by the pipeline once rate-limiting and auth have passed.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, conn: &ConnectionHandle, packet: &Packet) -> anyhow::Result<()>;
}

/// Builds a per-packet [`Handler`] instance from the packet's own bytes,
/// before the connection is ever involved.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, packet: &Packet) -> anyhow::Result<Box<dyn Handler>>;
}

enum Registration {
    Free(Arc<dyn Handler>),
    Factory(Arc<dyn HandlerFactory>),
}

/// `packet_type_id -> handler` catalog, built once at startup and then
/// read-only for the life of the process.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler shared by every packet of `packet_type`. Logs
    /// and refuses the registration if the type is already taken, rather
    /// than silently letting the last call win.
    pub fn register(&mut self, packet_type: u16, handler: Arc<dyn Handler>) {
        self.insert(packet_type, Registration::Free(handler));
    }

    /// Registers a factory that builds a fresh handler per packet of
    /// `packet_type`.
    pub fn register_factory(&mut self, packet_type: u16, factory: Arc<dyn HandlerFactory>) {
        self.insert(packet_type, Registration::Factory(factory));
    }

    fn insert(&mut self, packet_type: u16, registration: Registration) {
        if self.handlers.contains_key(&packet_type) {
            error!(packet_type, "duplicate handler registration, keeping the first one");
            return;
        }
        self.handlers.insert(packet_type, registration);
    }

    /// Resolves and, if necessary, constructs the handler for `packet`.
    pub fn resolve(&self, packet: &Packet) -> anyhow::Result<Option<Arc<dyn Handler>>> {
        match self.handlers.get(&packet.packet_type()) {
            None => Ok(None),
            Some(Registration::Free(handler)) => Ok(Some(handler.clone())),
            Some(Registration::Factory(factory)) => Ok(Some(Arc::from(factory.create(packet)?))),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _conn: &ConnectionHandle, _packet: &Packet) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct EchoFactory;

    struct EchoHandler {
        payload_len: usize,
    }

    impl HandlerFactory for EchoFactory {
        fn create(&self, packet: &Packet) -> anyhow::Result<Box<dyn Handler>> {
            Ok(Box::new(EchoHandler {
                payload_len: packet.as_bytes().len(),
            }))
        }
    }

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _conn: &ConnectionHandle, _packet: &Packet) -> anyhow::Result<()> {
            anyhow::ensure!(self.payload_len > 0, "unexpectedly empty payload");
            Ok(())
        }
    }

    #[test]
    fn resolves_a_free_handler_for_its_registered_type() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(10, Arc::new(CountingHandler(calls)));

        let packet = Packet::from_bytes(&[0, 0, 10, 0]);
        assert!(registry.resolve(&packet).unwrap().is_some());
    }

    #[test]
    fn unregistered_type_resolves_to_none() {
        let registry = HandlerRegistry::new();
        let packet = Packet::from_bytes(&[0, 0, 1, 0]);
        assert!(registry.resolve(&packet).unwrap().is_none());
    }

    #[test]
    fn factory_is_invoked_per_packet() {
        let mut registry = HandlerRegistry::new();
        registry.register_factory(20, Arc::new(EchoFactory));

        let packet = Packet::from_bytes(&[0, 0, 20, 0, 1, 2, 3]);
        assert!(registry.resolve(&packet).unwrap().is_some());
    }

    #[test]
    fn duplicate_registration_keeps_the_first() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(5, Arc::new(CountingHandler(first)));
        registry.register(5, Arc::new(CountingHandler(second)));
        assert_eq!(registry.len(), 1);
    }
}
