//! Integration coverage for the rate-limit stage's flood detection: more
//! than ten packet arrivals inside the 100ms flood window gets the
//! connection disconnected, and the handler never sees most of them —
//! the middleware pipeline short-circuits before `HandlerRegistry`
//! dispatch runs.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use tq_core::{ConnectionHandle, ConnectionState, Handler, HandlerMode, HandlerRegistry, Packet};

use common::{client_frame_plaintext, complete_handshake, spawn_core_with_one_connection};

const PACKET_TYPE: u16 = 77;
const FLOOD_BURST: usize = 20;

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(&self, _conn: &ConnectionHandle, _packet: &Packet) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn wait_for_state(handle: &ConnectionHandle, state: ConnectionState) -> bool {
    for _ in 0..50 {
        if handle.state() == state {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn flood_of_packets_disconnects_the_connection() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(PACKET_TYPE, Arc::new(CountingHandler(calls.clone())));

    let (mut client, handle, _manager, config) =
        spawn_core_with_one_connection(registry, HandlerMode::Development).await;

    let mut session = complete_handshake(&mut client, &config).await;
    assert!(wait_for_state(&handle, ConnectionState::Connected).await, "handshake never completed");

    // The rate limiter's flood window tolerates ten arrivals inside
    // 100ms; sending a burst well past that trips `FloodDetected`. Each
    // frame is its own `write_all`, yielding in between so the
    // receive-pump gets a chance to decode and forward it — `PacketCodec`
    // caps decoded frames per socket read, so writing the whole burst in
    // one shot without yielding could bundle it into fewer read events
    // than arrivals.
    for _ in 0..FLOOD_BURST {
        let frame = session.encrypt(&client_frame_plaintext(PACKET_TYPE));
        client.write_all(&frame).await.unwrap();
        tokio::task::yield_now().await;
    }

    assert!(
        wait_for_state(&handle, ConnectionState::Disconnected).await,
        "flood of packets never tripped the rate limiter"
    );
    assert!(
        calls.load(Ordering::Relaxed) < FLOOD_BURST,
        "handler ran for every packet in the burst; the flood should have disconnected the \
         connection before the pipeline reached most of them"
    );
}
