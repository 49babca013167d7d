//! Per-connection state machine and task trio (spec §4.5, §5).
//!
//! Each accepted socket becomes three cooperating tasks that share a small
//! [`ConnectionShared`] block (state, timestamps, atomic counters, the
//! cancellation token) but otherwise own their resources exclusively: the
//! receive-pump owns the raw/decrypted buffers and the [`DecryptCipher`],
//! the send-pump owns the [`EncryptCipher`], and neither reaches into the
//! other's half. Re-keying after the DH handshake is carried from the
//! receive-pump to the send-pump as a message on the outbound channel
//! rather than through shared, locked cipher state — see `cipher.rs`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cipher::{self, DecryptCipher, EncryptCipher, KEY_SIZE};
use crate::codec::{PacketCodec, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::config::CoreConfig;
use crate::dh::DhExchange;
use crate::error::{classify_io_error, CoreError, TimeoutKind};
use crate::packet::{Packet, SIGNATURE_SIZE};
use crate::pool::BufferPool;

/// 32-bit id, monotonically assigned, unique for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u32);

impl ConnectionId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Allocates process-unique [`ConnectionId`]s in order of acceptance.
pub struct ConnectionIdAllocator {
    next: AtomicU32,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic forward progression except that any state may move to
/// `Disconnected`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    WaitingForDummyPacket,
    DhKeyExchange,
    Connected,
    Disconnected,
}

/// Per-connection slow-packet bookkeeping (spec §3). Populated by the
/// SlowDetect middleware; kept here because it's part of a connection's
/// durable state, not the pipeline's.
#[derive(Debug, Default)]
pub struct SlowPacketState {
    /// Timestamps of slow (>=100ms) packets within the trailing window.
    pub recent_slow: std::collections::VecDeque<Instant>,
    pub slow_by_type: std::collections::HashMap<u16, u64>,
    pub total_slow: u64,
    pub total_very_slow: u64,
}

impl SlowPacketState {
    const WINDOW: Duration = Duration::from_secs(5 * 60);

    pub fn record(&mut self, packet_type: u16, elapsed: Duration) {
        let now = Instant::now();
        if elapsed >= Duration::from_millis(100) {
            self.recent_slow.push_back(now);
            *self.slow_by_type.entry(packet_type).or_insert(0) += 1;
            self.total_slow += 1;
        }
        if elapsed >= Duration::from_millis(500) {
            self.total_very_slow += 1;
        }
        while let Some(&front) = self.recent_slow.front() {
            if now.duration_since(front) > Self::WINDOW {
                self.recent_slow.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-connection token-bucket and window state backing the RateLimit
/// middleware stage (spec §4.7). Lives next to [`SlowPacketState`] for the
/// same reason: it's durable connection state, not pipeline state.
#[derive(Debug)]
pub struct RateLimiterState {
    tokens: f64,
    last_refill: Instant,
    recent_arrivals: std::collections::VecDeque<Instant>,
    types_this_minute: std::collections::HashSet<u16>,
    minute_started_at: Instant,
}

/// What, if anything, a rate-limit check caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitVerdict {
    Ok,
    TokenBucketExhausted,
    FloodDetected,
    DiversityExceeded,
}

impl RateLimiterState {
    const CAPACITY: f64 = 100.0;
    const REFILL_PER_SEC: f64 = 100.0;
    const FLOOD_WINDOW: Duration = Duration::from_millis(100);
    const FLOOD_THRESHOLD: usize = 10;
    const DIVERSITY_WINDOW: Duration = Duration::from_secs(60);
    const DIVERSITY_THRESHOLD: usize = 50;

    fn new() -> Self {
        let now = Instant::now();
        Self {
            tokens: Self::CAPACITY,
            last_refill: now,
            recent_arrivals: std::collections::VecDeque::new(),
            types_this_minute: std::collections::HashSet::new(),
            minute_started_at: now,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * Self::REFILL_PER_SEC).min(Self::CAPACITY);
        self.last_refill = now;
    }

    /// Runs all three checks in order, same as a caller would want to see
    /// them fail: exhaustion first, then flood, then diversity.
    fn check(&mut self, packet_type: u16) -> RateLimitVerdict {
        self.refill();
        if self.tokens < 1.0 {
            return RateLimitVerdict::TokenBucketExhausted;
        }
        self.tokens -= 1.0;

        let now = Instant::now();
        self.recent_arrivals.push_back(now);
        while let Some(&front) = self.recent_arrivals.front() {
            if now.duration_since(front) > Self::FLOOD_WINDOW {
                self.recent_arrivals.pop_front();
            } else {
                break;
            }
        }
        if self.recent_arrivals.len() > Self::FLOOD_THRESHOLD {
            return RateLimitVerdict::FloodDetected;
        }

        if now.duration_since(self.minute_started_at) > Self::DIVERSITY_WINDOW {
            self.types_this_minute.clear();
            self.minute_started_at = now;
        }
        self.types_this_minute.insert(packet_type);
        if self.types_this_minute.len() > Self::DIVERSITY_THRESHOLD {
            return RateLimitVerdict::DiversityExceeded;
        }

        RateLimitVerdict::Ok
    }
}

/// State shared by the three per-connection tasks and the handle held by
/// [`crate::manager::ConnectionManager`]. Everything a task owns
/// exclusively (buffers, cipher halves, the DH exchange) lives on that
/// task's stack instead, per spec §5's resource-ownership rules.
pub struct ConnectionShared {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    disconnect_guard: Mutex<()>,
    connected_at: Instant,
    handshake_started_at: Instant,
    last_activity_at: Mutex<Instant>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
    consecutive_errors: AtomicU32,
    slow: Mutex<SlowPacketState>,
    rate_limiter: Mutex<RateLimiterState>,
    cancel: CancellationToken,
}

impl ConnectionShared {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            connected_for: self.connected_at.elapsed(),
        }
    }

    /// Idempotent, serialized against concurrent callers.
    pub fn disconnect(&self, reason: impl Into<String> + Send + 'static, immediate: bool) {
        let _guard = self.disconnect_guard.lock();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        let reason = reason.into();
        let id = self.id;
        if immediate {
            info!(connection = %id, reason, "disconnecting");
            self.cancel.cancel();
        } else {
            info!(connection = %id, reason, "disconnecting (graceful)");
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }
    }

    pub fn disconnect_on_security_violation(&self, details: impl Into<String> + Send + 'static) {
        let err = CoreError::Security {
            connection_id: self.id,
            reason: details.into(),
        };
        warn!(connection = %self.id, error = %err, "audit: security violation");
        self.disconnect(err.to_string(), true);
    }

    pub fn record_slow_packet(&self, packet_type: u16, elapsed: Duration) {
        self.slow.lock().record(packet_type, elapsed);
    }

    pub fn check_rate_limit(&self, packet_type: u16) -> RateLimitVerdict {
        self.rate_limiter.lock().check(packet_type)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub connected_for: Duration,
}

/// Messages carried on the outbound channel. `Rekey` lets the
/// receive-pump hand the send-pump a fresh session key without either
/// task reaching into the other's cipher state.
enum OutboundMessage {
    Frame(Vec<u8>),
    Rekey([u8; KEY_SIZE]),
}

/// The manager-facing handle: an id, a producer for outbound frames, and
/// the shared stats/control block. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    outbound_tx: flume::Sender<OutboundMessage>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats()
    }

    /// Non-blocking enqueue. Fails silently (logged) if disconnected, the
    /// queue is full, or the frame exceeds the maximum frame size — a
    /// handler that blocked on a single slow client would stall every
    /// other connection sharing the dispatcher.
    pub fn send(&self, packet_bytes: Vec<u8>) {
        if packet_bytes.len() > MAX_FRAME_SIZE {
            let err = CoreError::Capacity {
                connection_id: self.shared.id(),
                reason: format!("outbound frame of {} bytes exceeds the maximum frame size", packet_bytes.len()),
            };
            warn!(connection = %self.shared.id(), error = %err, "dropping oversized outbound frame");
            return;
        }
        if self.shared.state() == ConnectionState::Disconnected {
            return;
        }
        if self.outbound_tx.try_send(OutboundMessage::Frame(packet_bytes)).is_err() {
            let err = CoreError::Capacity {
                connection_id: self.shared.id(),
                reason: "outbound queue full or closed".to_owned(),
            };
            debug!(connection = %self.shared.id(), error = %err, "dropping outbound frame");
        }
    }

    pub fn disconnect(&self, reason: impl Into<String> + Send + 'static, immediate: bool) {
        self.shared.disconnect(reason, immediate);
    }

    pub fn disconnect_on_security_violation(&self, details: impl Into<String> + Send + 'static) {
        self.shared.disconnect_on_security_violation(details);
    }

    pub fn record_slow_packet(&self, packet_type: u16, elapsed: Duration) {
        self.shared.record_slow_packet(packet_type, elapsed);
    }

    pub fn check_rate_limit(&self, packet_type: u16) -> RateLimitVerdict {
        self.shared.check_rate_limit(packet_type)
    }
}

/// Spawns the receive-pump, send-pump, and health-monitor for a freshly
/// accepted socket, and returns the handle the manager keeps. Generic over
/// the stream type so tests can drive the same state machine over
/// `tokio::io::duplex` instead of a real `TcpStream`.
///
/// `raw_buffer_pool` and `frame_buffer_pool` are the connection's raw
/// receive buffer and decrypted-frame accumulator, rented here rather
/// than allocated, and returned to their pool on every exit path out of
/// the receive-pump (see `receive_pump`).
#[allow(clippy::too_many_arguments)]
pub fn spawn<S>(
    stream: S,
    id: ConnectionId,
    peer_addr: SocketAddr,
    config: Arc<CoreConfig>,
    inbound_tx: flume::Sender<(ConnectionId, Packet)>,
    server_cancel: CancellationToken,
    raw_buffer_pool: Arc<BufferPool>,
    frame_buffer_pool: Arc<BufferPool>,
) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(ConnectionShared {
        id,
        peer_addr,
        state: Mutex::new(ConnectionState::Connecting),
        disconnect_guard: Mutex::new(()),
        connected_at: Instant::now(),
        handshake_started_at: Instant::now(),
        last_activity_at: Mutex::new(Instant::now()),
        bytes_rx: AtomicU64::new(0),
        bytes_tx: AtomicU64::new(0),
        packets_rx: AtomicU64::new(0),
        packets_tx: AtomicU64::new(0),
        consecutive_errors: AtomicU32::new(0),
        slow: Mutex::new(SlowPacketState::default()),
        rate_limiter: Mutex::new(RateLimiterState::new()),
        cancel: server_cancel.child_token(),
    });

    let (outbound_tx, outbound_rx) = flume::bounded(config.outbound_queue_capacity);
    let (read_half, write_half) = tokio::io::split(stream);

    let dh = DhExchange::new(&config.dh_parameters);
    let (encrypt_cipher, decrypt_cipher) = cipher::new_pair();

    // Step 1 of the handshake sequence: enqueue the server's DH frame
    // before either pump starts. Treating "enqueued" as "sent" collapses
    // an otherwise cross-task handshake acknowledgment into a single
    // synchronous step; see DESIGN.md.
    let first_frame = dh.create_key_exchange_packet();
    let _ = outbound_tx.try_send(OutboundMessage::Frame(first_frame));
    *shared.state.lock() = ConnectionState::WaitingForDummyPacket;

    tokio::spawn(send_pump(write_half, shared.clone(), encrypt_cipher, outbound_rx));
    tokio::spawn(receive_pump(
        read_half,
        shared.clone(),
        decrypt_cipher,
        dh,
        inbound_tx,
        outbound_tx.clone(),
        raw_buffer_pool,
        frame_buffer_pool,
    ));
    tokio::spawn(health_monitor(shared.clone(), config));

    ConnectionHandle { shared, outbound_tx }
}

const MAX_CONSECUTIVE_ERRORS: u32 = 5;

#[allow(clippy::too_many_arguments)]
async fn receive_pump<R>(
    mut reader: R,
    shared: Arc<ConnectionShared>,
    mut decrypt_cipher: DecryptCipher,
    mut dh: DhExchange,
    inbound_tx: flume::Sender<(ConnectionId, Packet)>,
    outbound_tx: flume::Sender<OutboundMessage>,
    raw_buffer_pool: Arc<BufferPool>,
    frame_buffer_pool: Arc<BufferPool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut raw: Vec<u8> = raw_buffer_pool.rent();
    let mut codec = PacketCodec::with_buffer(frame_buffer_pool.rent());
    let mut read_buf = vec![0u8; 4096];

    loop {
        if shared.state() == ConnectionState::Disconnected {
            break;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => {
                shared.disconnect("server shutdown", true);
                break;
            }
            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        shared.disconnect("peer closed the connection", true);
                        break;
                    }
                    Ok(n) => {
                        shared.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                        *shared.last_activity_at.lock() = Instant::now();
                        shared.consecutive_errors.store(0, Ordering::Relaxed);
                        raw.extend_from_slice(&read_buf[..n]);

                        let outcome = drive_handshake_or_decode(
                            &shared,
                            &mut raw,
                            &mut codec,
                            &mut decrypt_cipher,
                            &mut dh,
                            &outbound_tx,
                        );

                        match outcome {
                            Ok(packets) => {
                                for packet in packets {
                                    shared.packets_rx.fetch_add(1, Ordering::Relaxed);
                                    if inbound_tx.send_async((shared.id(), packet)).await.is_err() {
                                        shared.disconnect("inbound channel closed", true);
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                shared.disconnect(err.to_string(), true);
                                break;
                            }
                        }
                    }
                    Err(e) if is_retryable(&e) => {
                        let attempts = shared.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        if attempts >= MAX_CONSECUTIVE_ERRORS {
                            let err = CoreError::Transport {
                                connection_id: shared.id(),
                                source: e,
                                fatal: true,
                            };
                            shared.disconnect(err.to_string(), true);
                            break;
                        }
                    }
                    Err(e) => {
                        let err = classify_io_error(shared.id(), e);
                        shared.disconnect(err.to_string(), true);
                        break;
                    }
                }
            }
        }
    }

    raw_buffer_pool.release(raw);
    frame_buffer_pool.release(codec.into_buffer());
}

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
    )
}

/// Advances the pre-`Connected` handshake steps, or decodes ordinary
/// frames once `Connected`. Returns any fully-decoded client packets.
fn drive_handshake_or_decode(
    shared: &ConnectionShared,
    raw: &mut Vec<u8>,
    codec: &mut PacketCodec,
    decrypt_cipher: &mut DecryptCipher,
    dh: &mut DhExchange,
    outbound_tx: &flume::Sender<OutboundMessage>,
) -> Result<Vec<Packet>, CoreError> {
    loop {
        match shared.state() {
            ConnectionState::Connecting => {
                // spawn() always leaves WaitingForDummyPacket installed
                // before either pump is polled; nothing to do here.
                return Ok(Vec::new());
            }
            ConnectionState::WaitingForDummyPacket => {
                if !try_consume_dummy_frame(raw, shared.id())? {
                    return Ok(Vec::new());
                }
                *shared.state.lock() = ConnectionState::DhKeyExchange;
            }
            ConnectionState::DhKeyExchange => {
                let packets = codec.decode_frames(raw, decrypt_cipher, shared.id())?;
                let Some(packet) = packets.into_iter().next() else {
                    return Ok(Vec::new());
                };
                let client_key = packet.try_extract_dh_key().ok_or_else(|| CoreError::Protocol {
                    connection_id: shared.id(),
                    message: "DH response frame did not contain a public key".to_owned(),
                })?;
                dh.handle_client_response(&client_key).map_err(|e| CoreError::Protocol {
                    connection_id: shared.id(),
                    message: e.to_string(),
                })?;
                let key = dh.derive_encryption_key().map_err(|e| CoreError::Protocol {
                    connection_id: shared.id(),
                    message: e.to_string(),
                })?;
                decrypt_cipher.generate_key(&key);
                let _ = outbound_tx.send(OutboundMessage::Rekey(key));
                *shared.state.lock() = ConnectionState::Connected;
                info!(connection = %shared.id(), "handshake complete, session key installed");
            }
            ConnectionState::Connected => {
                return codec.decode_frames(raw, decrypt_cipher, shared.id());
            }
            ConnectionState::Disconnected => return Ok(Vec::new()),
        }
    }
}

/// Consumes one size-validated, otherwise-ignored frame, sent unencrypted
/// between the server's DH parameter frame and the client's DH response.
fn try_consume_dummy_frame(raw: &mut Vec<u8>, connection_id: ConnectionId) -> Result<bool, CoreError> {
    if raw.len() < 2 {
        return Ok(false);
    }
    let declared_length = u16::from_le_bytes([raw[0], raw[1]]) as usize;
    let total = declared_length + SIGNATURE_SIZE;
    if total < MIN_FRAME_SIZE || total > MAX_FRAME_SIZE {
        return Err(CoreError::Protocol {
            connection_id,
            message: format!("dummy frame size {total} out of range {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"),
        });
    }
    if raw.len() < total {
        return Ok(false);
    }
    raw.drain(..total);
    Ok(true)
}

async fn send_pump<W>(
    mut writer: W,
    shared: Arc<ConnectionShared>,
    mut encrypt_cipher: EncryptCipher,
    outbound_rx: flume::Receiver<OutboundMessage>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                shared.disconnect("server shutdown", true);
                break;
            }
            message = outbound_rx.recv_async() => {
                let Ok(message) = message else { break; };
                match message {
                    OutboundMessage::Rekey(key) => encrypt_cipher.generate_key(&key),
                    OutboundMessage::Frame(bytes) => {
                        if !write_frame(&mut writer, &shared, &mut encrypt_cipher, &bytes).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Encrypts and writes one frame, retrying linearly on would-block up to
/// 3 times. Returns `false` if the connection should be torn down.
async fn write_frame<W>(
    writer: &mut W,
    shared: &ConnectionShared,
    encrypt_cipher: &mut EncryptCipher,
    bytes: &[u8],
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let mut encrypted = vec![0u8; bytes.len()];
    encrypt_cipher.encrypt(bytes, &mut encrypted);

    let mut attempt: u32 = 0;
    loop {
        match writer.write_all(&encrypted).await {
            Ok(()) => {
                shared.bytes_tx.fetch_add(encrypted.len() as u64, Ordering::Relaxed);
                shared.packets_tx.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(e) if is_retryable(&e) && attempt < 3 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
            }
            Err(e) => {
                let err = classify_io_error(shared.id(), e);
                shared.disconnect(err.to_string(), true);
                return false;
            }
        }
    }
}

async fn health_monitor(shared: Arc<ConnectionShared>, config: Arc<CoreConfig>) {
    let mut ticker = tokio::time::interval(config.health_check_interval);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                shared.disconnect("server shutdown", true);
                break;
            }
            _ = ticker.tick() => {
                if shared.state() == ConnectionState::Disconnected {
                    break;
                }
                if shared.state() != ConnectionState::Connected
                    && shared.handshake_started_at.elapsed() > config.handshake_timeout
                {
                    let err = CoreError::Timeout {
                        connection_id: shared.id(),
                        kind: TimeoutKind::Handshake,
                    };
                    shared.disconnect(err.to_string(), true);
                    break;
                }
                let idle_for = shared.last_activity_at.lock().elapsed();
                if idle_for > config.idle_timeout {
                    let err = CoreError::Timeout {
                        connection_id: shared.id(),
                        kind: TimeoutKind::Idle,
                    };
                    shared.disconnect(err.to_string(), true);
                    break;
                }
            }
        }
    }
}
