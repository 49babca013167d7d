//! Shared free-list of receive/decrypt buffers (spec §4.2's resource
//! model), reused across connections instead of allocated fresh per
//! connection.
//!
//! `valence_protocol`'s `PacketEncoder`/`PacketDecoder` already avoid
//! reallocating by clearing and keeping a buffer's capacity across calls
//! within one connection's lifetime; this extends the same idea across
//! connections, so a buffer a closed connection no longer needs becomes
//! the next accepted connection's rented buffer instead of more heap
//! churn on every accept.

use parking_lot::Mutex;

use crate::codec::MAX_FRAME_SIZE;

/// Upper bound on how many idle buffers the pool keeps around per class.
/// Past this, a returned buffer is just dropped rather than retained —
/// a burst of short-lived connections shouldn't pin memory indefinitely.
const MAX_IDLE_BUFFERS: usize = 256;

/// Bounded free-list of same-purpose `Vec<u8>` buffers. One instance
/// backs all receive-pump raw buffers; a second backs all codec
/// decrypted-frame accumulators, since the two never trade buffers with
/// each other.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(MAX_IDLE_BUFFERS)),
        }
    }

    /// Rents an empty buffer with at least `MAX_FRAME_SIZE` bytes of
    /// capacity, reusing one a previous connection returned if the
    /// free-list has one.
    pub fn rent(&self) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(MAX_FRAME_SIZE));
        buf.clear();
        buf
    }

    /// Returns a buffer for the next rental. Dropped instead of pooled
    /// once the free-list is already at [`MAX_IDLE_BUFFERS`].
    pub fn release(&self, mut buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE_BUFFERS {
            buf.clear();
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
