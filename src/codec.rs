//! Frames and decrypts inbound bytes into complete `Packet`s (spec §4.4).
//!
//! Decryption is stateful: the stream cipher's keystream advances with
//! every byte fed to it, so a partial frame must never be decrypted past
//! what's actually been committed to the accumulator. `PacketCodec` keeps
//! that accumulator across calls so a frame split across several socket
//! reads is decrypted exactly once, in order, as bytes arrive.

use tracing::debug;

use crate::cipher::DecryptCipher;
use crate::connection::ConnectionId;
use crate::error::CoreError;
use crate::packet::{Packet, HEADER_SIZE, SIGNATURE_SIZE};

pub const MIN_FRAME_SIZE: usize = 12;
pub const MAX_FRAME_SIZE: usize = 1024;

/// Caps frames decoded per call so one very chatty connection can't
/// starve the receive-pump's ability to service its socket read.
const MAX_FRAMES_PER_CALL: usize = 10;

pub struct PacketCodec {
    /// Decrypted bytes of the in-flight frame. Reset to empty once a
    /// frame is fully assembled, per the "never holds more than one
    /// in-flight frame" invariant.
    decrypted: Vec<u8>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            decrypted: Vec::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Builds a codec around a pool-rented accumulator instead of
    /// allocating a fresh one, so the connection's decrypted-frame buffer
    /// comes from [`crate::pool::BufferPool`] rather than the heap.
    pub fn with_buffer(decrypted: Vec<u8>) -> Self {
        Self { decrypted }
    }

    /// Hands the accumulator back so the caller can return it to the
    /// pool it was rented from. Called once, on pump teardown.
    pub fn into_buffer(self) -> Vec<u8> {
        self.decrypted
    }

    /// Drains as many complete frames as possible (up to
    /// [`MAX_FRAMES_PER_CALL`]) out of `raw`, decrypting through `cipher`
    /// as needed, and shifting `raw` to discard consumed bytes.
    pub fn decode_frames(
        &mut self,
        raw: &mut Vec<u8>,
        cipher: &mut DecryptCipher,
        connection_id: ConnectionId,
    ) -> Result<Vec<Packet>, CoreError> {
        let mut packets = Vec::new();
        for _ in 0..MAX_FRAMES_PER_CALL {
            match self.decode_one(raw, cipher, connection_id)? {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }
        Ok(packets)
    }

    fn decode_one(
        &mut self,
        raw: &mut Vec<u8>,
        cipher: &mut DecryptCipher,
        connection_id: ConnectionId,
    ) -> Result<Option<Packet>, CoreError> {
        if self.decrypted.len() < HEADER_SIZE {
            let needed = HEADER_SIZE - self.decrypted.len();
            self.decrypt_into_accumulator(raw, cipher, needed);
        }
        if self.decrypted.len() < HEADER_SIZE {
            return Ok(None);
        }

        let declared_length =
            u16::from_le_bytes([self.decrypted[0], self.decrypted[1]]) as usize;
        let total = declared_length + SIGNATURE_SIZE;

        if total < MIN_FRAME_SIZE || total > MAX_FRAME_SIZE {
            return Err(CoreError::Protocol {
                connection_id,
                message: format!(
                    "frame size {total} out of range {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"
                ),
            });
        }

        let still_needed = total.saturating_sub(self.decrypted.len());
        if raw.len() < still_needed {
            return Ok(None);
        }

        self.decrypt_into_accumulator(raw, cipher, still_needed);

        let packet = Packet::from_bytes(&self.decrypted[..total]);
        self.decrypted.clear();

        if packet.is_complete() && packet.is_client_packet() {
            Ok(Some(packet))
        } else {
            debug!(
                connection = %connection_id,
                "dropping frame that is not a complete, client-signed packet"
            );
            Ok(None)
        }
    }

    fn decrypt_into_accumulator(&mut self, raw: &mut Vec<u8>, cipher: &mut DecryptCipher, n: usize) {
        let n = n.min(raw.len());
        if n == 0 {
            return;
        }
        let mut out = vec![0u8; n];
        cipher.decrypt(&raw[..n], &mut out);
        self.decrypted.extend_from_slice(&out);
        raw.drain(..n);
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}
