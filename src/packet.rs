//! The wire packet container (spec §4.3): a little-endian typed byte
//! buffer with a 4-byte header (`length`, `type`), an 8-byte trailing
//! signature once built, and cursor-based typed accessors.
//!
//! Two construction modes, matching the two places a `Packet` comes from:
//! [`Packet::for_write`] starts a growable, pool-owned buffer for building
//! an outgoing frame; [`Packet::from_bytes`] wraps an already-received
//! frame at a fixed capacity, so that a coding mistake that writes past
//! the end of a parsed frame is caught as [`PacketError::BufferOverflow`]
//! instead of silently reallocating.

use crate::error::PacketError;

pub const HEADER_SIZE: usize = 4;
pub const SIGNATURE_SIZE: usize = 8;
pub const CLIENT_SIGNATURE: &[u8; SIGNATURE_SIZE] = b"TQClient";
pub const SERVER_SIGNATURE: &[u8; SIGNATURE_SIZE] = b"TQServer";

/// Absolute offset of the length-prefixed field read by
/// [`Packet::try_extract_dh_key`]. Preserved verbatim; see the module's
/// doc comment on that method for why this isn't derived from anything
/// else in the frame.
const DH_KEY_FIELD_OFFSET: usize = 11;

#[derive(Debug, Clone)]
pub struct Packet {
    buffer: Vec<u8>,
    cursor: usize,
    fixed_capacity: Option<usize>,
}

impl Packet {
    /// Starts a new outgoing frame: writes a zero length placeholder and
    /// `type_id`, leaves the cursor at the start of the payload.
    /// `capacity` is a sizing hint only; the buffer grows past it freely.
    pub fn for_write(type_id: u16, capacity: usize) -> Self {
        let mut buffer = Vec::with_capacity(capacity.max(HEADER_SIZE));
        buffer.extend_from_slice(&0u16.to_le_bytes());
        buffer.extend_from_slice(&type_id.to_le_bytes());
        Self {
            buffer,
            cursor: HEADER_SIZE,
            fixed_capacity: None,
        }
    }

    /// Wraps an already-framed (or partially buffered) slice of bytes at
    /// a fixed capacity. Used by the codec once it has assembled a
    /// complete decrypted frame.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buffer: bytes.to_vec(),
            cursor: HEADER_SIZE,
            fixed_capacity: Some(bytes.len()),
        }
    }

    pub fn declared_length(&self) -> u16 {
        u16::from_le_bytes([
            self.buffer.first().copied().unwrap_or(0),
            self.buffer.get(1).copied().unwrap_or(0),
        ])
    }

    pub fn packet_type(&self) -> u16 {
        u16::from_le_bytes([
            self.buffer.get(2).copied().unwrap_or(0),
            self.buffer.get(3).copied().unwrap_or(0),
        ])
    }

    fn data_length(&self) -> usize {
        self.buffer.len()
    }

    fn signature_bytes(&self) -> Option<&[u8]> {
        let length = self.declared_length() as usize;
        if length < HEADER_SIZE {
            return None;
        }
        let total = length.checked_add(SIGNATURE_SIZE)?;
        self.buffer.get(length..total)
    }

    pub fn is_complete(&self) -> bool {
        self.signature_bytes().is_some()
    }

    pub fn is_client_packet(&self) -> bool {
        self.signature_bytes() == Some(CLIENT_SIGNATURE.as_slice())
    }

    pub fn is_server_packet(&self) -> bool {
        self.signature_bytes() == Some(SERVER_SIGNATURE.as_slice())
    }

    pub fn seek(&mut self, abs: usize) {
        self.cursor = abs;
    }

    pub fn seek_to_payload(&mut self, offset: usize) {
        self.seek(HEADER_SIZE + offset);
    }

    pub fn skip(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes between the cursor and the end of the payload, excluding the
    /// trailing signature once the frame is complete.
    pub fn remaining_bytes(&self) -> usize {
        let end = if self.is_complete() {
            self.declared_length() as usize
        } else {
            self.data_length()
        };
        end.saturating_sub(self.cursor)
    }

    fn read_slice(&mut self, n: usize) -> Result<&[u8], PacketError> {
        let start = self.cursor;
        let end = start
            .checked_add(n)
            .filter(|&end| end <= self.data_length())
            .ok_or(PacketError::InvalidPacket {
                offset: start,
                requested: n,
                length: self.data_length(),
            })?;
        self.cursor = end;
        Ok(&self.buffer[start..end])
    }

    fn write_slice(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let start = self.cursor;
        let end = start + bytes.len();
        if end > self.buffer.len() {
            // A fixed-capacity (caller-provided) buffer is always already
            // sized to its capacity, so needing to grow past `len` here
            // means growing past `capacity` too.
            if let Some(capacity) = self.fixed_capacity {
                return Err(PacketError::BufferOverflow {
                    offset: start,
                    requested: bytes.len(),
                    capacity,
                });
            }
            self.reserve_capacity(end);
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(bytes);
        self.cursor = end;
        Ok(())
    }

    /// Doubles the underlying allocation until it can hold `min_capacity`
    /// bytes, without growing the buffer's logical (meaningful) length —
    /// that's `write_slice`'s job via `resize`.
    fn reserve_capacity(&mut self, min_capacity: usize) {
        if self.buffer.capacity() >= min_capacity {
            return;
        }
        let mut new_capacity = self.buffer.capacity().max(1);
        while new_capacity < min_capacity {
            new_capacity *= 2;
        }
        self.buffer.reserve(new_capacity - self.buffer.len());
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, PacketError> {
        Ok(self.read_slice(n)?.to_vec())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        self.write_slice(bytes)
    }

    /// Reads up to `n` bytes, truncates at the first NUL, decodes as UTF-8.
    pub fn read_string(&mut self, n: usize) -> Result<String, PacketError> {
        let bytes = self.read_slice(n)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Writes `s` into a fixed-width field of `width` bytes, padded with
    /// trailing NULs. `s` is truncated if it doesn't fit.
    pub fn write_string(&mut self, s: &str, width: usize) -> Result<(), PacketError> {
        let mut field = vec![0u8; width];
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        field[..n].copy_from_slice(&bytes[..n]);
        self.write_slice(&field)
    }

    /// Writes the trailing server signature, back-patches the header, and
    /// truncates the buffer to the final frame size.
    pub fn build(mut self, type_id: u16) -> Packet {
        self.write_slice(SERVER_SIGNATURE)
            .expect("a growable, server-authored packet never overflows");
        let total = self.cursor;
        let length = (total - SIGNATURE_SIZE) as u16;
        self.buffer[0..2].copy_from_slice(&length.to_le_bytes());
        self.buffer[2..4].copy_from_slice(&type_id.to_le_bytes());
        self.buffer.truncate(total);
        self.fixed_capacity = Some(total);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Extracts the client's DH public key from a handshake response
    /// frame: seeks to offset 11, reads a 32-bit length `L`, jumps to
    /// `L + 4 + 11`, reads a 32-bit key length `K`, reads `K` ASCII bytes.
    /// This never touches `self.cursor` and fails cleanly on any bounds
    /// violation — malformed handshake frames are common (probes, stale
    /// clients) and must not panic the receive pump.
    pub fn try_extract_dh_key(&self) -> Option<String> {
        let read_u32_at = |pos: usize| -> Option<u32> {
            let end = pos.checked_add(4)?;
            let bytes = self.buffer.get(pos..end)?;
            Some(u32::from_le_bytes(bytes.try_into().ok()?))
        };

        let length = read_u32_at(DH_KEY_FIELD_OFFSET)? as usize;
        let key_len_offset = length.checked_add(4)?.checked_add(DH_KEY_FIELD_OFFSET)?;
        let key_len = read_u32_at(key_len_offset)? as usize;
        let key_start = key_len_offset.checked_add(4)?;
        let key_end = key_start.checked_add(key_len)?;

        let bytes = self.buffer.get(key_start..key_end)?;
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    }

    /// Decodes the payload (offset 4 through `declared_length`) as `T`.
    pub fn deserialize_proto<T: prost::Message + Default>(&self) -> Result<T, PacketError> {
        let length = self.declared_length() as usize;
        let payload = self
            .buffer
            .get(HEADER_SIZE..length)
            .ok_or_else(|| PacketError::ProtoDecode("payload out of bounds".to_owned()))?;
        T::decode(payload).map_err(|e| PacketError::ProtoDecode(e.to_string()))
    }

    /// Positions the cursor at offset 4 and writes `msg`'s encoded bytes
    /// contiguously from there.
    pub fn serialize_proto<T: prost::Message>(&mut self, msg: &T) -> Result<(), PacketError> {
        self.cursor = HEADER_SIZE;
        let mut encoded = Vec::with_capacity(msg.encoded_len());
        msg.encode(&mut encoded)
            .expect("encoding into a Vec<u8> is infallible per prost::Message::encode");
        self.write_slice(&encoded)
    }
}

macro_rules! impl_typed_accessors {
    ($( $read:ident, $write:ident, $ty:ty );* $(;)?) => {
        impl Packet {
            $(
                pub fn $read(&mut self) -> Result<$ty, PacketError> {
                    let size = std::mem::size_of::<$ty>();
                    let bytes = self.read_slice(size)?;
                    Ok(<$ty>::from_le_bytes(bytes.try_into().expect("read_slice returns exactly `size` bytes")))
                }

                pub fn $write(&mut self, value: $ty) -> Result<(), PacketError> {
                    self.write_slice(&value.to_le_bytes())
                }
            )*
        }
    };
}

impl_typed_accessors! {
    read_u8, write_u8, u8;
    read_i8, write_i8, i8;
    read_u16, write_u16, u16;
    read_i16, write_i16, i16;
    read_u32, write_u32, u32;
    read_i32, write_i32, i32;
    read_u64, write_u64, u64;
    read_i64, write_i64, i64;
    read_f32, write_f32, f32;
    read_f64, write_f64, f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_writes_signature_and_backpatches_header() {
        let mut packet = Packet::for_write(10, 32);
        packet.write_u64(0x0102030405060708).unwrap();
        let bytes = packet.build(10).into_bytes();

        assert_eq!(&bytes[bytes.len() - SIGNATURE_SIZE..], SERVER_SIGNATURE);
        let length = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(length as usize + SIGNATURE_SIZE, bytes.len());
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 10);
    }

    #[test]
    fn is_complete_recognizes_both_signatures() {
        let mut client_bytes = vec![0u8; 12];
        client_bytes[0..2].copy_from_slice(&4u16.to_le_bytes());
        client_bytes[4..12].copy_from_slice(CLIENT_SIGNATURE);
        let packet = Packet::from_bytes(&client_bytes);
        assert!(packet.is_complete());
        assert!(packet.is_client_packet());
        assert!(!packet.is_server_packet());
    }

    #[test]
    fn is_complete_false_on_short_buffer() {
        let packet = Packet::from_bytes(&[1, 2, 3]);
        assert!(!packet.is_complete());
    }

    #[test]
    fn read_beyond_data_length_is_invalid_packet_not_panic() {
        let mut packet = Packet::from_bytes(&[0u8; 4]);
        packet.seek(0);
        let err = packet.read_u64().unwrap_err();
        assert!(matches!(err, PacketError::InvalidPacket { .. }));
    }

    #[test]
    fn write_beyond_fixed_capacity_overflows() {
        let mut packet = Packet::from_bytes(&[0u8; 4]);
        packet.seek(0);
        let err = packet.write_bytes(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, PacketError::BufferOverflow { .. }));
    }

    #[test]
    fn growable_packet_doubles_past_initial_capacity() {
        let mut packet = Packet::for_write(1, 4);
        let payload = vec![7u8; 64];
        packet.write_bytes(&payload).unwrap();
        assert_eq!(packet.cursor(), HEADER_SIZE + payload.len());
    }

    #[test]
    fn read_string_truncates_at_nul() {
        let mut packet = Packet::for_write(1, 16);
        packet.write_string("hi", 8).unwrap();
        packet.seek_to_payload(0);
        assert_eq!(packet.read_string(8).unwrap(), "hi");
    }

    #[test]
    fn try_extract_dh_key_reads_the_documented_offsets() {
        let mut packet = Packet::for_write(1052, 64);
        packet.write_bytes(&[0u8; 7]).unwrap();
        packet.write_u32(1).unwrap();
        packet.write_bytes(b"F").unwrap();
        packet.write_u32(4).unwrap();
        packet.write_bytes(b"CAFE").unwrap();
        let built = packet.build(1052);

        assert_eq!(built.try_extract_dh_key().as_deref(), Some("CAFE"));
    }

    #[test]
    fn try_extract_dh_key_fails_cleanly_on_truncated_frame() {
        let packet = Packet::from_bytes(&[0u8; 4]);
        assert_eq!(packet.try_extract_dh_key(), None);
    }

    #[test]
    fn deserialize_proto_round_trips_prost_message() {
        #[derive(Clone, PartialEq, prost::Message)]
        struct Ping {
            #[prost(uint32, tag = "1")]
            value: u32,
        }

        let mut packet = Packet::for_write(5, 16);
        packet.serialize_proto(&Ping { value: 99 }).unwrap();
        let built = packet.build(5);

        let decoded: Ping = built.deserialize_proto().unwrap();
        assert_eq!(decoded.value, 99);
    }
}
