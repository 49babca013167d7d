//! The TQ-variant CAST5 stream cipher (spec §4.1).
//!
//! Mirrors the shape of `valence_protocol`'s `PacketEncoder`/`PacketDecoder`
//! cipher fields (`cfb8::Encryptor<aes::Aes128>` / `cfb8::Cfb8<aes::Aes128>`,
//! enabled once via `enable_encryption(key)` and then applied a block at a
//! time over the wire buffer), but swaps the block cipher for CAST5 and
//! splits encrypt/decrypt into two independently-owned halves: spec §5
//! requires the receive-pump (decrypt) and send-pump (encrypt) to progress
//! without contending on a lock, and a type that can't be shared can't be
//! locked by accident.

use cast5::Cast5;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use cfb8::{Decryptor, Encryptor};

/// Key size used for both the handshake seed key and every derived session
/// key. CAST5 supports 40-128 bit keys; 128 bits matches the length of the
/// fixed seed constant below.
pub const KEY_SIZE: usize = 16;

/// The fixed ASCII seed used for every connection before the DH-derived
/// session key is installed.
pub const SEED_KEY: &[u8; KEY_SIZE] = b"R3Xx97ra5j8D6uZz";

type CastEncryptor = Encryptor<Cast5>;
type CastDecryptor = Decryptor<Cast5>;

/// TQ's variant carries no separate nonce; every session starts its
/// keystream from the all-zero block.
const ZERO_IV: [u8; 8] = [0u8; 8];

/// The encrypt half of a connection's stream cipher. Owned exclusively by
/// the send-pump task.
pub struct EncryptCipher {
    key: [u8; KEY_SIZE],
    state: Option<CastEncryptor>,
}

/// The decrypt half of a connection's stream cipher. Owned exclusively by
/// the receive-pump task.
pub struct DecryptCipher {
    key: [u8; KEY_SIZE],
    state: Option<CastDecryptor>,
}

/// Builds a connection's initial encrypt/decrypt halves, both keyed with
/// the fixed handshake seed.
pub fn new_pair() -> (EncryptCipher, DecryptCipher) {
    (EncryptCipher::with_seed_key(), DecryptCipher::with_seed_key())
}

fn pad_key(seed: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    let n = seed.len().min(KEY_SIZE);
    key[..n].copy_from_slice(&seed[..n]);
    key
}

impl EncryptCipher {
    pub fn with_seed_key() -> Self {
        let mut cipher = Self {
            key: [0u8; KEY_SIZE],
            state: None,
        };
        cipher.generate_key(SEED_KEY);
        cipher
    }

    /// Installs `seed` as the active key and restarts the keystream.
    /// `seed` is truncated or zero-padded to [`KEY_SIZE`] bytes.
    pub fn generate_key(&mut self, seed: &[u8]) {
        self.key = pad_key(seed);
        self.reset();
    }

    /// Restarts the keystream from the current key without changing it.
    pub fn reset(&mut self) {
        self.state = Some(CastEncryptor::new(&self.key.into(), &ZERO_IV.into()));
    }

    pub fn initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Encrypts `input` into `output`. Panics if the lengths differ or the
    /// cipher has not been keyed — per spec, invalid-length input is a
    /// programmer bug, not a runtime error.
    pub fn encrypt(&mut self, input: &[u8], output: &mut [u8]) {
        assert_eq!(input.len(), output.len(), "encrypt: length mismatch");
        output.copy_from_slice(input);
        let state = self
            .state
            .as_mut()
            .expect("EncryptCipher::encrypt called before generate_key");
        for chunk in output.chunks_mut(CastEncryptor::block_size()) {
            state.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
    }
}

impl DecryptCipher {
    pub fn with_seed_key() -> Self {
        let mut cipher = Self {
            key: [0u8; KEY_SIZE],
            state: None,
        };
        cipher.generate_key(SEED_KEY);
        cipher
    }

    pub fn generate_key(&mut self, seed: &[u8]) {
        self.key = pad_key(seed);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.state = Some(CastDecryptor::new(&self.key.into(), &ZERO_IV.into()));
    }

    pub fn initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Decrypts `input` into `output`. Panics if the lengths differ or the
    /// cipher has not been keyed.
    pub fn decrypt(&mut self, input: &[u8], output: &mut [u8]) {
        assert_eq!(input.len(), output.len(), "decrypt: length mismatch");
        output.copy_from_slice(input);
        let state = self
            .state
            .as_mut()
            .expect("DecryptCipher::decrypt called before generate_key");
        for chunk in output.chunks_mut(CastDecryptor::block_size()) {
            state.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
    }
}

impl Default for EncryptCipher {
    fn default() -> Self {
        Self::with_seed_key()
    }
}

impl Default for DecryptCipher {
    fn default() -> Self {
        Self::with_seed_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initialized_with_seed_key() {
        let (enc, dec) = new_pair();
        assert!(enc.initialized());
        assert!(dec.initialized());
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (mut enc_side, _) = new_pair();
        let (_, mut dec_side) = new_pair();

        let plain = b"the quick brown fox jumps over a lazy dog!!".to_vec();
        let mut cipher_text = vec![0u8; plain.len()];
        enc_side.encrypt(&plain, &mut cipher_text);

        let mut round_tripped = vec![0u8; plain.len()];
        dec_side.decrypt(&cipher_text, &mut round_tripped);

        assert_eq!(plain, round_tripped);
        assert_ne!(plain, cipher_text);
    }

    #[test]
    fn reset_restarts_the_keystream_from_the_same_key() {
        let (mut a, _) = new_pair();
        let (mut b, _) = new_pair();

        let plain = b"0123456789abcdef".to_vec();
        let mut out_a = vec![0u8; plain.len()];
        a.encrypt(&plain, &mut out_a);

        // Consume some keystream on `a`, then reset it back to a fresh
        // stream keyed the same way `b` still is.
        let mut scratch = vec![0u8; plain.len()];
        a.encrypt(&plain, &mut scratch);
        a.reset();

        let mut out_a_after_reset = vec![0u8; plain.len()];
        a.encrypt(&plain, &mut out_a_after_reset);

        let mut out_b = vec![0u8; plain.len()];
        b.encrypt(&plain, &mut out_b);

        assert_eq!(out_a, out_a_after_reset);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn generate_key_installs_new_session_key() {
        let (mut cipher, _) = new_pair();
        let derived_key = [7u8; KEY_SIZE];
        cipher.generate_key(&derived_key);
        assert!(cipher.initialized());

        let (mut other, _) = new_pair();
        other.generate_key(&derived_key);

        let plain = b"session key check".to_vec();
        let mut a = vec![0u8; plain.len()];
        cipher.encrypt(&plain, &mut a);
        let mut b = vec![0u8; plain.len()];
        other.encrypt(&plain, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn encrypt_panics_on_length_mismatch() {
        let (mut cipher, _) = new_pair();
        let input = [0u8; 4];
        let mut output = [0u8; 5];
        cipher.encrypt(&input, &mut output);
    }
}
