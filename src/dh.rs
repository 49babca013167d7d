//! Diffie-Hellman key exchange (spec §4.2).
//!
//! Modeled the way the teacher derives and checks keyed secrets in
//! `connect.rs::login_online` (an RSA shared-secret exchange, hashed and
//! compared with `sha1`/`sha2`) but swapped for a DH exchange over
//! `num_bigint`, since the wire protocol here calls for DH rather than
//! RSA-wrapped secrets.

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::cipher::KEY_SIZE;
use crate::config::DhParameters;
use crate::packet::Packet;

/// Application message type used for the server's DH parameter frame and
/// the client's DH response frame.
pub const DH_EXCHANGE_PACKET_TYPE: u16 = 1052;

/// Per-connection Diffie-Hellman exchange. One instance is created when a
/// connection begins handshaking and discarded once the session key has
/// been derived.
pub struct DhExchange {
    p: BigUint,
    g: BigUint,
    private_key: BigUint,
    public_key: BigUint,
    client_public_key: Option<BigUint>,
}

impl DhExchange {
    /// Creates a new exchange using the process-wide `(P, G)` parameters,
    /// generating a fresh private key.
    pub fn new(parameters: &DhParameters) -> Self {
        let p = parameters.p();
        let g = parameters.g();

        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        // A private exponent doesn't need to be uniform over the full range
        // of P; reducing a wide random value mod P is the standard way to
        // fold randomness into the group's domain.
        let private_key = BigUint::from_bytes_be(&seed) % &p;
        let public_key = g.modpow(&private_key, &p);

        Self {
            p,
            g,
            private_key,
            public_key,
            client_public_key: None,
        }
    }

    /// Builds the server's first handshake frame: a Packet carrying P and
    /// G as one opaque, length-prefixed field followed by the server's
    /// public key as a second length-prefixed field, laid out at the same
    /// absolute offset that [`Packet::try_extract_dh_key`] expects on the
    /// client's response frame — which follows the same two-field shape
    /// (an opaque first field, the public key second).
    pub fn create_key_exchange_packet(&self) -> Vec<u8> {
        let parameters_hex = format!("{}:{}", self.p.to_str_radix(16), self.g.to_str_radix(16));
        let pub_hex = self.public_key.to_str_radix(16);

        // 7 reserved bytes bring the first length-prefixed field to the
        // documented absolute offset 11 (4-byte header + 7).
        let mut packet = Packet::for_write(DH_EXCHANGE_PACKET_TYPE, 256);
        packet
            .write_bytes(&[0u8; 7])
            .expect("growable packet cannot overflow");
        write_length_prefixed(&mut packet, parameters_hex.as_bytes());
        write_length_prefixed(&mut packet, pub_hex.as_bytes());
        packet.build(DH_EXCHANGE_PACKET_TYPE).into_bytes()
    }

    /// Ingests the client's public key, extracted by the caller via
    /// [`Packet::try_extract_dh_key`] from the client's DH response frame.
    pub fn handle_client_response(&mut self, client_public_hex: &str) -> anyhow::Result<()> {
        let key = BigUint::parse_bytes(client_public_hex.as_bytes(), 16)
            .ok_or_else(|| anyhow::anyhow!("client public key is not valid hex"))?;
        anyhow::ensure!(key > BigUint::from(1u32), "client public key is degenerate");
        self.client_public_key = Some(key);
        Ok(())
    }

    /// Computes the shared secret and hashes it down to a fixed-length
    /// session key suitable for [`crate::cipher::Cipher::generate_key`].
    pub fn derive_encryption_key(&self) -> anyhow::Result<[u8; KEY_SIZE]> {
        let client_public = self
            .client_public_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("client public key not yet received"))?;

        let shared_secret = client_public.modpow(&self.private_key, &self.p);
        let digest = Sha256::digest(shared_secret.to_bytes_be());

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest[..KEY_SIZE]);
        Ok(key)
    }
}

fn write_length_prefixed(packet: &mut Packet, bytes: &[u8]) {
    packet
        .write_u32(bytes.len() as u32)
        .expect("growable packet cannot overflow");
    packet
        .write_bytes(bytes)
        .expect("growable packet cannot overflow");
}
