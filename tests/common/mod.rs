//! Shared handshake-driving helpers for the integration tests in this
//! directory. Every test here drives a connection over an in-memory
//! `tokio::io::duplex` pair, registered directly against a running
//! [`Core`]'s dispatcher via `ConnectionManager::accept_stream`, instead
//! of standing up a real socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use cast5::Cast5;
use cfb8::cipher::generic_array::GenericArray;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use cfb8::{Decryptor, Encryptor};
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use std::sync::Arc;

use tq_core::{
    AuthPolicy, ConnectionHandle, ConnectionManager, Core, CoreConfig, HandlerMode, HandlerRegistry,
    PermissiveAuthPolicy,
};

pub const KEY_SIZE: usize = 16;
const SEED_KEY: [u8; KEY_SIZE] = *b"R3Xx97ra5j8D6uZz";
pub const CLIENT_SIGNATURE: &[u8; 8] = b"TQClient";
const DUPLEX_BUFFER: usize = 8192;

/// A persistent CAST5/CFB-8 encrypt half, mirroring `cipher::EncryptCipher`:
/// the keystream advances across calls, it isn't restarted per frame.
pub struct ClientCipher(Encryptor<Cast5>);

impl ClientCipher {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self(Encryptor::<Cast5>::new(key.into(), &[0u8; 8].into()))
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        for chunk in out.chunks_mut(Encryptor::<Cast5>::block_size()) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        out
    }
}

fn cast5_decrypt_once(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Vec<u8> {
    let mut cipher = Decryptor::<Cast5>::new(key.into(), &[0u8; 8].into());
    let mut out = ciphertext.to_vec();
    for chunk in out.chunks_mut(Decryptor::<Cast5>::block_size()) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    out
}

fn cast5_encrypt_once(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    ClientCipher::new(key).encrypt(plaintext)
}

/// Plaintext of a minimal, signed client frame (no payload) of
/// `packet_type` — the caller encrypts it through the session
/// [`ClientCipher`] `complete_handshake` returns.
pub fn client_frame_plaintext(packet_type: u16) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(12);
    plaintext.extend_from_slice(&4u16.to_le_bytes());
    plaintext.extend_from_slice(&packet_type.to_le_bytes());
    plaintext.extend_from_slice(CLIENT_SIGNATURE);
    plaintext
}

/// Minimum legal frame size (12 bytes), sent unencrypted between the
/// server's DH parameter frame and the client's DH response.
fn build_dummy_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame[0..2].copy_from_slice(&4u16.to_le_bytes());
    frame
}

/// Extracts the server's public key hex from its (seed-key encrypted,
/// now decrypted) first handshake frame — the same two-field shape and
/// offsets `Packet::try_extract_dh_key` reads.
fn extract_server_public_key_hex(decrypted: &[u8]) -> String {
    const DH_KEY_FIELD_OFFSET: usize = 11;
    let read_u32_at = |pos: usize| u32::from_le_bytes(decrypted[pos..pos + 4].try_into().unwrap()) as usize;

    let opaque_len = read_u32_at(DH_KEY_FIELD_OFFSET);
    let key_len_offset = DH_KEY_FIELD_OFFSET + 4 + opaque_len;
    let key_len = read_u32_at(key_len_offset);
    let key_start = key_len_offset + 4;
    String::from_utf8(decrypted[key_start..key_start + key_len].to_vec()).unwrap()
}

fn build_dh_response_frame(client_public: &BigUint) -> Vec<u8> {
    let reserved = [0u8; 7];
    let opaque_field = b"p:2";
    let public_key_hex = client_public.to_str_radix(16);

    let mut payload = Vec::new();
    payload.extend_from_slice(&reserved);
    payload.extend_from_slice(&(opaque_field.len() as u32).to_le_bytes());
    payload.extend_from_slice(opaque_field);
    payload.extend_from_slice(&(public_key_hex.len() as u32).to_le_bytes());
    payload.extend_from_slice(public_key_hex.as_bytes());

    let total = 4 + payload.len() + 8;
    let declared_length = (total - 8) as u16;

    let mut plaintext = Vec::new();
    plaintext.extend_from_slice(&declared_length.to_le_bytes());
    plaintext.extend_from_slice(&1052u16.to_le_bytes());
    plaintext.extend_from_slice(&payload);
    plaintext.extend_from_slice(CLIENT_SIGNATURE);

    cast5_encrypt_once(&SEED_KEY, &plaintext)
}

/// Drives the full handshake sequence over `client`'s half of a duplex
/// pair: reads the server's real DH parameter frame, answers with a real
/// Diffie-Hellman response computed from it, and returns a cipher keyed
/// with the negotiated session key so the caller can send further,
/// correctly encrypted packets.
pub async fn complete_handshake(client: &mut DuplexStream, config: &CoreConfig) -> ClientCipher {
    let p: BigUint = config.dh_parameters.p.parse().expect("p is decimal");
    let g: BigUint = config.dh_parameters.g.parse().expect("g is decimal");

    let mut read_buf = vec![0u8; DUPLEX_BUFFER];
    let n = client.read(&mut read_buf).await.expect("read server DH frame");
    let decrypted = cast5_decrypt_once(&SEED_KEY, &read_buf[..n]);
    let server_public_hex = extract_server_public_key_hex(&decrypted);
    let server_public = BigUint::parse_bytes(server_public_hex.as_bytes(), 16).expect("valid hex pubkey");

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let client_private = BigUint::from_bytes_be(&seed) % &p;
    let client_public = g.modpow(&client_private, &p);
    let shared_secret = server_public.modpow(&client_private, &p);
    let digest = Sha256::digest(shared_secret.to_bytes_be());
    let mut session_key = [0u8; KEY_SIZE];
    session_key.copy_from_slice(&digest[..KEY_SIZE]);

    client.write_all(&build_dummy_frame()).await.unwrap();
    client.write_all(&build_dh_response_frame(&client_public)).await.unwrap();

    ClientCipher::new(&session_key)
}

/// Spawns a `Core` in the background and registers one connection
/// against it over a fresh duplex pair, returning the client-facing
/// half, the handle the manager tracks, the manager itself, and the
/// config the connection was built from (for `complete_handshake`).
pub async fn spawn_core_with_one_connection(
    registry: HandlerRegistry,
    handler_mode: HandlerMode,
) -> (DuplexStream, ConnectionHandle, ConnectionManager, CoreConfig) {
    spawn_core_with_one_connection_and_auth(registry, handler_mode, Arc::new(PermissiveAuthPolicy)).await
}

/// Like [`spawn_core_with_one_connection`], but lets the caller supply a
/// non-default [`AuthPolicy`] — used to exercise the auth stage's
/// short-circuit instead of its permissive default.
pub async fn spawn_core_with_one_connection_and_auth(
    registry: HandlerRegistry,
    handler_mode: HandlerMode,
    auth: Arc<dyn AuthPolicy>,
) -> (DuplexStream, ConnectionHandle, ConnectionManager, CoreConfig) {
    let config = CoreConfig {
        listen_port: 0,
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        handler_mode,
        ..CoreConfig::default()
    };

    let core = Core::with_auth_policy(config.clone(), registry, auth);
    let manager = core.manager().clone();
    let inbound_tx = core.inbound_sender();
    tokio::spawn(core.run());
    tokio::task::yield_now().await;

    let (server_side, client_side) = tokio::io::duplex(DUPLEX_BUFFER);
    let peer_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let handle = manager.accept_stream(server_side, peer_addr, inbound_tx);

    (client_side, handle, manager, config)
}
