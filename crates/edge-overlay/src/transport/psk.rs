//! Pre-shared-key session negotiation.
//!
//! ## Handshake
//! 1. Client → Server: `client_nonce(32) ‖ identity`
//! 2. Server looks up the key for `identity`; unknown identities are dropped.
//! 3. Server → Client: `server_nonce(32)`
//! 4. Both derive `SHA-256(psk ‖ client_nonce ‖ server_nonce)` as the session key.
//! 5. Client → Server: sealed client confirmation; Server → Client: sealed
//!    server confirmation.
//!
//! Every frame after the handshake is sealed with AES-256-GCM and carries
//! its random 12-byte nonce in front of the ciphertext.
//!
//! ## Key file format
//! - One `identity:hex-key` entry per line
//! - Lines starting with `#` are comments, empty lines are ignored
//! - Inline comments after `#` are supported

use crate::error::{OverlayError, OverlayResult};
use crate::framing::{read_message, write_message};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Size of the handshake nonces.
pub const HANDSHAKE_NONCE_LEN: usize = 32;

/// Size of the AES-GCM nonce prepended to every sealed frame.
pub const SEAL_NONCE_LEN: usize = 12;

/// Bytes added to every sealed frame (nonce + tag).
pub const SEAL_OVERHEAD: usize = SEAL_NONCE_LEN + 16;

/// Minimum accepted key length.
pub const MIN_PSK_LEN: usize = 16;

const MAX_IDENTITY_LEN: usize = 128;
const CLIENT_CONFIRM: &[u8] = b"edge-overlay psk client";
const SERVER_CONFIRM: &[u8] = b"edge-overlay psk server";

/// Source of pre-shared keys.
///
/// The client side presents `identity()` and `key()`; the server side
/// resolves the identity a client presents with `lookup()`.
pub trait PskProvider: Send + Sync {
    /// Identity presented when dialing.
    fn identity(&self) -> &str;

    /// Key used when dialing.
    fn key(&self) -> &[u8];

    /// Key for a connecting client's identity, if known.
    fn lookup(&self, identity: &str) -> Option<Vec<u8>>;
}

/// In-memory PSK table.
#[derive(Clone)]
pub struct StaticPskProvider {
    identity: String,
    key: Vec<u8>,
    peers: HashMap<String, Vec<u8>>,
}

impl std::fmt::Debug for StaticPskProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPskProvider")
            .field("identity", &self.identity)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl StaticPskProvider {
    /// Provider with a single identity, accepted on both sides.
    pub fn new(identity: impl Into<String>, key: impl Into<Vec<u8>>) -> OverlayResult<Self> {
        let identity = identity.into();
        let key = key.into();
        validate_entry(&identity, &key)?;
        let mut peers = HashMap::new();
        peers.insert(identity.clone(), key.clone());
        Ok(Self {
            identity,
            key,
            peers,
        })
    }

    /// Provider from a hex-encoded key.
    pub fn from_hex(identity: impl Into<String>, hex_key: &str) -> OverlayResult<Self> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| OverlayError::config_with_source("PSK is not valid hex", e))?;
        Self::new(identity, key)
    }

    /// Accept an additional client identity.
    pub fn with_peer(mut self, identity: impl Into<String>, key: impl Into<Vec<u8>>) -> OverlayResult<Self> {
        let identity = identity.into();
        let key = key.into();
        validate_entry(&identity, &key)?;
        self.peers.insert(identity, key);
        Ok(self)
    }

    /// Load a key file. The first entry is the dialing identity.
    pub fn load_file(path: &Path) -> OverlayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OverlayError::config_with_source(
                format!("Failed to read PSK file {}", path.display()),
                e,
            )
        })?;

        let mut provider: Option<Self> = None;
        for (line_num, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or(line).trim();
            if line.is_empty() {
                continue;
            }

            let (identity, hex_key) = line.split_once(':').ok_or_else(|| {
                OverlayError::config(format!(
                    "{}:{}: expected 'identity:hex-key'",
                    path.display(),
                    line_num + 1
                ))
            })?;
            let key = hex::decode(hex_key.trim()).map_err(|e| {
                OverlayError::config_with_source(
                    format!("{}:{}: PSK is not valid hex", path.display(), line_num + 1),
                    e,
                )
            })?;

            provider = Some(match provider {
                None => Self::new(identity.trim(), key)?,
                Some(p) => p.with_peer(identity.trim(), key)?,
            });
        }

        provider.ok_or_else(|| {
            OverlayError::config(format!("No PSK entries found in {}", path.display()))
        })
    }
}

impl PskProvider for StaticPskProvider {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn lookup(&self, identity: &str) -> Option<Vec<u8>> {
        self.peers.get(identity).cloned()
    }
}

fn validate_entry(identity: &str, key: &[u8]) -> OverlayResult<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(OverlayError::config(format!(
            "PSK identity must be 1-{} bytes",
            MAX_IDENTITY_LEN
        )));
    }
    if key.len() < MIN_PSK_LEN {
        return Err(OverlayError::config(format!(
            "PSK for '{}' is {} bytes, need at least {}",
            identity,
            key.len(),
            MIN_PSK_LEN
        )));
    }
    Ok(())
}

/// Generate a random 32-byte PSK, hex-encoded.
pub fn generate_psk() -> String {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// AEAD state of an established PSK session.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    fn derive(psk: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> OverlayResult<Self> {
        let mut hasher = Sha256::new();
        hasher.update(psk);
        hasher.update(client_nonce);
        hasher.update(server_nonce);
        let key = hasher.finalize();
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OverlayError::Handshake(format!("Invalid session key: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> OverlayResult<Vec<u8>> {
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| OverlayError::Protocol("Failed to seal frame".into()))?;

        let mut out = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> OverlayResult<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(OverlayError::Protocol(format!(
                "Sealed frame too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OverlayError::Protocol("Frame failed authentication".into()))
    }
}

/// Run the dialing side of the handshake.
pub async fn client_handshake<S>(stream: &mut S, provider: &dyn PskProvider) -> OverlayResult<SessionCipher>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rand::rng().fill_bytes(&mut client_nonce);

    let mut hello = Vec::with_capacity(HANDSHAKE_NONCE_LEN + provider.identity().len());
    hello.extend_from_slice(&client_nonce);
    hello.extend_from_slice(provider.identity().as_bytes());
    write_message(stream, &hello).await.map_err(handshake_err)?;

    let server_nonce = read_message(stream, HANDSHAKE_NONCE_LEN)
        .await
        .map_err(handshake_err)?;
    if server_nonce.len() != HANDSHAKE_NONCE_LEN {
        return Err(OverlayError::Handshake("Invalid server nonce".into()));
    }

    let cipher = SessionCipher::derive(provider.key(), &client_nonce, &server_nonce)?;
    write_message(stream, &cipher.seal(CLIENT_CONFIRM)?)
        .await
        .map_err(handshake_err)?;

    let confirm = read_message(stream, SEAL_OVERHEAD + SERVER_CONFIRM.len())
        .await
        .map_err(handshake_err)?;
    match cipher.open(&confirm) {
        Ok(body) if body == SERVER_CONFIRM => Ok(cipher),
        _ => Err(OverlayError::Handshake(
            "Server did not prove knowledge of the PSK".into(),
        )),
    }
}

/// Run the accepting side of the handshake.
///
/// Returns the session cipher and the identity the client presented.
pub async fn server_handshake<S>(
    stream: &mut S,
    provider: &dyn PskProvider,
) -> OverlayResult<(SessionCipher, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = read_message(stream, HANDSHAKE_NONCE_LEN + MAX_IDENTITY_LEN)
        .await
        .map_err(handshake_err)?;
    if hello.len() <= HANDSHAKE_NONCE_LEN {
        return Err(OverlayError::Handshake("Client hello missing identity".into()));
    }
    let (client_nonce, identity) = hello.split_at(HANDSHAKE_NONCE_LEN);
    let identity = String::from_utf8(identity.to_vec())
        .map_err(|_| OverlayError::Handshake("Client identity is not UTF-8".into()))?;
    let psk = provider
        .lookup(&identity)
        .ok_or_else(|| OverlayError::Handshake(format!("Unknown PSK identity '{}'", identity)))?;

    let mut server_nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rand::rng().fill_bytes(&mut server_nonce);
    write_message(stream, &server_nonce)
        .await
        .map_err(handshake_err)?;

    let cipher = SessionCipher::derive(&psk, client_nonce, &server_nonce)?;
    let confirm = read_message(stream, SEAL_OVERHEAD + CLIENT_CONFIRM.len())
        .await
        .map_err(handshake_err)?;
    match cipher.open(&confirm) {
        Ok(body) if body == CLIENT_CONFIRM => {}
        _ => {
            return Err(OverlayError::Handshake(format!(
                "Client '{}' did not prove knowledge of the PSK",
                identity
            )))
        }
    }

    write_message(stream, &cipher.seal(SERVER_CONFIRM)?)
        .await
        .map_err(handshake_err)?;
    Ok((cipher, identity))
}

fn handshake_err(e: OverlayError) -> OverlayError {
    match e {
        OverlayError::Handshake(_) => e,
        other => OverlayError::Handshake(other.to_string()),
    }
}
