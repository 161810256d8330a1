//! Ephemeral key pair generation and per-direction session key
//! derivation (spec.md §4.1).

use dryoc::classic::crypto_kx::{
    crypto_kx_client_session_keys, crypto_kx_keypair, crypto_kx_server_session_keys,
};
use dryoc::classic::crypto_kx::{Session, PublicKey as DryocPublicKey, SecretKey as DryocSecretKey};

use crate::engine::error::{Error, ErrorKind, Result};

use super::crypto_result;

/// An ephemeral X25519-style public key.
pub type PublicKey = DryocPublicKey;

/// An ephemeral X25519-style secret key, zeroized on drop by `dryoc`.
pub type SecretKey = DryocSecretKey;

/// The two symmetric keys derived for a connection: the key used to
/// decrypt inbound data (`rx`) and the key used to encrypt outbound data
/// (`tx`).
pub struct SessionKeys {
    pub rx: [u8; 32],
    pub tx: [u8; 32],
}

impl From<Session> for SessionKeys {
    fn from(s: Session) -> Self {
        SessionKeys { rx: s.rx, tx: s.tx }
    }
}

/// Generates a fresh ephemeral key pair for a single connect attempt.
pub fn keypair() -> (PublicKey, SecretKey) {
    crypto_kx_keypair()
}

/// Parses a peer `PublicKey` carried raw in a `Header::PublicKey` (spec.md
/// §6: "raw ephemeral public key bytes"). Fails if the slice isn't exactly
/// 32 bytes.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::simple(ErrorKind::CryptoFail))?;
    Ok(PublicKey::from(arr))
}

/// Derives `(rx, tx)` for the dialing side of a connection.
///
/// Called from `Connecting` state: the local side is the KX client.
pub fn client_session_keys(
    my_pk: &PublicKey,
    my_sk: &SecretKey,
    peer_pk: &PublicKey,
) -> Result<SessionKeys> {
    crypto_result(crypto_kx_client_session_keys(my_pk, my_sk, peer_pk)).map(SessionKeys::from)
}

/// Derives `(rx, tx)` for the accepting side of a connection.
///
/// Called from `Accepting` state: the local (parent-bound) side is the
/// KX server.
pub fn server_session_keys(
    parent_pk: &PublicKey,
    parent_sk: &SecretKey,
    peer_pk: &PublicKey,
) -> Result<SessionKeys> {
    crypto_result(crypto_kx_server_session_keys(parent_pk, parent_sk, peer_pk)).map(SessionKeys::from)
}
