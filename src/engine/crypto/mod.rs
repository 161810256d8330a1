//! Ephemeral key exchange and AEAD stream cipher used to seed and carry
//! a connection's encrypted data plane.
//!
//! This mirrors the `crypto_kx_*` / `crypto_secretstream_xchacha20poly1305_*`
//! primitives of the original SDK this crate's wire protocol is compatible
//! with (see `original_source/library/connect.c`'s `crypto(func)` macro).
//! Rather than binding libsodium directly, we use `dryoc`, a pure-Rust
//! crate that implements the same primitives behind an API deliberately
//! shaped like libsodium's — the closest ecosystem match to the spec's
//! named calls (see `DESIGN.md`).

pub mod kx;
pub mod stream;

pub use kx::{keypair, client_session_keys, server_session_keys, PublicKey, SecretKey};
pub use stream::{init_pull, init_push, pull, push, PullState, PushState, ABYTES, HEADERBYTES};

use crate::engine::error::{Error, ErrorKind, Result};

/// Maps any crypto primitive failure onto the crate's fatal
/// `ErrorKind::CryptoFail`, per spec.md §4.1: "Failure of any KX or AEAD
/// primitive is fatal to the connection."
pub(crate) fn fatal<E>(_e: E) -> Error {
    Error::simple(ErrorKind::CryptoFail)
}

pub(crate) fn crypto_result<T, E>(r: std::result::Result<T, E>) -> Result<T> {
    r.map_err(fatal)
}
