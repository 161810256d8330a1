//! Per-direction AEAD stream cipher (spec.md §4.1): a sender emits a
//! stream header once, then seals each subsequent chunk; a receiver
//! consumes the header to initialize its pull state, then opens each
//! subsequent chunk.

use dryoc::secretstream::{Header, PullStream, PushStream, Tag};

use crate::engine::error::{Error, ErrorKind, Result};

use super::crypto_result;

/// AEAD tag + framing overhead added to every sealed chunk.
pub const ABYTES: usize = 17;

/// Size in bytes of the stream header produced by `init_push` and
/// consumed by `init_pull`.
pub const HEADERBYTES: usize = 24;

/// Outbound half of a connection's encrypted data plane.
pub struct PushState {
    inner: PushStream,
}

/// Inbound half of a connection's encrypted data plane.
pub struct PullState {
    inner: PullStream,
}

/// Initializes the outbound stream from a transmit key, returning the
/// state to use for subsequent `push` calls and the header bytes that
/// must be sent to the peer before any sealed chunk.
pub fn init_push(tx: &[u8; 32]) -> Result<(PushState, [u8; HEADERBYTES])> {
    let (inner, header): (PushStream, Header) =
        crypto_result(PushStream::init_push(tx))?;
    Ok((PushState { inner }, header.into()))
}

/// Seals `plaintext`, returning a buffer `ABYTES` longer than the input.
pub fn push(state: &mut PushState, plaintext: &[u8]) -> Result<Vec<u8>> {
    crypto_result(state.inner.push(plaintext, None, Tag::Message))
}

/// Initializes the inbound stream from a receive key and the header
/// bytes sent by the peer. Fails if `header` is not exactly
/// `HEADERBYTES` long.
pub fn init_pull(rx: &[u8; 32], header: &[u8]) -> Result<PullState> {
    if header.len() != HEADERBYTES {
        return Err(Error::simple(ErrorKind::CryptoFail));
    }
    let mut hdr = Header::default();
    hdr.as_mut().copy_from_slice(header);
    let inner: PullStream = crypto_result(PullStream::init_pull(&hdr, rx))?;
    Ok(PullState { inner })
}

/// Opens a sealed chunk, returning the plaintext and the tag the sender
/// marked it with. Fails on tag/length mismatch.
pub fn pull(state: &mut PullState, ciphertext: &[u8]) -> Result<(Vec<u8>, Tag)> {
    crypto_result(state.inner.pull(ciphertext, None))
}
