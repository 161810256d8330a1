//! `establish_crypto` / `send_crypto_header` (spec.md §4.4), grounded on
//! `original_source/library/connect.c`'s `establish_crypto` and
//! `send_crypto_header`.

use crate::engine::conn::{ConnId, ConnectionState};
use crate::engine::crypto;
use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::{ContentType, Header, Message};
use crate::engine::state::ConnState;

use super::async_runtime;
use super::context::Context;

/// Reads `PublicKey` from an inbound `StateConnected` reply and, if
/// present, derives `(rx, tx)` via client or server KX depending on
/// `conn.state` (spec.md §4.4).
pub(crate) fn establish_crypto(
    conn: &mut ConnectionState,
    service_encryption_required: bool,
    msg: &Message,
) -> Result<()> {
    match msg.public_key() {
        None if service_encryption_required => Err(Error::simple(ErrorKind::CryptoFail)),
        None => Ok(()),
        Some(peer_pk_bytes) => {
            let peer_pk = crypto::kx::public_key_from_bytes(peer_pk_bytes)?;
            let keys = conn.keys.as_ref().ok_or_else(|| Error::simple(ErrorKind::Wtf))?;
            let session_keys = match conn.state {
                ConnState::Connecting => crypto::client_session_keys(&keys.pk, &keys.sk, &peer_pk)?,
                ConnState::Accepting => crypto::server_session_keys(&keys.pk, &keys.sk, &peer_pk)?,
                other => {
                    log::error!(target: "meshline::handshake", "establish_crypto in unexpected state {:?}", other);
                    return Err(Error::simple(ErrorKind::InvalidState));
                }
            };
            conn.encrypted = true;
            conn.staged.rx = Some(session_keys.rx);
            conn.staged.tx = Some(session_keys.tx);
            Ok(())
        }
    }
}

/// Initializes `crypt_o` from the staged `tx` key, sends the stream
/// header as a `Data` message, then zeroizes and drops `tx` (spec.md
/// §4.4). From this point forward outbound `Data` carries sealed bodies.
pub(crate) fn send_crypto_header(ctx: &mut Context, conn_id: ConnId) -> Result<()> {
    let (channel, seq, header_bytes) = {
        let conn = ctx
            .conns
            .get_mut(&conn_id)
            .ok_or_else(|| Error::simple(ErrorKind::ConnClosed))?;

        let mut tx = conn.staged.tx.take().ok_or_else(|| Error::simple(ErrorKind::Wtf))?;
        let (push_state, header_bytes) = crypto::init_push(&tx)?;
        // Zeroize the staged transmit key now that crypt_o owns its own
        // copy internally (spec.md §3: "tx ... zeroized and dropped after
        // use").
        for b in tx.iter_mut() {
            *b = 0;
        }
        conn.crypt_o = Some(push_state);

        let channel = conn.channel.clone().ok_or_else(|| Error::simple(ErrorKind::Wtf))?;
        let seq = conn.edge_msg_seq.take();
        (channel, seq, header_bytes)
    };

    let msg = Message::new(
        ContentType::Data,
        vec![Header::ConnId(conn_id.into()), Header::Seq(seq.into())],
        header_bytes.to_vec(),
    );
    async_runtime::spawn(async move {
        if let Err(e) = channel.send(msg).await {
            log::warn!(target: "meshline::handshake", "failed to send crypto header: {}", e);
        }
    });
    Ok(())
}
