//! The bind/accept path (spec.md §4.7): hosting-side connections reuse
//! the dial pipeline's `ConnectionFSM` and connect-reply machinery,
//! forking a child `Connection` off a `Bound` parent for each inbound
//! `Dial` and completing its handshake through a `DialSuccess` round
//! trip, grounded on `original_source/library/connect.c`'s `ziti_bind`
//! and `ziti_accept`.

use crate::engine::callbacks::{ConnCb, DataCb};
use crate::engine::conn::{ConnId, Connection, ConnectionState, EphemeralKeys};
use crate::engine::crypto;
use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::{ContentType, Header, Message};
use crate::engine::state::ConnState;

use super::async_runtime;
use super::context::{Context, EngineCmd};

/// An inbound `Dial` against a `Bound` parent (spec.md §4.7): the edge
/// router is notifying us of a new dialer. Forks a child `Connection` in
/// `Accepting` state and hands it to the parent's `client_cb`, the way
/// `on_channel_connected`/`start_edge_connect` hand a winning channel to
/// a dialing connection.
pub(crate) fn handle_inbound_dial(ctx: &mut Context, parent_id: ConnId, msg: Message) {
    let dial_req_seq = match msg.seq() {
        Some(s) => s,
        None => {
            log::warn!(target: "meshline::bind", "inbound Dial on conn {:?} missing Seq", parent_id);
            return;
        }
    };

    let (channel, timeout, service_encryption_required, has_parent_keys) = match ctx.conns.get(&parent_id) {
        Some(parent) if parent.state == ConnState::Bound => (
            parent.channel.clone(),
            parent.timeout,
            parent.service_encryption_required,
            parent.keys.is_some(),
        ),
        Some(parent) => {
            log::warn!(
                target: "meshline::bind",
                "inbound Dial on conn {:?} in non-Bound state {:?}", parent_id, parent.state
            );
            return;
        }
        None => return,
    };

    let channel = match channel {
        Some(c) => c,
        None => return,
    };

    let child_id = ConnId::fresh();
    let mut child = ConnectionState::new(child_id, timeout);
    child.parent = Some(parent_id);
    child.channel = Some(channel);
    child.state = ConnState::Accepting;
    child.dial_req_seq = Some(dial_req_seq.into());
    child.service_encryption_required = service_encryption_required;

    if service_encryption_required {
        if !has_parent_keys {
            log::error!(
                target: "meshline::bind",
                "bound conn {:?} has no ephemeral keys for an encryption-required service", parent_id
            );
            return;
        }
        if let Err(e) = establish_child_crypto(ctx, parent_id, &mut child, &msg) {
            log::warn!(
                target: "meshline::bind",
                "conn {:?} crypto handshake failed for inbound dial: {}", parent_id, e
            );
            return;
        }
    }

    ctx.conns.insert(child_id, child);
    let child_handle = Connection::new(child_id, ctx.cmds.clone());

    let parent = match ctx.conns.get_mut(&parent_id) {
        Some(c) => c,
        None => return,
    };
    match parent.client_cb.as_mut() {
        Some(client_cb) => client_cb(child_handle),
        None => log::warn!(target: "meshline::bind", "bound conn {:?} has no client_cb", parent_id),
    }
}

/// Derives the child's staged `(rx, tx)` via `server_session_keys` using
/// the *parent's* ephemeral keypair (spec.md §4.1's
/// `server_session_keys(parent_sk, parent_pk, peer_pk)`) and the
/// dialer's `PublicKey` carried on the inbound `Dial` — the accept path
/// reuses the one keypair generated at bind time rather than minting a
/// fresh one per child (`DESIGN.md`'s resolution of spec.md §3's
/// `parent` attribute).
fn establish_child_crypto(
    ctx: &Context,
    parent_id: ConnId,
    child: &mut ConnectionState,
    msg: &Message,
) -> Result<()> {
    let peer_pk_bytes = msg.public_key().ok_or_else(|| Error::simple(ErrorKind::CryptoFail))?;
    let peer_pk = crypto::kx::public_key_from_bytes(peer_pk_bytes)?;
    let parent = ctx.conns.get(&parent_id).ok_or_else(|| Error::simple(ErrorKind::Wtf))?;
    let keys: &EphemeralKeys = parent.keys.as_ref().ok_or_else(|| Error::simple(ErrorKind::Wtf))?;
    let session_keys = crypto::server_session_keys(&keys.pk, &keys.sk, &peer_pk)?;
    child.encrypted = true;
    child.staged.rx = Some(session_keys.rx);
    child.staged.tx = Some(session_keys.tx);
    Ok(())
}

/// `accept(child_conn)` (spec.md §4.7, §6): sends `DialSuccess` on the
/// channel shared with the parent, naming `connect_reply_cb` (spec.md
/// §4.3) as the one-shot handler. That handler's `Accepting` row sends
/// the crypto header — already staged by `establish_child_crypto`,
/// unlike the dial path's `establish_crypto`, which runs at reply time —
/// and transitions the child to `Connected`.
pub(crate) fn handle_accept(ctx: &mut Context, conn_id: ConnId, conn_cb: ConnCb, data_cb: DataCb) {
    let prepared = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => {
                conn_cb(Err(Error::simple(ErrorKind::InvalidState)));
                return;
            }
        };
        if conn.state != ConnState::Accepting {
            conn_cb(Err(Error::simple(ErrorKind::InvalidState)));
            return;
        }
        let parent_id = match conn.parent {
            Some(p) => p,
            None => {
                conn_cb(Err(Error::simple(ErrorKind::Wtf)));
                return;
            }
        };
        let dial_req_seq = match conn.dial_req_seq {
            Some(s) => s,
            None => {
                conn_cb(Err(Error::simple(ErrorKind::Wtf)));
                return;
            }
        };
        let channel = match conn.channel.clone() {
            Some(c) => c,
            None => {
                conn_cb(Err(Error::simple(ErrorKind::Wtf)));
                return;
            }
        };

        conn.conn_cb = Some(conn_cb);
        conn.data_cb = Some(data_cb);
        (parent_id, dial_req_seq, channel)
    };

    let (parent_id, dial_req_seq, channel) = prepared;
    // Literal Seq=0, matching `start_edge_connect`'s handshake message
    // (spec.md §5): `edge_msg_seq` is reserved for the first real `Data`
    // message, not the `DialSuccess` handshake.
    let headers = vec![
        Header::ConnId(parent_id.into()),
        Header::Seq(0),
        Header::ReplyFor(dial_req_seq.into()),
    ];
    let body = u32::from(conn_id).to_le_bytes().to_vec();
    let msg = Message::new(ContentType::DialSuccess, headers, body);

    let channel_for_reply = channel.clone();
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        let reply = channel.send_for_reply(msg).await;
        let _ = cmds.send(EngineCmd::ConnectReplyReceived { conn_id, channel: channel_for_reply, reply });
    });
}
