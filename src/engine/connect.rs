//! The connect pipeline: service/session resolution, the router race, and
//! the Edge-Connect exchange (spec.md §4.2, §4.3), grounded directly on
//! `original_source/library/connect.c`'s `ziti_connect_async`,
//! `connect_get_service_cb`, `connect_get_net_session_cb`,
//! `on_channel_connected`, `connect_timeout`, and `ziti_dial`.
//!
//! Every function here takes `&mut Context` and runs synchronously on the
//! engine task; the only asynchronous work (controller calls, channel
//! connects, `send_for_reply`) is pushed into spawned tasks that report
//! their outcome back as an `EngineCmd`, keeping the rule from spec.md §5
//! that all state mutation happens on a single thread.

use std::sync::Arc;

use crate::engine::callbacks::{ClientCb, ConnCb, DataCb, ListenCb};
use crate::engine::channel::Channel;
use crate::engine::conn::{ConnId, EphemeralKeys};
use crate::engine::crypto;
use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::{ContentType, Header, Message};
use crate::engine::model::{Service, Session, SessionType};
use crate::engine::state::ConnState;
use crate::engine::{async_runtime, handshake};

use super::context::{Context, EngineCmd};

/// Owned by a single `Connection` during its `Initial → Connecting`/
/// `Binding` transition (spec.md §3). Destroyed exactly when the last
/// router attempt has resolved.
pub struct ConnectAttempt {
    pub service_name: String,
    pub session_type: SessionType,
    pub service: Option<Service>,
    /// Not named directly in spec.md §3's attribute list, but needed to
    /// retain the edge router list across the race's channel-connect
    /// callbacks; destroyed along with the rest of the attempt.
    pub session: Option<Session>,
    pub chan_tries: u32,
    pub failed: bool,
    pub timeout: Option<async_runtime::JoinHandle<()>>,
}

fn begin_attempt(
    ctx: &mut Context,
    conn_id: ConnId,
    service_name: &str,
    session_type: SessionType,
    next_state: ConnState,
) -> bool {
    let conn = match ctx.conns.get_mut(&conn_id) {
        Some(c) => c,
        None => return false,
    };
    if conn.state != ConnState::Initial {
        return false;
    }
    conn.state = next_state;
    conn.attempt = Some(ConnectAttempt {
        service_name: service_name.to_string(),
        session_type,
        service: None,
        session: None,
        chan_tries: 0,
        failed: false,
        timeout: None,
    });
    true
}

pub(crate) fn handle_dial(
    ctx: &mut Context,
    conn_id: ConnId,
    service_name: String,
    conn_cb: ConnCb,
    data_cb: DataCb,
) {
    if !begin_attempt(ctx, conn_id, &service_name, SessionType::Dial, ConnState::Connecting) {
        conn_cb(Err(Error::simple(ErrorKind::InvalidState)));
        return;
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.conn_cb = Some(conn_cb);
        conn.data_cb = Some(data_cb);
    }
    log::debug!(target: "meshline::connect", "conn {:?} dial({})", conn_id, service_name);
    spawn_resolve_service(ctx, conn_id, service_name);
}

pub(crate) fn handle_bind(
    ctx: &mut Context,
    conn_id: ConnId,
    service_name: String,
    listen_cb: ListenCb,
    client_cb: ClientCb,
) {
    if !begin_attempt(ctx, conn_id, &service_name, SessionType::Bind, ConnState::Binding) {
        listen_cb(Err(Error::simple(ErrorKind::InvalidState)));
        return;
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.conn_cb = Some(listen_cb);
        conn.client_cb = Some(client_cb);
    }
    log::debug!(target: "meshline::connect", "conn {:?} bind({})", conn_id, service_name);
    spawn_resolve_service(ctx, conn_id, service_name);
}

fn spawn_resolve_service(ctx: &Context, conn_id: ConnId, service_name: String) {
    if let Some(svc) = ctx.service_cache.get(&service_name).cloned() {
        let _ = ctx.cmds.send(EngineCmd::ServiceResolved { conn_id, result: Ok(Some(svc)) });
        return;
    }
    let controller = ctx.controller.clone();
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        let result = controller.get_service(&service_name).await;
        let _ = cmds.send(EngineCmd::ServiceResolved { conn_id, result });
    });
}

pub(crate) fn handle_service_resolved(ctx: &mut Context, conn_id: ConnId, result: Result<Option<Service>>) {
    let service = match result {
        Ok(Some(s)) => s,
        Ok(None) => {
            fail_attempt(ctx, conn_id, ErrorKind::ServiceUnavailable);
            return;
        }
        Err(e) => {
            let kind = e.kind();
            fail_attempt(ctx, conn_id, kind);
            return;
        }
    };

    ctx.service_cache.entry(service.name.clone()).or_insert_with(|| service.clone());

    let session_type = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        conn.service_encryption_required = service.encryption_required;
        let attempt = match conn.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        attempt.service = Some(service.clone());
        attempt.session_type
    };

    spawn_resolve_session(ctx, conn_id, service, session_type);
}

fn spawn_resolve_session(ctx: &Context, conn_id: ConnId, service: Service, session_type: SessionType) {
    if let Some(session) = ctx.session_cache.get(&service.id).cloned() {
        if session.session_type == session_type {
            let _ = ctx
                .cmds
                .send(EngineCmd::SessionResolved { conn_id, service, result: Ok(Some(session)) });
            return;
        }
    }
    let controller = ctx.controller.clone();
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        let result = controller.get_net_session(&service, session_type).await;
        let _ = cmds.send(EngineCmd::SessionResolved { conn_id, service, result });
    });
}

pub(crate) fn handle_session_resolved(
    ctx: &mut Context,
    conn_id: ConnId,
    service: Service,
    result: Result<Option<Session>>,
) {
    let session = match result {
        Ok(Some(s)) => s,
        Ok(None) => {
            fail_attempt(ctx, conn_id, ErrorKind::ServiceUnavailable);
            return;
        }
        Err(e) => {
            let kind = e.kind();
            fail_attempt(ctx, conn_id, kind);
            return;
        }
    };
    ctx.session_cache.insert(service.id.clone(), session.clone());
    start_race(ctx, conn_id, session);
}

fn start_race(ctx: &mut Context, conn_id: ConnId, session: Session) {
    let timeout_dur = match ctx.conns.get(&conn_id) {
        Some(c) => c.timeout,
        None => return,
    };
    let routers = session.edge_routers.clone();

    {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        let attempt = match conn.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        attempt.session = Some(session);
        attempt.chan_tries = routers.len() as u32;
    }

    if routers.is_empty() {
        fail_attempt(ctx, conn_id, ErrorKind::GatewayUnavailable);
        return;
    }

    for router in &routers {
        let handle = ctx.registry.handle();
        let cmds = ctx.cmds.clone();
        let addr = router.ingress_tls_address.clone();
        async_runtime::spawn(async move {
            let result = handle.connect(&addr).await;
            let _ = cmds.send(EngineCmd::ChannelConnected { conn_id, ingress_address: addr, result });
        });
    }

    let cmds = ctx.cmds.clone();
    let timeout_handle = async_runtime::spawn(async move {
        tokio::time::sleep(timeout_dur).await;
        let _ = cmds.send(EngineCmd::ConnectTimeout { conn_id });
    });
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        if let Some(attempt) = conn.attempt.as_mut() {
            attempt.timeout = Some(timeout_handle);
        }
    }
}

pub(crate) fn handle_channel_connected(
    ctx: &mut Context,
    conn_id: ConnId,
    ingress_address: String,
    result: Result<Arc<dyn Channel>>,
) {
    let already_adopted;
    let attempt_failed;
    {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        already_adopted = conn.channel.is_some();
        let attempt = match conn.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        attempt.chan_tries = attempt.chan_tries.saturating_sub(1);
        attempt_failed = attempt.failed;
    }

    if already_adopted {
        // A loser: the race already has a winner. Per spec.md §4.2,
        // losers are never disconnected explicitly (Channels are shared).
        maybe_finish_attempt(ctx, conn_id);
        return;
    }

    let channel = match result {
        Err(_) => {
            ctx.registry.evict(&ingress_address);
            maybe_finish_attempt(ctx, conn_id);
            return;
        }
        Ok(channel) => channel,
    };

    if attempt_failed {
        maybe_finish_attempt(ctx, conn_id);
        return;
    }

    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.channel = Some(channel.clone());
        if let Some(attempt) = conn.attempt.as_mut() {
            // one more reply to wait for: the Edge-Connect response
            attempt.chan_tries += 1;
        }
    }
    start_edge_connect(ctx, conn_id, channel);
}

fn start_edge_connect(ctx: &mut Context, conn_id: ConnId, channel: Arc<dyn Channel>) {
    let built = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        let content_type = match conn.state {
            ConnState::Connecting => ContentType::Connect,
            ConnState::Binding => ContentType::Bind,
            other => {
                log::warn!(target: "meshline::connect", "conn {:?} start_edge_connect in state {:?}", conn_id, other);
                return;
            }
        };

        let (service_enc_required, token) = match conn.attempt.as_ref() {
            Some(attempt) => (
                attempt.service.as_ref().map(|s| s.encryption_required).unwrap_or(false),
                attempt.session.as_ref().map(|s| s.token.clone()).unwrap_or_default(),
            ),
            None => return,
        };

        // The handshake message is always literal Seq=0 (spec.md §5;
        // `original_source/library/connect.c`'s `ziti_channel_start_connection`
        // hardcodes `msg_seq = htole32(0)`). `edge_msg_seq` is reserved for
        // the first real `Data` message that follows.
        let mut headers = vec![Header::ConnId(conn_id.into()), Header::Seq(0)];

        let is_dial = matches!(conn.state, ConnState::Connecting);
        if service_enc_required || is_dial {
            let (pk, sk) = crypto::keypair();
            headers.push(Header::PublicKey(pk.as_ref().to_vec()));
            conn.encrypted = service_enc_required;
            conn.keys = Some(EphemeralKeys { pk, sk });
        }

        (content_type, headers, token.into_bytes())
    };

    let (content_type, headers, body) = built;
    let msg = Message::new(content_type, headers, body);
    let channel_for_reply = channel.clone();
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        let reply = channel.send_for_reply(msg).await;
        let _ = cmds.send(EngineCmd::ConnectReplyReceived { conn_id, channel: channel_for_reply, reply });
    });
}

/// `connect_reply_cb` (spec.md §4.3's transition table), also the landing
/// spot for the `accept()` path's `DialSuccess` round trip (spec.md §4.7),
/// since both are one-shot replies to a channel request naming this same
/// handler.
pub(crate) fn handle_connect_reply(
    ctx: &mut Context,
    conn_id: ConnId,
    channel: Arc<dyn Channel>,
    reply: Result<Message>,
) {
    // An accepted child (bind.rs's `handle_accept`) never carries a
    // `ConnectAttempt` — it reuses this same reply handler for its
    // `DialSuccess` round trip (spec.md §4.7) without ever having had one.
    let state_before = ctx.conns.get(&conn_id).map(|c| c.state);
    let attempt_alive = ctx.conns.get(&conn_id).map(|c| c.attempt.is_some()).unwrap_or(false);
    if state_before != Some(ConnState::Accepting) && !attempt_alive {
        // spec.md §9's orphaned-winner tightening: a reply landed after
        // the attempt that sent it was already destroyed.
        log::debug!(
            target: "meshline::connect",
            "conn {:?} edge-connect reply after attempt completed; releasing peer state", conn_id
        );
        send_state_closed_on(&channel, conn_id);
        return;
    }

    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        if let Some(attempt) = conn.attempt.as_mut() {
            attempt.chan_tries = attempt.chan_tries.saturating_sub(1);
        }
    }

    let msg = match reply {
        Err(e) => {
            log::warn!(target: "meshline::connect", "conn {:?} edge-connect reply error: {}", conn_id, e);
            fail_connection(ctx, conn_id, ErrorKind::Channel);
            maybe_finish_attempt(ctx, conn_id);
            return;
        }
        Ok(m) => m,
    };

    let state = match ctx.conns.get(&conn_id) {
        Some(c) => c.state,
        None => return,
    };

    match (state, msg.content_type) {
        (ConnState::Connecting, ContentType::StateConnected) => {
            complete_handshake_then_connect(ctx, conn_id, &msg);
        }
        (ConnState::Accepting, ContentType::StateConnected) => {
            complete_accept_then_connect(ctx, conn_id);
        }
        (ConnState::Connecting, ContentType::StateClosed) => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.state = ConnState::Closed;
                if let Some(cb) = conn.conn_cb.take() {
                    cb(Err(Error::simple(ErrorKind::ConnClosed)));
                }
                if let Some(attempt) = conn.attempt.as_mut() {
                    attempt.failed = true;
                }
            }
        }
        (ConnState::Binding, ContentType::StateConnected) => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.state = ConnState::Bound;
                if let Some(cb) = conn.conn_cb.take() {
                    cb(Ok(()));
                }
            }
        }
        (ConnState::Closed, ContentType::StateConnected) | (ConnState::Timedout, ContentType::StateConnected) => {
            log::debug!(target: "meshline::connect", "conn {:?} late StateConnected in {:?}", conn_id, state);
            release_peer_state(ctx, conn_id);
        }
        _ => {
            log::warn!(target: "meshline::connect", "conn {:?} unexpected reply {:?} in state {:?}", conn_id, msg.content_type, state);
            release_peer_state(ctx, conn_id);
        }
    }

    maybe_finish_attempt(ctx, conn_id);
}

fn complete_handshake_then_connect(ctx: &mut Context, conn_id: ConnId, msg: &Message) {
    let service_enc_required = match ctx.conns.get(&conn_id) {
        Some(c) => c.service_encryption_required,
        None => return,
    };
    let outcome = match ctx.conns.get_mut(&conn_id) {
        Some(conn) => handshake::establish_crypto(conn, service_enc_required, msg),
        None => return,
    };
    match outcome {
        Ok(()) => {
            let needs_header = ctx.conns.get(&conn_id).map(|c| c.encrypted).unwrap_or(false);
            if needs_header {
                if let Err(e) = handshake::send_crypto_header(ctx, conn_id) {
                    fail_connection(ctx, conn_id, e.kind());
                    return;
                }
            }
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.state = ConnState::Connected;
                if let Some(cb) = conn.conn_cb.take() {
                    cb(Ok(()));
                }
            }
        }
        Err(e) => {
            let kind = e.kind();
            fail_connection(ctx, conn_id, kind);
        }
    }
}

/// The `Accepting` row of spec.md §4.3's transition table. Unlike the
/// dialing side's `complete_handshake_then_connect`, this never calls
/// `establish_crypto`: the child's `(rx, tx)` were already staged by
/// `bind::establish_child_crypto` when the inbound `Dial` forked it off
/// its `Bound` parent, so all that is left is sending the local crypto
/// header (if the service requires encryption) and flipping to
/// `Connected`.
fn complete_accept_then_connect(ctx: &mut Context, conn_id: ConnId) {
    let needs_header = ctx.conns.get(&conn_id).map(|c| c.encrypted).unwrap_or(false);
    if needs_header {
        if let Err(e) = handshake::send_crypto_header(ctx, conn_id) {
            fail_connection(ctx, conn_id, e.kind());
            return;
        }
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.state = ConnState::Connected;
        if let Some(cb) = conn.conn_cb.take() {
            cb(Ok(()));
        }
    }
}

fn maybe_finish_attempt(ctx: &mut Context, conn_id: ConnId) {
    let (done, had_winner, failed) = {
        let conn = match ctx.conns.get(&conn_id) {
            Some(c) => c,
            None => return,
        };
        let attempt = match conn.attempt.as_ref() {
            Some(a) => a,
            None => return,
        };
        (attempt.chan_tries == 0, conn.channel.is_some(), attempt.failed)
    };
    if !done {
        return;
    }

    if let Some(handle) = ctx
        .conns
        .get_mut(&conn_id)
        .and_then(|c| c.attempt.as_mut())
        .and_then(|a| a.timeout.take())
    {
        handle.abort();
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.attempt = None;
    }

    if !had_winner && !failed {
        fail_connection(ctx, conn_id, ErrorKind::GatewayUnavailable);
    }
}

fn fail_attempt(ctx: &mut Context, conn_id: ConnId, kind: ErrorKind) {
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.attempt = None;
    }
    fail_connection(ctx, conn_id, kind);
}

fn fail_connection(ctx: &mut Context, conn_id: ConnId, kind: ErrorKind) {
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.state = ConnState::Closed;
        if let Some(cb) = conn.conn_cb.take() {
            cb(Err(Error::simple(kind)));
        }
    }
}

/// Unconditionally releases the peer's connection state, bypassing
/// `disconnect`'s state guard (spec.md §4.8) — used from paths where the
/// connection already sits in `Closed`/`Timedout` but the peer does not
/// know that yet (spec.md §4.3's "Closed/Timedout" row).
fn release_peer_state(ctx: &Context, conn_id: ConnId) {
    if let Some(conn) = ctx.conns.get(&conn_id) {
        if let Some(channel) = conn.channel.clone() {
            send_state_closed_on(&channel, conn_id);
        }
    }
}

fn send_state_closed_on(channel: &Arc<dyn Channel>, conn_id: ConnId) {
    let channel = channel.clone();
    let msg = Message::new(ContentType::StateClosed, vec![Header::ConnId(conn_id.into())], Vec::new());
    async_runtime::spawn(async move {
        if let Err(e) = channel.send(msg).await {
            log::warn!(target: "meshline::connect", "failed to release orphaned peer state: {}", e);
        }
    });
}

pub(crate) fn handle_connect_timeout(ctx: &mut Context, conn_id: ConnId) {
    let state = match ctx.conns.get(&conn_id) {
        Some(c) => c.state,
        None => return,
    };
    if state != ConnState::Connecting {
        // spec.md §4.2, `original_source/library/connect.c`'s
        // `connect_timeout()`: only `Connecting` times out here; a
        // `Binding` connection's timer firing is logged and dropped like
        // any other already-decided state.
        log::debug!(target: "meshline::connect", "conn {:?} connect_timeout in state {:?}; already decided", conn_id, state);
        return;
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.state = ConnState::Timedout;
        if let Some(attempt) = conn.attempt.as_mut() {
            attempt.failed = true;
            attempt.timeout = None;
        }
        if let Some(cb) = conn.conn_cb.take() {
            cb(Err(Error::simple(ErrorKind::Timeout)));
        }
    }
}
