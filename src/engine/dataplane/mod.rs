//! Encrypt-on-write, decrypt-on-read, flush-to-client with backpressure
//! (spec.md §2, §4.5, §4.6).

pub mod flush;
pub mod inbound;
pub mod write;

pub use inbound::InboundBuffer;
pub use write::WriteRequest;

use crate::engine::callbacks::DataEvent;
use crate::engine::conn::ConnId;
use crate::engine::crypto;
use crate::engine::error::{Error, ErrorKind};
use crate::engine::message::{ContentType, Flags, Message};
use crate::engine::state::ConnState;

use super::async_runtime;
use super::context::{Context, EngineCmd};
use flush::FlushOutcome;

/// `Channel::dispatch_inbound(conn_id, message)` (spec.md §3, §6),
/// landing on the engine loop as an `InboundEnvelope`. Dispatches by
/// content type: data-plane bytes, a peer-initiated teardown, or (on a
/// `Bound` parent) a new dialer for the bind/accept path.
pub(crate) fn handle_inbound_message(ctx: &mut Context, conn_id: ConnId, msg: Message) {
    match msg.content_type {
        ContentType::Data => handle_inbound_data(ctx, conn_id, msg),
        ContentType::StateClosed => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.state = ConnState::Closed;
            }
        }
        ContentType::Dial => super::bind::handle_inbound_dial(ctx, conn_id, msg),
        other => {
            log::warn!(
                target: "meshline::dataplane",
                "conn {:?} unexpected inbound content type {:?}", conn_id, other
            );
        }
    }
}

/// `on_inbound_data(msg)` (spec.md §4.6), including the first-`Data`
/// crypto-header case from §4.4.
fn handle_inbound_data(ctx: &mut Context, conn_id: ConnId, msg: Message) {
    let conn = match ctx.conns.get_mut(&conn_id) {
        Some(c) => c,
        None => return,
    };
    if conn.state.is_closed() || conn.fin_recv {
        log::debug!(
            target: "meshline::dataplane",
            "conn {:?} dropping inbound Data: closed={} fin_recv={}",
            conn_id, conn.state.is_closed(), conn.fin_recv
        );
        return;
    }

    if let Some(rx) = conn.staged.rx.take() {
        // First Data while `rx` is staged is the peer's stream header,
        // not application bytes (spec.md §4.4).
        match crypto::init_pull(&rx, &msg.body) {
            Ok(state) => conn.crypt_i = Some(state),
            Err(_) => {
                conn.state = ConnState::Closed;
                if let Some(cb) = conn.data_cb.as_mut() {
                    cb(DataEvent::Error(Error::simple(ErrorKind::CryptoFail)));
                }
                return;
            }
        }
    } else if conn.encrypted {
        let plaintext = match conn.crypt_i.as_mut() {
            Some(state) => match crypto::pull(state, &msg.body) {
                Ok((pt, _tag)) => pt,
                Err(_) => {
                    conn.state = ConnState::Closed;
                    if let Some(cb) = conn.data_cb.as_mut() {
                        cb(DataEvent::Error(Error::simple(ErrorKind::CryptoFail)));
                    }
                    return;
                }
            },
            None => {
                log::error!(target: "meshline::dataplane", "conn {:?} Data before crypto header sent", conn_id);
                return;
            }
        };
        conn.inbound.append(&plaintext);
    } else {
        conn.inbound.append(&msg.body);
    }

    if msg.flags().contains(Flags::EDGE_FIN) {
        conn.fin_recv = true;
    }

    schedule_flush(ctx, conn_id);
}

/// Marks `conn_id` dirty and, unless a flush is already pending for it,
/// posts an `EngineCmd::Flush`. Any number of calls between actual
/// `run_flush` runs collapse into the one already pending — the
/// "coalescing" behavior of the flusher token (GLOSSARY).
pub(crate) fn schedule_flush(ctx: &mut Context, conn_id: ConnId) {
    let conn = match ctx.conns.get_mut(&conn_id) {
        Some(c) => c,
        None => return,
    };
    if conn.flush_scheduled {
        return;
    }
    conn.flush_scheduled = true;
    let _ = ctx.cmds.send(EngineCmd::Flush { conn_id });
}

/// Runs one `flush::flush_once` pass for `conn_id` (spec.md §4.6). On
/// backpressure, reposts itself after yielding once so a stalled
/// application doesn't spin the engine loop waiting for itself to
/// become ready again.
pub(crate) fn run_flush(ctx: &mut Context, conn_id: ConnId) {
    let outcome = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        conn.flush_scheduled = false;
        if conn.state == ConnState::Closed {
            return;
        }
        let data_cb = match conn.data_cb.as_mut() {
            Some(cb) => cb,
            None => return,
        };
        flush::flush_once(&mut conn.inbound, conn.fin_recv, conn.eof_delivered, data_cb)
    };

    match outcome {
        FlushOutcome::Drained => {}
        FlushOutcome::EofDelivered => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.eof_delivered = true;
            }
        }
        FlushOutcome::Backpressure => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.flush_scheduled = true;
            }
            let cmds = ctx.cmds.clone();
            async_runtime::spawn(async move {
                tokio::task::yield_now().await;
                let _ = cmds.send(EngineCmd::Flush { conn_id });
            });
        }
    }
}
