//! `write()`, its completion/timeout races, and half-close FIN emission
//! (spec.md §2, §4.5, §4.8), grounded on `original_source/library/connect.c`'s
//! `ziti_write_req`, `on_write_completed`, `ziti_write_timeout`, and
//! `ziti_close_write`/`send_fin_message`.

use tokio::task::JoinHandle;

use crate::engine::async_runtime;
use crate::engine::callbacks::WriteCb;
use crate::engine::conn::ConnId;
use crate::engine::context::{Context, EngineCmd};
use crate::engine::crypto;
use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::{ContentType, Flags, Header, Message};
use crate::engine::state::ConnState;

/// A single `write()` call in flight.
///
/// The original SDK's orphan sentinel (spec.md §9: "`req.conn = NULL`")
/// is realized here as `ConnectionState::orphaned_writes` rather than a
/// field on this struct: a timed-out request is removed from
/// `write_reqs` (so the outstanding count drops immediately, as the C
/// source's `conn->write_reqs--` does) while its id is remembered so the
/// eventual, racing send completion is recognized and absorbed
/// (spec.md §4.5, property 7).
pub struct WriteRequest {
    pub conn: ConnId,
    pub buf: Vec<u8>,
    pub cb: Option<WriteCb>,
    pub timeout: Option<JoinHandle<()>>,
}

impl WriteRequest {
    pub fn new(conn: ConnId, buf: Vec<u8>, cb: Option<WriteCb>) -> Self {
        WriteRequest { conn, buf, cb, timeout: None }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Cancels the per-write timer, if one is armed (spec.md §4.5:
    /// "stop/close the timer" on completion).
    pub fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

/// `write(req={buf,len,cb,ctx})` (spec.md §4.5). Always runs on the
/// engine loop here — `Connection::write` self-schedules onto it
/// unconditionally rather than special-casing an off-loop caller
/// (spec.md §9, `DESIGN.md`).
pub(crate) fn handle_write(ctx: &mut Context, conn_id: ConnId, buf: Vec<u8>, cb: Option<WriteCb>) {
    if ctx.conns.get(&conn_id).map(|c| !c.accepts_new_writes()).unwrap_or(true) {
        if let Some(cb) = cb {
            cb(Err(Error::simple(ErrorKind::ConnClosed)));
        }
        return;
    }

    let prepared = {
        let conn = ctx.conns.get_mut(&conn_id).expect("checked closed/missing above");

        let body: std::result::Result<Vec<u8>, Error> = if conn.encrypted {
            match conn.crypt_o.as_mut() {
                Some(state) => crypto::push(state, &buf),
                None => Err(Error::simple(ErrorKind::Wtf)),
            }
        } else {
            Ok(buf.clone())
        };
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                let kind = e.kind();
                conn.state = ConnState::Closed;
                if let Some(cb) = cb {
                    cb(Err(Error::simple(kind)));
                }
                return;
            }
        };

        let write_id = conn.next_write_id;
        conn.next_write_id += 1;

        let mut req = WriteRequest::new(conn_id, buf, cb);
        if req.cb.is_some() {
            let cmds = ctx.cmds.clone();
            let timeout_dur = conn.timeout;
            req.timeout = Some(async_runtime::spawn(async move {
                tokio::time::sleep(timeout_dur).await;
                let _ = cmds.send(EngineCmd::WriteTimeout { conn_id, write_id });
            }));
        }

        let channel = conn.channel.clone();
        let seq = conn.edge_msg_seq.take();
        conn.write_reqs.insert(write_id, req);

        (write_id, channel, seq, body)
    };

    let (write_id, channel, seq, body) = prepared;
    let channel = match channel {
        Some(c) => c,
        None => {
            handle_write_completed(ctx, conn_id, write_id, Err(Error::simple(ErrorKind::Wtf)));
            return;
        }
    };

    let headers = vec![Header::ConnId(conn_id.into()), Header::Seq(seq.into())];
    let msg = Message::new(ContentType::Data, headers, body);
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        let status = channel.send(msg).await;
        let _ = cmds.send(EngineCmd::WriteCompleted { conn_id, write_id, status });
    });
}

/// `on_write_completed(req, status)` (spec.md §4.5).
pub(crate) fn handle_write_completed(
    ctx: &mut Context,
    conn_id: ConnId,
    write_id: u64,
    status: Result<()>,
) {
    let should_emit_fin = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };

        // Orphaned by a write timeout that already fired: free and
        // return (spec.md §4.5, property 7).
        if conn.orphaned_writes.remove(&write_id) {
            return;
        }

        let mut req = match conn.write_reqs.remove(&write_id) {
            Some(r) => r,
            None => return,
        };
        req.cancel_timeout();

        if status.is_err() {
            conn.state = ConnState::Closed;
        }
        let len = req.len();
        if let Some(cb) = req.cb.take() {
            cb(status.map(|()| len));
        }

        conn.write_reqs.is_empty() && conn.state == ConnState::CloseWrite
    };

    if should_emit_fin {
        emit_fin(ctx, conn_id);
    }
}

/// `write_timeout` (spec.md §4.5). Fires before the racing send
/// completes; marks the write id orphaned so that completion, whenever
/// it lands, is a no-op.
pub(crate) fn handle_write_timeout(ctx: &mut Context, conn_id: ConnId, write_id: u64) {
    let conn = match ctx.conns.get_mut(&conn_id) {
        Some(c) => c,
        None => return,
    };

    let mut req = match conn.write_reqs.remove(&write_id) {
        Some(r) => r,
        None => return,
    };
    conn.orphaned_writes.insert(write_id);

    if !conn.state.is_closed() {
        conn.state = ConnState::Closed;
    }
    if let Some(cb) = req.cb.take() {
        cb(Err(Error::simple(ErrorKind::Timeout)));
    }
}

/// `close_write(conn)` (spec.md §4.8). Idempotent: a no-op if the FIN
/// was already sent or the connection is already `Closed`.
pub(crate) fn handle_close_write(ctx: &mut Context, conn_id: ConnId) {
    let (already_done, no_pending) = match ctx.conns.get(&conn_id) {
        Some(c) => (c.fin_sent || c.state.is_closed(), c.write_reqs.is_empty()),
        None => return,
    };
    if already_done {
        return;
    }
    if let Some(conn) = ctx.conns.get_mut(&conn_id) {
        conn.state = ConnState::CloseWrite;
    }
    if no_pending {
        emit_fin(ctx, conn_id);
    }
}

/// Sends the FIN: a `Data` message with `Flags::EDGE_FIN` set and the
/// next sequence number (spec.md §4.8, property 3: "the FIN message
/// uses the next sequence after the last data message").
fn emit_fin(ctx: &mut Context, conn_id: ConnId) {
    let prepared = {
        let conn = match ctx.conns.get_mut(&conn_id) {
            Some(c) => c,
            None => return,
        };
        if conn.fin_sent {
            return;
        }

        let body: std::result::Result<Vec<u8>, Error> = if conn.encrypted {
            match conn.crypt_o.as_mut() {
                Some(state) => crypto::push(state, &[]),
                None => Err(Error::simple(ErrorKind::Wtf)),
            }
        } else {
            Ok(Vec::new())
        };
        let body = match body {
            Ok(b) => b,
            Err(_) => {
                conn.state = ConnState::Closed;
                return;
            }
        };

        let channel = match conn.channel.clone() {
            Some(c) => c,
            None => return,
        };
        conn.fin_sent = true;
        let seq = conn.edge_msg_seq.take();
        (channel, seq, body)
    };

    let (channel, seq, body) = prepared;
    let headers = vec![
        Header::ConnId(conn_id.into()),
        Header::Seq(seq.into()),
        Header::Flags(Flags::EDGE_FIN.bits()),
    ];
    let msg = Message::new(ContentType::Data, headers, body);
    async_runtime::spawn(async move {
        if let Err(e) = channel.send(msg).await {
            log::warn!(target: "meshline::dataplane::write", "failed to send FIN: {}", e);
        }
    });
}
