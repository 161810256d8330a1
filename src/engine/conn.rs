//! The `Connection` data model (spec.md §3) and the public handle
//! applications hold (spec.md §6's "Application API").
//!
//! A `Connection` value is a cheap, `Clone`, `Send` cursor: a `ConnId`
//! plus a sender into the owning `Context`'s engine task. It never
//! touches connection state directly — every method submits an
//! `EngineCmd` and, where the call is request/response shaped, awaits a
//! `oneshot` reply. This realizes spec.md §5's thread-affinity rule
//! ("all ... public operations must be called on the engine loop or
//! forwarded to it") uniformly, rather than special-casing `write()`'s
//! "if not already on the loop thread" check from the original C SDK
//! (see `DESIGN.md` for that deliberate redesign).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::engine::callbacks::{ClientCb, ConnCb, DataCb, ListenCb, WriteCb};
use crate::engine::channel::Channel;
use crate::engine::connect::ConnectAttempt;
use crate::engine::crypto::{PublicKey, SecretKey};
use crate::engine::crypto::stream::{PullState, PushState};
use crate::engine::dataplane::InboundBuffer;
use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::Flags;
use crate::engine::ordering::SeqNo;
use crate::engine::state::ConnState;

use super::context::EngineCmd;

/// A connection id, locally unique within a `Context` (spec.md §3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnId(u32);

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

impl ConnId {
    pub(crate) fn fresh() -> ConnId {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<ConnId> for u32 {
    fn from(id: ConnId) -> u32 {
        id.0
    }
}

impl From<u32> for ConnId {
    fn from(id: u32) -> ConnId {
        ConnId(id)
    }
}

/// Staged, single-use ephemeral key material (spec.md §3: "`rx` is
/// non-null only until the peer crypto header is processed; `tx` is
/// non-null only until the local crypto header is sent"). Dropping this
/// type zeroizes the underlying bytes via `dryoc`'s key types.
#[derive(Default)]
pub struct StagedKeys {
    pub rx: Option<[u8; 32]>,
    pub tx: Option<[u8; 32]>,
}

/// Ephemeral key pair generated for a single connect attempt, kept on
/// the connection until the handshake finishes.
pub struct EphemeralKeys {
    pub pk: PublicKey,
    pub sk: SecretKey,
}

/// The engine-owned state behind a `ConnId` (spec.md §3). Only the
/// engine task ever touches this type.
pub struct ConnectionState {
    pub conn_id: ConnId,
    pub state: ConnState,
    pub channel: Option<Arc<dyn Channel>>,
    pub write_reqs: HashMap<u64, crate::engine::dataplane::WriteRequest>,
    /// Write ids whose per-write timer fired first (spec.md §9's
    /// `req.conn = null` orphan sentinel): the eventual send completion
    /// for one of these is absorbed without touching `write_reqs` again
    /// or invoking `cb` a second time (spec.md §4.5, property 7).
    pub orphaned_writes: std::collections::HashSet<u64>,
    pub next_write_id: u64,
    pub edge_msg_seq: SeqNo,
    pub encrypted: bool,
    /// Sticky copy of the resolved service's `encryption_required`,
    /// kept after the `ConnectAttempt` that resolved it is destroyed so
    /// a later `accept()` on a bound connection's child still knows
    /// whether to run the crypto handshake (spec.md §4.7).
    pub service_encryption_required: bool,
    pub keys: Option<EphemeralKeys>,
    pub staged: StagedKeys,
    pub crypt_i: Option<PullState>,
    pub crypt_o: Option<PushState>,
    pub inbound: InboundBuffer,
    pub fin_sent: bool,
    pub fin_recv: bool,
    pub eof_delivered: bool,
    pub flush_scheduled: bool,
    pub data_cb: Option<DataCb>,
    pub conn_cb: Option<ConnCb>,
    pub listen_cb: Option<ListenCb>,
    pub client_cb: Option<ClientCb>,
    pub timeout: Duration,
    pub parent: Option<ConnId>,
    pub dial_req_seq: Option<SeqNo>,
    pub attempt: Option<ConnectAttempt>,
}

impl ConnectionState {
    pub fn new(conn_id: ConnId, timeout: Duration) -> Self {
        ConnectionState {
            conn_id,
            state: ConnState::Initial,
            channel: None,
            write_reqs: HashMap::new(),
            orphaned_writes: std::collections::HashSet::new(),
            next_write_id: 0,
            edge_msg_seq: SeqNo::ZERO,
            encrypted: false,
            service_encryption_required: false,
            keys: None,
            staged: StagedKeys::default(),
            crypt_i: None,
            crypt_o: None,
            inbound: InboundBuffer::new(),
            fin_sent: false,
            fin_recv: false,
            eof_delivered: false,
            flush_scheduled: false,
            data_cb: None,
            conn_cb: None,
            listen_cb: None,
            client_cb: None,
            timeout,
            parent: None,
            dial_req_seq: None,
            attempt: None,
        }
    }

    /// spec.md §3 invariant: "state == Closed ⇒ write_reqs is draining
    /// only; no new writes accepted."
    pub fn accepts_new_writes(&self) -> bool {
        !self.state.is_closed()
    }

    /// spec.md §4.8: `reap` precondition.
    pub fn reapable(&self) -> bool {
        self.state.is_closed() && self.write_reqs.is_empty()
    }
}

/// A cheap, cloneable handle applications hold to a connection
/// (spec.md §6). Method calls submit work to the owning `Context`'s
/// engine task; they never block on connection-internal locks because
/// there are none — all mutation happens inside the single engine task.
#[derive(Clone)]
pub struct Connection {
    pub(crate) conn_id: ConnId,
    pub(crate) cmds: mpsc::UnboundedSender<EngineCmd>,
}

impl Connection {
    pub(crate) fn new(conn_id: ConnId, cmds: mpsc::UnboundedSender<EngineCmd>) -> Self {
        Connection { conn_id, cmds }
    }

    pub fn id(&self) -> ConnId {
        self.conn_id
    }

    fn send_cmd(&self, cmd: EngineCmd) -> Result<()> {
        self.cmds
            .send(cmd)
            .map_err(|_| Error::simple(ErrorKind::ConnClosed))
    }

    /// `dial(conn, service_name, conn_cb, data_cb)` (spec.md §6).
    /// Requires `Initial`; the engine rejects with `InvalidState`
    /// otherwise.
    pub fn dial(
        &self,
        service_name: impl Into<String>,
        conn_cb: ConnCb,
        data_cb: DataCb,
    ) -> Result<()> {
        self.send_cmd(EngineCmd::Dial {
            conn_id: self.conn_id,
            service_name: service_name.into(),
            conn_cb,
            data_cb,
        })
    }

    /// `bind(conn, service_name, listen_cb, client_cb)` (spec.md §6).
    pub fn bind(
        &self,
        service_name: impl Into<String>,
        listen_cb: ListenCb,
        client_cb: ClientCb,
    ) -> Result<()> {
        self.send_cmd(EngineCmd::Bind {
            conn_id: self.conn_id,
            service_name: service_name.into(),
            listen_cb,
            client_cb,
        })
    }

    /// `accept(conn, conn_cb, data_cb)` (spec.md §6), called on a child
    /// connection created from a `client_cb` delivery.
    pub fn accept(&self, conn_cb: ConnCb, data_cb: DataCb) -> Result<()> {
        self.send_cmd(EngineCmd::Accept { conn_id: self.conn_id, conn_cb, data_cb })
    }

    /// `write(conn, buf, len, cb, ctx)` (spec.md §6). The only handle
    /// method the spec allows calling off the engine loop; it
    /// self-schedules unconditionally (spec.md §5).
    pub fn write(&self, buf: Vec<u8>, cb: Option<WriteCb>) -> Result<()> {
        self.send_cmd(EngineCmd::Write { conn_id: self.conn_id, buf, cb })
    }

    /// `close_write(conn)` (spec.md §6, §4.8). Idempotent.
    pub fn close_write(&self) -> Result<()> {
        self.send_cmd(EngineCmd::CloseWrite { conn_id: self.conn_id })
    }

    /// `close(conn)` (spec.md §6), i.e. `disconnect` (spec.md §4.8).
    pub fn close(&self) -> Result<()> {
        self.send_cmd(EngineCmd::Disconnect { conn_id: self.conn_id })
    }
}

/// `Flags.EDGE_FIN` helper shared by the write and read paths.
pub(crate) fn fin_flags() -> Flags {
    Flags::EDGE_FIN
}
