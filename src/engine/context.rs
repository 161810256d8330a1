//! The single-threaded cooperative engine loop (spec.md §5): the one
//! task that ever mutates a `ConnectionState`. Every other public
//! surface — `Connection` methods, spawned-task completions, inbound
//! `Channel` dispatch — submits an `EngineCmd` (or an `InboundEnvelope`)
//! and returns; the loop below is what actually runs handlers to
//! completion one at a time, matching spec.md §5's "no suspension
//! points within a single handler".
//!
//! Grounded on `original_source/library/ziti_connect_async`'s
//! `uv_async_t` dispatch pattern: many producers wake a single consumer
//! loop, translated here to an `mpsc` channel read by one spawned tokio
//! task instead of a libuv async handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::engine::callbacks::{ClientCb, ConnCb, DataCb, ListenCb, WriteCb};
use crate::engine::channel::{Channel, ChannelConnector, ChannelRegistry, InboundEnvelope};
use crate::engine::conn::{ConnId, Connection, ConnectionState};
use crate::engine::controller::Controller;
use crate::engine::dataplane;
use crate::engine::message::{ContentType, Header, Message};
use crate::engine::model::{Service, Session};
use crate::engine::state::ConnState;
use crate::engine::{async_runtime, bind, connect, error::Result};

/// Work submitted onto the engine loop. Variants fall into three groups:
/// application-facing requests forwarded from a `Connection` handle
/// (`Dial`..`Disconnect`), async completions the engine itself spawned
/// and is waiting to hear back from (`ServiceResolved`..`DisconnectSent`),
/// and the coalescing flusher's own wake-up (`Flush`).
pub(crate) enum EngineCmd {
    Register { conn_id: ConnId },
    Dial { conn_id: ConnId, service_name: String, conn_cb: ConnCb, data_cb: DataCb },
    Bind { conn_id: ConnId, service_name: String, listen_cb: ListenCb, client_cb: ClientCb },
    Accept { conn_id: ConnId, conn_cb: ConnCb, data_cb: DataCb },
    Write { conn_id: ConnId, buf: Vec<u8>, cb: Option<WriteCb> },
    CloseWrite { conn_id: ConnId },
    Disconnect { conn_id: ConnId },

    ServiceResolved { conn_id: ConnId, result: Result<Option<Service>> },
    SessionResolved { conn_id: ConnId, service: Service, result: Result<Option<Session>> },
    ChannelConnected { conn_id: ConnId, ingress_address: String, result: Result<Arc<dyn Channel>> },
    ConnectReplyReceived { conn_id: ConnId, channel: Arc<dyn Channel>, reply: Result<Message> },
    ConnectTimeout { conn_id: ConnId },

    WriteCompleted { conn_id: ConnId, write_id: u64, status: Result<()> },
    WriteTimeout { conn_id: ConnId, write_id: u64 },

    DisconnectSent { conn_id: ConnId },

    Flush { conn_id: ConnId },
}

/// The engine-loop-local state a `Context` owns (spec.md §3, §5):
/// every live connection, the service/session caches, and the
/// process-wide (here: context-wide) channel registry. Nothing here is
/// a true process global — all of it lives behind this one struct,
/// reachable only from the engine task.
pub(crate) struct Context {
    pub(crate) conns: HashMap<ConnId, ConnectionState>,
    pub(crate) service_cache: HashMap<String, Service>,
    pub(crate) session_cache: HashMap<String, Session>,
    pub(crate) registry: ChannelRegistry,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) cmds: mpsc::UnboundedSender<EngineCmd>,
    pub(crate) default_timeout: Duration,
}

/// What an application provides to stand up an `Engine` (spec.md §6's
/// `InitConfig`-shaped bootstrap, scoped per-engine instead of
/// process-global per spec.md §9's design note).
pub struct EngineConfig {
    pub controller: Arc<dyn Controller>,
    pub channel_connector: Arc<dyn ChannelConnector>,
    /// Default per-connection timeout (spec.md §3's `timeout` attribute),
    /// used for both the connect race (§4.2) and individual writes
    /// (§4.5) unless overridden per connection in a future revision.
    pub default_timeout: Duration,
}

/// The public handle applications hold to mint connections (spec.md
/// §6: `connection_new(ctx, app_ctx)`). Cloning an `Engine` is cheap;
/// every clone talks to the same engine task.
#[derive(Clone)]
pub struct Engine {
    cmds: mpsc::UnboundedSender<EngineCmd>,
    inbound: mpsc::UnboundedSender<InboundEnvelope>,
}

impl Engine {
    /// Spawns the engine loop onto the async runtime and returns a
    /// handle to it. The loop runs until every `Engine` clone and every
    /// `Connection` minted from it has been dropped.
    pub fn spawn(config: EngineConfig) -> Engine {
        let (cmds_tx, cmds_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let registry = ChannelRegistry::new(config.channel_connector, inbound_tx.clone());
        let ctx = Context {
            conns: HashMap::new(),
            service_cache: HashMap::new(),
            session_cache: HashMap::new(),
            registry,
            controller: config.controller,
            cmds: cmds_tx.clone(),
            default_timeout: config.default_timeout,
        };
        async_runtime::spawn(run_loop(ctx, cmds_rx, inbound_rx));
        Engine { cmds: cmds_tx, inbound: inbound_tx }
    }

    /// `connection_new(ctx, app_ctx) -> conn` (spec.md §6). Allocates in
    /// state `Initial`. There is no separate `app_ctx` to carry: the
    /// application's own closures captured by `dial`/`bind`/`write`
    /// already own whatever context they need (spec.md §9's tagged
    /// callback-kind redesign).
    pub fn connection_new(&self) -> Connection {
        let conn_id = ConnId::fresh();
        let _ = self.cmds.send(EngineCmd::Register { conn_id });
        Connection::new(conn_id, self.cmds.clone())
    }

    /// A sender a `Channel`'s multiplexer dispatches inbound messages
    /// through (spec.md §3, §6: `Channel::dispatch_inbound`). A real
    /// `ChannelConnector`/`Channel` pair reads this off whatever the
    /// application wires them with at construction time; this crate's
    /// own `ScriptedChannel` test double is driven the same way via
    /// `channel::test_support::deliver_inbound`.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundEnvelope> {
        self.inbound.clone()
    }
}

async fn run_loop(
    mut ctx: Context,
    mut cmds_rx: mpsc::UnboundedReceiver<EngineCmd>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEnvelope>,
) {
    loop {
        tokio::select! {
            cmd = cmds_rx.recv() => match cmd {
                Some(cmd) => handle_cmd(&mut ctx, cmd),
                None => break,
            },
            env = inbound_rx.recv() => match env {
                Some(env) => dataplane::handle_inbound_message(
                    &mut ctx,
                    ConnId::from(env.conn_id),
                    env.message,
                ),
                None => break,
            },
        }
        reap_closed(&mut ctx);
    }
}

fn handle_cmd(ctx: &mut Context, cmd: EngineCmd) {
    match cmd {
        EngineCmd::Register { conn_id } => {
            ctx.conns.insert(conn_id, ConnectionState::new(conn_id, ctx.default_timeout));
        }
        EngineCmd::Dial { conn_id, service_name, conn_cb, data_cb } => {
            connect::handle_dial(ctx, conn_id, service_name, conn_cb, data_cb);
        }
        EngineCmd::Bind { conn_id, service_name, listen_cb, client_cb } => {
            connect::handle_bind(ctx, conn_id, service_name, listen_cb, client_cb);
        }
        EngineCmd::Accept { conn_id, conn_cb, data_cb } => {
            bind::handle_accept(ctx, conn_id, conn_cb, data_cb);
        }
        EngineCmd::Write { conn_id, buf, cb } => {
            dataplane::write::handle_write(ctx, conn_id, buf, cb);
        }
        EngineCmd::CloseWrite { conn_id } => {
            dataplane::write::handle_close_write(ctx, conn_id);
        }
        EngineCmd::Disconnect { conn_id } => handle_disconnect(ctx, conn_id),

        EngineCmd::ServiceResolved { conn_id, result } => {
            connect::handle_service_resolved(ctx, conn_id, result);
        }
        EngineCmd::SessionResolved { conn_id, service, result } => {
            connect::handle_session_resolved(ctx, conn_id, service, result);
        }
        EngineCmd::ChannelConnected { conn_id, ingress_address, result } => {
            connect::handle_channel_connected(ctx, conn_id, ingress_address, result);
        }
        EngineCmd::ConnectReplyReceived { conn_id, channel, reply } => {
            connect::handle_connect_reply(ctx, conn_id, channel, reply);
        }
        EngineCmd::ConnectTimeout { conn_id } => connect::handle_connect_timeout(ctx, conn_id),

        EngineCmd::WriteCompleted { conn_id, write_id, status } => {
            dataplane::write::handle_write_completed(ctx, conn_id, write_id, status);
        }
        EngineCmd::WriteTimeout { conn_id, write_id } => {
            dataplane::write::handle_write_timeout(ctx, conn_id, write_id);
        }

        EngineCmd::DisconnectSent { conn_id } => {
            if let Some(conn) = ctx.conns.get_mut(&conn_id) {
                conn.state = ConnState::Closed;
            }
        }

        EngineCmd::Flush { conn_id } => dataplane::run_flush(ctx, conn_id),
    }
}

/// `disconnect` (spec.md §4.8): idempotent via the state guard on
/// `ConnState::disconnect_sends_state_closed`. Sends a bodyless
/// `StateClosed` whose completion marks the connection `Closed`; in any
/// other state there is nothing to do; the FSM already covers it.
fn handle_disconnect(ctx: &mut Context, conn_id: ConnId) {
    let (should_send, channel) = match ctx.conns.get(&conn_id) {
        Some(c) => (c.state.disconnect_sends_state_closed(), c.channel.clone()),
        None => return,
    };
    if !should_send {
        return;
    }
    let channel = match channel {
        Some(c) => c,
        None => return,
    };

    let msg = Message::new(ContentType::StateClosed, vec![Header::ConnId(conn_id.into())], Vec::new());
    let cmds = ctx.cmds.clone();
    async_runtime::spawn(async move {
        if let Err(e) = channel.send(msg).await {
            log::warn!(target: "meshline::context", "conn {:?} disconnect send failed: {}", conn_id, e);
        }
        let _ = cmds.send(EngineCmd::DisconnectSent { conn_id });
    });
}

/// `reap` (spec.md §4.8), run opportunistically after every command and
/// every inbound dispatch: removes any connection that is `Closed` with
/// no outstanding writes, warning if bytes were still sitting in its
/// inbound buffer.
fn reap_closed(ctx: &mut Context) {
    let reapable: Vec<ConnId> =
        ctx.conns.iter().filter(|(_, c)| c.reapable()).map(|(id, _)| *id).collect();

    for conn_id in reapable {
        if let Some(conn) = ctx.conns.get(&conn_id) {
            if !conn.inbound.is_empty() {
                log::warn!(
                    target: "meshline::context",
                    "conn {:?} reaped with {} residual inbound bytes",
                    conn_id,
                    conn.inbound.len()
                );
            }
        }
        ctx.conns.remove(&conn_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Context, Engine, EngineConfig};
    use crate::engine::callbacks::{DataCb, DataEvent};
    use crate::engine::channel::test_support::{deliver_inbound, ReplyScript, RouterScript, ScriptedConnector};
    use crate::engine::channel::ChannelRegistry;
    use crate::engine::conn::{Connection, ConnId, ConnectionState};
    use crate::engine::controller::Controller;
    use crate::engine::crypto;
    use crate::engine::dataplane::write::{handle_write_completed, handle_write_timeout, WriteRequest};
    use crate::engine::error::{ErrorKind, Result};
    use crate::engine::message::{ContentType, Flags, Header, Message};
    use crate::engine::model::{EdgeRouter, Service, Session, SessionType};

    struct StubController {
        service: Service,
        session: Session,
    }

    #[async_trait::async_trait]
    impl Controller for StubController {
        async fn get_service(&self, _name: &str) -> Result<Option<Service>> {
            Ok(Some(self.service.clone()))
        }

        async fn get_net_session(&self, _service: &Service, _session_type: SessionType) -> Result<Option<Session>> {
            Ok(Some(self.session.clone()))
        }
    }

    fn dialable_service(encryption_required: bool) -> Service {
        Service::new("svc-1".into(), "widget-api".into(), vec!["Dial".into()], encryption_required)
    }

    fn bindable_service() -> Service {
        Service::new("svc-2".into(), "widget-host".into(), vec!["Bind".into()], false)
    }

    fn session_with(routers: &[&str], session_type: SessionType) -> Session {
        Session {
            id: "sess-1".into(),
            token: "token-abc".into(),
            session_type,
            edge_routers: routers
                .iter()
                .map(|name| EdgeRouter { name: name.to_string(), ingress_tls_address: name.to_string() })
                .collect(),
        }
    }

    fn noop_data_cb() -> DataCb {
        Box::new(|_| 0)
    }

    fn spawn_engine(service: Service, session: Session, connector: ScriptedConnector, timeout: Duration) -> Engine {
        Engine::spawn(EngineConfig {
            controller: Arc::new(StubController { service, session }),
            channel_connector: Arc::new(connector),
            default_timeout: timeout,
        })
    }

    fn state_connected(headers: Vec<Header>) -> ReplyScript {
        ReplyScript::After(Duration::from_millis(0), Message::new(ContentType::StateConnected, headers, Vec::new()))
    }

    /// Scenario S1 (spec.md §8): two routers race, the first to connect
    /// and complete the Edge-Connect round trip wins; the slower router's
    /// channel is dropped without ever sending a Connect of its own.
    #[tokio::test(start_paused = true)]
    async fn s1_happy_dial_adopts_first_winning_router() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );
        connector.script(
            "r2",
            RouterScript::succeeds_after(Duration::from_millis(20), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1", "r2"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();

        let result = rx.await.expect("conn_cb dropped");
        assert!(result.is_ok());
        assert!(!connector.sent_to("r1").is_empty());

        // Let r2's slower connect resolve too, well within the attempt's
        // overall timeout; it must never reach the Edge-Connect step.
        tokio::time::advance(Duration::from_millis(25)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(
            connector.sent_to("r2").is_empty(),
            "a losing router must never receive a Connect request"
        );
    }

    /// Scenario S2 (spec.md §8): neither router ever replies to the
    /// Edge-Connect request; the per-attempt timeout fires and fails the
    /// dial with `Timeout`.
    #[tokio::test(start_paused = true)]
    async fn s2_connect_times_out_when_no_router_replies() {
        let connector = ScriptedConnector::new();
        for router in ["r1", "r2"] {
            connector.script(
                router,
                RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| ReplyScript::Never)),
            );
        }

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1", "r2"], SessionType::Dial),
            connector.clone(),
            Duration::from_millis(50),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;

        let result = rx.await.expect("conn_cb dropped");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    /// Scenario S3 (spec.md §8): an encryption-required service completes
    /// a real KX handshake and the peer's first `Data` (the stream
    /// header) followed by a sealed chunk decrypts to the original bytes.
    #[tokio::test(start_paused = true)]
    async fn s3_encrypted_dial_decrypts_inbound_stream_from_peer() {
        let connector = ScriptedConnector::new();
        let peer_tx_key: Arc<Mutex<Option<[u8; 32]>>> = Arc::new(Mutex::new(None));
        let peer_tx_key_responder = peer_tx_key.clone();

        connector.script(
            "r1",
            RouterScript::succeeds_after(
                Duration::from_millis(0),
                Arc::new(move |msg: &Message| {
                    let client_pk_bytes = msg.public_key().expect("Connect carries a client PublicKey").to_vec();
                    let client_pk = crypto::kx::public_key_from_bytes(&client_pk_bytes).expect("valid client pk");
                    let (peer_pk, peer_sk) = crypto::keypair();
                    let peer_session = crypto::server_session_keys(&peer_pk, &peer_sk, &client_pk)
                        .expect("derive peer session keys");
                    *peer_tx_key_responder.lock().unwrap() = Some(peer_session.tx);
                    state_connected(vec![Header::PublicKey(peer_pk.as_ref().to_vec())])
                }),
            ),
        );

        let engine = spawn_engine(
            dialable_service(true),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_cb = received.clone();
        let data_cb: DataCb = Box::new(move |ev| {
            if let DataEvent::Chunk(bytes) = ev {
                received_cb.lock().unwrap().extend_from_slice(bytes);
                bytes.len() as i64
            } else {
                0
            }
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), data_cb).unwrap();
        let result = rx.await.expect("conn_cb dropped");
        assert!(result.is_ok(), "encrypted dial should establish a session");

        let peer_tx = peer_tx_key.lock().unwrap().take().expect("responder ran");
        let (mut push_state, header) = crypto::init_push(&peer_tx).expect("init_push");
        let inbound_tx = engine.inbound_sender();
        deliver_inbound(&inbound_tx, conn.id().into(), Message::new(ContentType::Data, vec![], header.to_vec()));
        let sealed = crypto::push(&mut push_state, b"hello from the peer").expect("seal chunk");
        deliver_inbound(&inbound_tx, conn.id().into(), Message::new(ContentType::Data, vec![], sealed));

        for _ in 0..20 {
            if received.lock().unwrap().len() == b"hello from the peer".len() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(&received.lock().unwrap()[..], b"hello from the peer");
    }

    /// Property 3 (spec.md §8): the FIN message uses the next sequence
    /// number after the last data message.
    #[tokio::test]
    async fn property3_fin_uses_next_sequence_after_last_data_message() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();
        rx.await.expect("conn_cb dropped").expect("dial succeeds");

        let (wtx, wrx) = tokio::sync::oneshot::channel();
        conn.write(b"ping".to_vec(), Some(Box::new(move |res| { let _ = wtx.send(res); }))).unwrap();
        wrx.await.expect("write_cb dropped").expect("write succeeds");

        conn.close_write().unwrap();
        for _ in 0..20 {
            let sent = connector.sent_to("r1");
            if sent.iter().filter(|m| m.content_type == ContentType::Data).count() >= 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let sent = connector.sent_to("r1");
        let data_msgs: Vec<&Message> = sent.iter().filter(|m| m.content_type == ContentType::Data).collect();
        assert_eq!(data_msgs.len(), 2, "expected exactly one write and one FIN");
        let write_seq = data_msgs[0].seq().expect("write carries a Seq header");
        let fin = data_msgs[1];
        assert!(fin.flags().contains(Flags::EDGE_FIN));
        assert_eq!(fin.seq(), Some(write_seq + 1));
    }

    /// Property 9 (spec.md §8): calling `close_write` twice only ever
    /// emits one FIN.
    #[tokio::test]
    async fn property9_close_write_is_idempotent() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();
        rx.await.expect("conn_cb dropped").expect("dial succeeds");

        conn.close_write().unwrap();
        conn.close_write().unwrap();

        for _ in 0..20 {
            if connector.sent_to("r1").iter().any(|m| m.content_type == ContentType::Data) {
                break;
            }
            tokio::task::yield_now().await;
        }

        let fin_count = connector.sent_to("r1").iter().filter(|m| m.content_type == ContentType::Data).count();
        assert_eq!(fin_count, 1, "close_write called twice must only emit one FIN");
    }

    /// Property 8 (spec.md §8): an encryption-required service whose peer
    /// never supplies a `PublicKey` fails the connection with
    /// `CryptoFail` rather than silently falling back to plaintext.
    #[tokio::test(start_paused = true)]
    async fn property8_crypto_required_but_absent_fails_connection() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(true),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();

        let result = rx.await.expect("conn_cb dropped");
        let err = result.expect_err("an encryption-required service without a peer PublicKey must fail");
        assert_eq!(err.kind(), ErrorKind::CryptoFail);
    }

    /// Property 7 (spec.md §8): a write whose timer fires before its
    /// racing send completes is remembered as orphaned; the eventual
    /// completion is absorbed without touching `write_reqs` again or
    /// invoking `cb` a second time.
    #[test]
    fn property7_orphaned_write_completion_is_absorbed_without_double_callback() {
        let conn_id = ConnId::fresh();
        let mut state = ConnectionState::new(conn_id, Duration::from_secs(5));

        let calls = Arc::new(Mutex::new(0u32));
        let calls_cb = calls.clone();
        let req = WriteRequest::new(
            conn_id,
            b"x".to_vec(),
            Some(Box::new(move |_res| {
                *calls_cb.lock().unwrap() += 1;
            })),
        );
        state.write_reqs.insert(0, req);

        let mut conns = HashMap::new();
        conns.insert(conn_id, state);

        let (cmds_tx, _cmds_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let registry = ChannelRegistry::new(Arc::new(ScriptedConnector::new()), inbound_tx);

        let mut ctx = Context {
            conns,
            service_cache: HashMap::new(),
            session_cache: HashMap::new(),
            registry,
            controller: Arc::new(StubController {
                service: dialable_service(false),
                session: session_with(&["r1"], SessionType::Dial),
            }),
            cmds: cmds_tx,
            default_timeout: Duration::from_secs(5),
        };

        handle_write_timeout(&mut ctx, conn_id, 0);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(ctx.conns[&conn_id].orphaned_writes.contains(&0));
        assert!(!ctx.conns[&conn_id].write_reqs.contains_key(&0));

        handle_write_completed(&mut ctx, conn_id, 0, Ok(()));
        assert_eq!(*calls.lock().unwrap(), 1, "a write already failed by timeout must not invoke cb again");
    }

    /// Spec.md §4.7: an inbound `Dial` against a `Bound` connection forks
    /// a child in `Accepting` state and hands it to `client_cb`;
    /// `accept()` then drives the `DialSuccess` round trip to `Connected`.
    #[tokio::test(start_paused = true)]
    async fn bind_accept_round_trip_forks_child_and_delivers_dial_success() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(
                Duration::from_millis(0),
                Arc::new(|msg: &Message| match msg.content_type {
                    ContentType::Bind | ContentType::DialSuccess => state_connected(vec![]),
                    _ => ReplyScript::Never,
                }),
            ),
        );

        let engine = spawn_engine(
            bindable_service(),
            session_with(&["r1"], SessionType::Bind),
            connector.clone(),
            Duration::from_secs(5),
        );
        let parent = engine.connection_new();

        let children: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
        let children_cb = children.clone();

        let (listen_tx, listen_rx) = tokio::sync::oneshot::channel();
        parent
            .bind(
                "widget-host",
                Box::new(move |res| { let _ = listen_tx.send(res); }),
                Box::new(move |child| children_cb.lock().unwrap().push(child)),
            )
            .unwrap();
        listen_rx.await.expect("listen_cb dropped").expect("bind succeeds");

        let inbound_tx = engine.inbound_sender();
        let dial_msg = Message::new(ContentType::Dial, vec![Header::Seq(7)], Vec::new());
        deliver_inbound(&inbound_tx, parent.id().into(), dial_msg);

        let mut child = None;
        for _ in 0..20 {
            if let Some(c) = children.lock().unwrap().pop() {
                child = Some(c);
                break;
            }
            tokio::task::yield_now().await;
        }
        let child = child.expect("client_cb delivered a child connection");

        let (conn_tx, conn_rx) = tokio::sync::oneshot::channel();
        child.accept(Box::new(move |res| { let _ = conn_tx.send(res); }), noop_data_cb()).unwrap();

        let result = conn_rx.await.expect("conn_cb dropped");
        assert!(result.is_ok(), "accept() should complete the DialSuccess round trip");
    }

    /// Scenario S4 (spec.md §8): two writes in flight when `close_write`
    /// is called; the FIN is deferred until the second completion, not
    /// emitted synchronously at the `close_write` call itself.
    #[tokio::test]
    async fn s4_close_write_defers_fin_until_last_write_completes() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), noop_data_cb()).unwrap();
        rx.await.expect("conn_cb dropped").expect("dial succeeds");

        let (w1_tx, w1_rx) = tokio::sync::oneshot::channel();
        let (w2_tx, w2_rx) = tokio::sync::oneshot::channel();
        conn.write(b"one".to_vec(), Some(Box::new(move |res| { let _ = w1_tx.send(res); }))).unwrap();
        conn.write(b"two".to_vec(), Some(Box::new(move |res| { let _ = w2_tx.send(res); }))).unwrap();

        conn.close_write().unwrap();

        // Give the writes' spawned sends a chance to land before the FIN
        // would be premature; with two writes outstanding, close_write
        // alone must not have emitted it yet.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let fin_before = connector
            .sent_to("r1")
            .iter()
            .filter(|m| m.content_type == ContentType::Data && m.flags().contains(Flags::EDGE_FIN))
            .count();
        assert_eq!(fin_before, 0, "FIN must not be emitted while writes are still outstanding");

        w1_rx.await.expect("write_cb dropped").expect("first write succeeds");
        w2_rx.await.expect("write_cb dropped").expect("second write succeeds");

        for _ in 0..20 {
            let fin_now = connector
                .sent_to("r1")
                .iter()
                .filter(|m| m.content_type == ContentType::Data && m.flags().contains(Flags::EDGE_FIN))
                .count();
            if fin_now == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let sent = connector.sent_to("r1");
        let data_msgs: Vec<&Message> = sent.iter().filter(|m| m.content_type == ContentType::Data).collect();
        assert_eq!(data_msgs.len(), 3, "two writes plus one FIN");
        let fin = data_msgs.last().unwrap();
        assert!(fin.flags().contains(Flags::EDGE_FIN));
        let last_data_seq = data_msgs[data_msgs.len() - 2].seq().expect("write carries Seq");
        assert_eq!(fin.seq(), Some(last_data_seq + 1));
    }

    /// Scenario S5 (spec.md §8): the peer sends two `Data` messages
    /// totaling 30 KiB then an empty `Data` carrying `EDGE_FIN`;
    /// `data_cb` is delivered 16 KiB, then 14 KiB, then `(null, EOF)`,
    /// and a follow-up flush delivers nothing further.
    #[tokio::test]
    async fn s5_inbound_fin_drain_delivers_chunks_then_eof_once() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let chunk_lens: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let eof_count = Arc::new(Mutex::new(0u32));
        let received_cb = received.clone();
        let chunk_lens_cb = chunk_lens.clone();
        let eof_count_cb = eof_count.clone();
        let data_cb: DataCb = Box::new(move |ev| match ev {
            DataEvent::Chunk(bytes) => {
                received_cb.lock().unwrap().extend_from_slice(bytes);
                chunk_lens_cb.lock().unwrap().push(bytes.len());
                bytes.len() as i64
            }
            DataEvent::Eof => {
                *eof_count_cb.lock().unwrap() += 1;
                0
            }
            DataEvent::Error(_) => 0,
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), data_cb).unwrap();
        rx.await.expect("conn_cb dropped").expect("dial succeeds");

        let inbound_tx = engine.inbound_sender();
        // Distinct fill bytes per message make any duplication/loss/
        // reordering visible in the reassembled buffer, independent of
        // exactly how the engine loop happens to interleave processing
        // the two Data messages against the flusher's own posted
        // `Flush` command (spec.md only pins down the aggregate
        // delivery order, not the engine's internal scheduling).
        let first: Vec<u8> = std::iter::repeat(0xAAu8).take(20 * 1024).collect();
        let second: Vec<u8> = std::iter::repeat(0xBBu8).take(10 * 1024).collect();
        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        deliver_inbound(&inbound_tx, conn.id().into(), Message::new(ContentType::Data, vec![], first));
        deliver_inbound(&inbound_tx, conn.id().into(), Message::new(ContentType::Data, vec![], second));
        deliver_inbound(
            &inbound_tx,
            conn.id().into(),
            Message::new(ContentType::Data, vec![Header::Flags(Flags::EDGE_FIN.bits())], Vec::new()),
        );

        for _ in 0..50 {
            if *eof_count.lock().unwrap() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(&received.lock().unwrap()[..], &expected[..], "bytes must arrive intact, in order, exactly once");
        assert!(
            chunk_lens.lock().unwrap().iter().all(|&n| n <= 16 * 1024),
            "no single delivery may exceed the 16 KiB flush chunk size"
        );
        assert_eq!(*eof_count.lock().unwrap(), 1);

        // A follow-up scheduled flush must deliver nothing more.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(received.lock().unwrap().len(), expected.len());
        assert_eq!(*eof_count.lock().unwrap(), 1, "EOF must never be delivered twice");
    }

    /// Scenario S6 (spec.md §8): the peer sends 20 KiB in one message;
    /// `data_cb` returns 8 KiB consumed on the first call. The next flush
    /// invocation must deliver exactly the remaining 12 KiB starting at
    /// byte 8192, with nothing duplicated or lost.
    #[tokio::test]
    async fn s6_backpressure_redelivers_exact_remaining_suffix() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let payload: Vec<u8> = (0..20 * 1024usize).map(|i| (i % 256) as u8).collect();
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let call_count = Arc::new(Mutex::new(0u32));
        let received_cb = received.clone();
        let call_count_cb = call_count.clone();
        let data_cb: DataCb = Box::new(move |ev| {
            if let DataEvent::Chunk(bytes) = ev {
                let mut calls = call_count_cb.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    received_cb.lock().unwrap().extend_from_slice(&bytes[..8 * 1024]);
                    8 * 1024
                } else {
                    received_cb.lock().unwrap().extend_from_slice(bytes);
                    bytes.len() as i64
                }
            } else {
                0
            }
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.dial("widget-api", Box::new(move |res| { let _ = tx.send(res); }), data_cb).unwrap();
        rx.await.expect("conn_cb dropped").expect("dial succeeds");

        let inbound_tx = engine.inbound_sender();
        deliver_inbound(&inbound_tx, conn.id().into(), Message::new(ContentType::Data, vec![], payload.clone()));

        for _ in 0..50 {
            if received.lock().unwrap().len() == payload.len() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(&received.lock().unwrap()[..], &payload[..]);
        assert_eq!(*call_count.lock().unwrap(), 2, "exactly one backpressured retry");
    }

    /// Property 2 (spec.md §8): the attempt is destroyed exactly when
    /// `chan_tries` reaches zero after every router callback resolves —
    /// here, a loser that connects only after the winner has already
    /// been adopted must still be accounted for (and its Edge-Connect
    /// reply, if any, silently absorbed) rather than leaking the attempt
    /// or double-invoking `conn_cb`.
    #[tokio::test(start_paused = true)]
    async fn property2_attempt_lifetime_survives_a_late_loser() {
        let connector = ScriptedConnector::new();
        connector.script(
            "r1",
            RouterScript::succeeds_after(Duration::from_millis(0), Arc::new(|_| state_connected(vec![]))),
        );
        connector.script(
            "r2",
            RouterScript::succeeds_after(Duration::from_millis(200), Arc::new(|_| state_connected(vec![]))),
        );

        let engine = spawn_engine(
            dialable_service(false),
            session_with(&["r1", "r2"], SessionType::Dial),
            connector.clone(),
            Duration::from_secs(5),
        );
        let conn = engine.connection_new();

        let cb_calls = Arc::new(Mutex::new(0u32));
        let cb_calls_cb = cb_calls.clone();
        conn.dial(
            "widget-api",
            Box::new(move |res| {
                *cb_calls_cb.lock().unwrap() += 1;
                assert!(res.is_ok());
            }),
            noop_data_cb(),
        )
        .unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*cb_calls.lock().unwrap(), 1, "conn_cb fires exactly once for the winner");

        // Let r2's late success land well after the attempt resolved.
        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *cb_calls.lock().unwrap(),
            1,
            "a loser that connects after attempt completion must not re-invoke conn_cb"
        );
        assert!(
            connector.sent_to("r2").is_empty(),
            "a late loser must never send an Edge-Connect request of its own"
        );
    }
}
