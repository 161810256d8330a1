//! An in-memory `Channel`/`ChannelConnector` double used by this crate's
//! own test suite (spec.md §8 properties and scenarios).
//!
//! Grounded on the shape of the teacher's
//! `communication::socket::async_std_tcp` transport (a tiny async
//! connect/accept wrapper) but swapped for a scripted in-process double,
//! since the real wire transport is an out-of-scope external collaborator
//! (spec.md §1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::engine::error::Result;
use crate::engine::message::Message;

use super::{Channel, ChannelConnector, ChannelId, InboundEnvelope};

/// What a scripted edge router does when it receives a `send_for_reply`
/// request (`Connect`/`Bind`/`DialSuccess`).
#[derive(Clone)]
pub enum ReplyScript {
    /// Reply with `Message` after `Duration` has elapsed.
    After(Duration, Message),
    /// Never reply (used to exercise the per-attempt and per-write
    /// timeouts).
    Never,
}

pub type Responder = Arc<dyn Fn(&Message) -> ReplyScript + Send + Sync>;

/// Scripted behavior of a single edge router ingress address.
#[derive(Clone)]
pub struct RouterScript {
    pub connect_delay: Duration,
    pub connect_ok: bool,
    pub responder: Responder,
}

impl RouterScript {
    pub fn succeeds_after(delay: Duration, responder: Responder) -> Self {
        RouterScript { connect_delay: delay, connect_ok: true, responder }
    }

    pub fn fails_after(delay: Duration) -> Self {
        RouterScript {
            connect_delay: delay,
            connect_ok: false,
            responder: Arc::new(|_| ReplyScript::Never),
        }
    }
}

/// A `ChannelConnector` whose behavior per ingress address is scripted
/// ahead of time by a test.
#[derive(Default, Clone)]
pub struct ScriptedConnector {
    routers: Arc<Mutex<HashMap<String, RouterScript>>>,
    /// Every message any scripted channel's `send` was called with,
    /// keyed by ingress address — used to assert write-path properties
    /// (monotonic `Seq`, FIN ordering, ...).
    pub sent: Arc<Mutex<HashMap<String, Vec<Message>>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, ingress_address: &str, script: RouterScript) {
        self.routers.lock().unwrap().insert(ingress_address.to_string(), script);
    }

    pub fn sent_to(&self, ingress_address: &str) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .get(ingress_address)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn connect(&self, ingress_address: &str) -> Result<Arc<dyn Channel>> {
        let script = self
            .routers
            .lock()
            .unwrap()
            .get(ingress_address)
            .cloned()
            .unwrap_or_else(|| RouterScript::fails_after(Duration::from_millis(0)));

        if !script.connect_delay.is_zero() {
            tokio::time::sleep(script.connect_delay).await;
        }
        if !script.connect_ok {
            return Err(super::channel_error());
        }
        Ok(Arc::new(ScriptedChannel {
            id: ChannelId::next(),
            ingress: ingress_address.to_string(),
            responder: script.responder,
            sent: self.sent.clone(),
        }))
    }
}

struct ScriptedChannel {
    id: ChannelId,
    ingress: String,
    responder: Responder,
    sent: Arc<Mutex<HashMap<String, Vec<Message>>>>,
}

#[async_trait::async_trait]
impl Channel for ScriptedChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn ingress_address(&self) -> &str {
        &self.ingress
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .entry(self.ingress.clone())
            .or_default()
            .push(msg);
        Ok(())
    }

    async fn send_for_reply(&self, msg: Message) -> Result<Message> {
        self.sent
            .lock()
            .unwrap()
            .entry(self.ingress.clone())
            .or_default()
            .push(msg.clone());
        match (self.responder)(&msg) {
            ReplyScript::After(delay, reply) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(reply)
            }
            ReplyScript::Never => futures::future::pending().await,
        }
    }
}

/// Delivers an inbound `Data`/`StateClosed` message to the engine loop
/// as if the peer had sent it through a `Channel`'s multiplexer.
pub fn deliver_inbound(tx: &mpsc::UnboundedSender<InboundEnvelope>, conn_id: u32, message: Message) {
    let _ = tx.send(InboundEnvelope { conn_id, message });
}
