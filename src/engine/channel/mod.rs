//! The `Channel` capability: a multiplexed connection to a single edge
//! router, carrying many logical connections identified by `ConnId`
//! (spec.md §3, §6). The real wire transport (TLS multiplex, heartbeats,
//! framing) is an external collaborator and out of scope for this crate
//! (spec.md §1); what lives here is the trait boundary the connect
//! pipeline and data plane are written against, plus the process-wide
//! (here: context-wide) registry keyed by ingress address.

pub mod test_support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::engine::error::{Error, ErrorKind, Result};
use crate::engine::message::Message;

/// Locally-unique id of a `Channel`, distinct from a `ConnId`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    pub(crate) fn next() -> ChannelId {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An inbound message addressed to a specific connection, as delivered
/// by a `Channel`'s multiplexer onto the engine loop.
#[derive(Debug)]
pub struct InboundEnvelope {
    pub conn_id: u32,
    pub message: Message,
}

/// A multiplexed connection to one edge router.
///
/// `send` is fire-and-forget (used for data and teardown messages with
/// no reply expected); `send_for_reply` is used for the one-shot
/// request/reply exchanges of the connect pipeline (`Connect`/`Bind`,
/// `DialSuccess`).
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn ingress_address(&self) -> &str;

    async fn send(&self, msg: Message) -> Result<()>;

    async fn send_for_reply(&self, msg: Message) -> Result<Message>;
}

/// Creates (or reuses) a `Channel` to a given ingress address.
///
/// Modeled on the external `ziti_channel_connect`-shaped interface from
/// spec.md §6: idempotent on an already-open channel to the same
/// address.
#[async_trait::async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, ingress_address: &str) -> Result<Arc<dyn Channel>>;
}

/// A cheap, `Clone`-able handle onto the shared channel cache, usable from
/// the spawned tasks that perform a router race's concurrent
/// `ChannelConnector::connect` calls without needing `&mut Context`
/// (spec.md §4.2: many candidate routers are dialed concurrently).
#[derive(Clone)]
pub struct ChannelRegistryHandle {
    connector: Arc<dyn ChannelConnector>,
    channels: Arc<Mutex<HashMap<String, Arc<dyn Channel>>>>,
}

impl ChannelRegistryHandle {
    /// Connects to `ingress_address`, reusing an existing channel if one
    /// is already open (spec.md §6: "idempotent on an existing
    /// channel"). Safe to call concurrently from multiple race tasks: if
    /// two callers race past the initial cache miss, only the first
    /// `connector.connect` result to return is kept in the cache and
    /// handed to every caller, so the registry never holds two channels
    /// for the same address.
    pub async fn connect(&self, ingress_address: &str) -> Result<Arc<dyn Channel>> {
        if let Some(ch) = self.channels.lock().unwrap().get(ingress_address).cloned() {
            return Ok(ch);
        }
        let ch = self.connector.connect(ingress_address).await?;
        let mut channels = self.channels.lock().unwrap();
        let ch = channels
            .entry(ingress_address.to_string())
            .or_insert(ch)
            .clone();
        Ok(ch)
    }

    /// Evicts a channel that failed to connect (spec.md §4.2: "evict the
    /// failed channel from the process-wide channel map").
    pub fn evict(&self, ingress_address: &str) {
        self.channels.lock().unwrap().remove(ingress_address);
    }

    pub fn get(&self, ingress_address: &str) -> Option<Arc<dyn Channel>> {
        self.channels.lock().unwrap().get(ingress_address).cloned()
    }
}

/// Context-wide map from ingress address to an open `Channel`
/// (spec.md §3 / §5: "process-wide channels mapping ... shared by all
/// ConnectAttempts"; here scoped to a single `Context` rather than a
/// true process global, per spec.md §9's design note).
pub struct ChannelRegistry {
    handle: ChannelRegistryHandle,
    inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
}

impl ChannelRegistry {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
    ) -> Self {
        ChannelRegistry {
            handle: ChannelRegistryHandle {
                connector,
                channels: Arc::new(Mutex::new(HashMap::new())),
            },
            inbound_tx,
        }
    }

    /// A sender any `Channel` implementation can clone and use to
    /// deliver `dispatch_inbound(conn_id, message)` onto the engine
    /// loop.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundEnvelope> {
        self.inbound_tx.clone()
    }

    /// A cloneable handle race tasks can move into a spawned future.
    pub fn handle(&self) -> ChannelRegistryHandle {
        self.handle.clone()
    }

    /// Returns a cached channel for `ingress_address`, if one exists.
    pub fn get(&self, ingress_address: &str) -> Option<Arc<dyn Channel>> {
        self.handle.get(ingress_address)
    }

    /// Connects to `ingress_address`, reusing an existing channel if one
    /// is already open.
    pub async fn connect(&self, ingress_address: &str) -> Result<Arc<dyn Channel>> {
        self.handle.connect(ingress_address).await
    }

    /// Evicts a channel that failed to connect.
    pub fn evict(&self, ingress_address: &str) {
        self.handle.evict(ingress_address)
    }
}

pub(crate) fn channel_error() -> Error {
    Error::simple(ErrorKind::Channel)
}
