//! `meshline`: a client-side connect pipeline and encrypted data-plane
//! engine for dialing and hosting named services through a mesh of
//! edge routers.
//!
//! The engine loop itself, the per-connection FSM, the connect-race
//! pipeline, and the AEAD data plane live under `engine`, hidden by
//! default the same way `bafomet`'s internals are — enable the
//! `expose_impl` feature to reach its submodules directly, e.g. to test
//! a `Channel`/`Controller` implementation against this crate's own
//! `ScriptedChannel`/`ScriptedConnector` test harness.

#[cfg(feature = "expose_impl")]
pub mod engine;

#[cfg(not(feature = "expose_impl"))]
mod engine;

pub use engine::context::{Engine, EngineConfig};
pub use engine::conn::{ConnId, Connection};
pub use engine::state::ConnState;

pub use engine::callbacks::{ClientCb, ConnCb, DataCb, DataEvent, ListenCb, WriteCb};

pub use engine::channel::{Channel, ChannelConnector, ChannelId, InboundEnvelope};
pub use engine::controller::Controller;

pub use engine::error::{Error, ErrorKind, Result, ResultSimpleExt, ResultWrappedExt};

pub use engine::message::{ContentType, Flags, Header, Message};
pub use engine::model::{EdgeRouter, PermFlags, Service, Session, SessionType};

pub use engine::async_runtime::{init as init_runtime, Runtime};
