//! The client-side engine: connect-race pipeline, per-connection FSM,
//! and encrypted data plane (spec.md §1).
//!
//! By default this module's internals are private; enable the
//! `expose_impl` feature to reach submodules directly for testing
//! against a `ScriptedChannel` (spec.md §9's "no hidden globals" note —
//! there is no process-wide singleton here, only a `Context` owned by
//! whichever task `Engine::spawn` started).

pub mod async_runtime;
pub mod bind;
pub mod callbacks;
pub mod channel;
pub mod conn;
pub mod connect;
pub mod context;
pub mod controller;
pub mod crypto;
pub mod dataplane;
pub mod error;
pub mod handshake;
pub mod message;
pub mod model;
pub mod ordering;
pub mod state;

pub use context::{Engine, EngineConfig};
