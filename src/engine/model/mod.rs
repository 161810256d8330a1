//! Controller-issued data types named in spec.md §3: services, sessions,
//! and their caches. Parsing/transport of these types from the
//! controller HTTP API is out of scope (spec.md §1); this module only
//! carries the shapes the connect pipeline reads.

pub mod service;
pub mod session;

pub use service::{PermFlags, Service};
pub use session::{EdgeRouter, Session, SessionType};
