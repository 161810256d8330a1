//! A `Session`: `{id, token, session_type, edge_routers[]}`
//! (spec.md §3), cached by the engine keyed by service id.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// Whether a session grants client-initiates-stream (`Dial`) or
/// hosting-side-advertises-service (`Bind`) access (GLOSSARY).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionType {
    Dial,
    Bind,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct EdgeRouter {
    pub name: String,
    pub ingress_tls_address: String,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub session_type: SessionType,
    pub edge_routers: Vec<EdgeRouter>,
}
