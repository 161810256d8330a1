//! The controller HTTP client interface the connect pipeline consumes
//! (spec.md §6). Treated strictly as a request/response black box per
//! spec.md §1 — this crate only defines the trait boundary.

use crate::engine::error::Result;
use crate::engine::model::{Service, Session, SessionType};

/// `get_service` / `get_net_session`, consumed by `engine::connect`.
///
/// A `Ok(None)` response means the resource is unavailable (spec.md
/// §4.2: "a `null` response means `SERVICE_UNAVAILABLE`") — this is
/// distinct from `Err`, which signals a transport-level failure.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    async fn get_service(&self, name: &str) -> Result<Option<Service>>;

    async fn get_net_session(
        &self,
        service: &Service,
        session_type: SessionType,
    ) -> Result<Option<Session>>;
}
