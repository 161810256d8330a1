//! Per-connection state machine (spec.md §1.2, §3).

/// The states a `Connection` transitions through. See spec.md §4.3 for
/// the transition table driven by `connect_reply_cb`, and §4.8 for
/// half-close/teardown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Initial,
    Connecting,
    Binding,
    Accepting,
    Connected,
    Bound,
    CloseWrite,
    Timedout,
    Closed,
}

impl ConnState {
    /// States in which a `disconnect` actually sends `StateClosed`
    /// (spec.md §4.8).
    pub fn disconnect_sends_state_closed(self) -> bool {
        matches!(
            self,
            ConnState::Bound | ConnState::Accepting | ConnState::Connected | ConnState::CloseWrite
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(self, ConnState::Closed)
    }
}
