//! Link lifecycle state machine.

/// Lifecycle state of a serial link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session running.
    Closed,
    /// Physical connection being established.
    Opening,
    /// Connected, but discarding line noise until a quiet period elapses.
    Draining,
    /// Trusted and relaying.
    Open,
    /// A driver or framing error ended the session; terminal until re-opened.
    Failed,
}

impl LinkState {
    /// Whether the lifecycle table permits moving from `self` to `to`.
    ///
    /// Transitions are explicit assignments validated against this table;
    /// anything else is a caller bug and is rejected.
    pub fn can_transition(self, to: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, to),
            (Closed, Opening)
                | (Opening, Draining)
                | (Opening, Failed)
                | (Opening, Closed)
                | (Draining, Open)
                | (Draining, Failed)
                | (Draining, Closed)
                | (Open, Failed)
                | (Open, Closed)
        )
    }

    /// Lower-case name for logs.
    pub fn name(self) -> &'static str {
        match self {
            LinkState::Closed => "closed",
            LinkState::Opening => "opening",
            LinkState::Draining => "draining",
            LinkState::Open => "open",
            LinkState::Failed => "failed",
        }
    }
}
