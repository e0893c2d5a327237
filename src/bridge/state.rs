//! Socket connection state machine.

use crate::core::BridgeError;

/// Lifecycle state of the bridge's socket side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No listener and no client.
    Closed,
    /// Listener bound, waiting for the single client.
    Connecting,
    /// A client is attached and the relay is active.
    Connected,
}

impl ConnectionState {
    /// Move to `to`, validating against the lifecycle table.
    ///
    /// Transitions are explicit assignments checked here; an out-of-table
    /// move is a caller bug and surfaces as
    /// [`BridgeError::IllegalTransition`].
    pub fn advance(self, to: ConnectionState) -> Result<ConnectionState, BridgeError> {
        use ConnectionState::*;
        match (self, to) {
            (Closed, Connecting) | (Connecting, Connected) | (Connecting, Closed)
            | (Connected, Closed) => Ok(to),
            (from, to) => Err(BridgeError::IllegalTransition {
                from: from.name(),
                to: to.name(),
            }),
        }
    }

    /// Lower-case name for logs.
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cycle_permitted() {
        let s = ConnectionState::Closed;
        let s = s.advance(ConnectionState::Connecting).unwrap();
        let s = s.advance(ConnectionState::Connected).unwrap();
        let s = s.advance(ConnectionState::Closed).unwrap();
        // Abandoned listen cycle also returns to closed.
        let s = s.advance(ConnectionState::Connecting).unwrap();
        s.advance(ConnectionState::Closed).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        // A client cannot appear without a listener.
        let err = ConnectionState::Closed
            .advance(ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, BridgeError::IllegalTransition { .. }));
        assert!(
            ConnectionState::Connected
                .advance(ConnectionState::Connecting)
                .is_err()
        );
        // Staying put is not a transition.
        assert!(
            ConnectionState::Connected
                .advance(ConnectionState::Connected)
                .is_err()
        );
    }
}
