//! Per-connection admission state machine

use std::fmt;

/// Where a connection is in its admission and tunnel lifecycle
///
/// ```text
/// Admitted -> ReplayChecked -> Routed -> TunnelCreated -> Open -> Closed
///     \____________\_____________\___________\____________\-> Error
/// ```
///
/// A replayed token moves `Admitted` straight to `Closed`. `Closed` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Admitted,
    ReplayChecked,
    Routed,
    TunnelCreated,
    Open,
    Closed,
    Error,
}

impl ConnectionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Error)
                | (Admitted, ReplayChecked)
                | (Admitted, Closed)
                | (ReplayChecked, Routed)
                | (Routed, TunnelCreated)
                | (Routed, Closed)
                | (TunnelCreated, Open)
                | (TunnelCreated, Closed)
                | (Open, Closed)
        )
    }

    /// Move to `next` if legal; returns whether the state changed
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.can_advance_to(next) {
            *self = next;
            true
        } else {
            tracing::trace!("Ignoring transition {} -> {}", self, next);
            false
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Admitted => "admitted",
            ConnectionState::ReplayChecked => "replay-checked",
            ConnectionState::Routed => "routed",
            ConnectionState::TunnelCreated => "tunnel-created",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
