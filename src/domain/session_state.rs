//! Session lifecycle states
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Handshaking ─► Ready ─► Actuating
//!                     │             │             │           │          │
//!                     └─────────────┴──────┬──────┴───────────┴──────────┘
//!                                          ▼
//!                                    Disconnecting ─► Disconnected
//!                                          │
//!                                          └────────► Aborted
//! ```
//!
//! `Aborted` is also reachable directly from any non-terminal state.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    Actuating,
    Disconnecting,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Aborted {
            return !self.is_terminal();
        }

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Handshaking) => true,
            (Handshaking, Ready) => true,
            (Ready, Actuating) => true,
            (Disconnecting, Disconnected) => true,
            (Connecting | Connected | Handshaking | Ready | Actuating, Disconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Actuating => "actuating",
            Self::Disconnecting => "disconnecting",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            Disconnected,
            Connecting,
            Connected,
            Handshaking,
            Ready,
            Actuating,
            Disconnecting,
            Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        assert!(!Connected.can_transition_to(Ready));
        assert!(!Connected.can_transition_to(Actuating));
        assert!(!Handshaking.can_transition_to(Actuating));
        assert!(!Actuating.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Disconnecting));
    }

    #[test]
    fn test_abort_from_any_live_state() {
        for state in [
            Disconnected,
            Connecting,
            Connected,
            Handshaking,
            Ready,
            Actuating,
            Disconnecting,
        ] {
            assert!(state.can_transition_to(Aborted), "{} -> aborted", state);
        }
        assert!(!Aborted.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Connecting));
    }
}
