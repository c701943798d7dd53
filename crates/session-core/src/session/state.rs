use std::fmt;

use serde::{Deserialize, Serialize};

use super::SessionKind;

/// Lifecycle of a session.
///
/// ```text
/// Requesting -> Negotiating -> Active -> Draining -> Closed
///                                 |
///                  Paused / Seeking / FastForward / FastRewind (replay only)
/// ```
///
/// `Error` is terminal and reachable from every state except `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Start request sent, waiting for the device
    Requesting,
    /// Device accepted; waiting for media or the final acknowledgment
    Negotiating,
    Active,
    Paused,
    Seeking,
    FastForward,
    FastRewind,
    /// Stop sent, waiting for its acknowledgment
    Draining,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    pub fn is_replay_substate(self) -> bool {
        matches!(
            self,
            SessionState::Paused
                | SessionState::Seeking
                | SessionState::FastForward
                | SessionState::FastRewind
        )
    }

    /// Active or in a replay sub-state; media flows in both
    pub fn is_streaming(self) -> bool {
        self == SessionState::Active || self.is_replay_substate()
    }

    /// Whether `self -> next` is a legal transition for a session of `kind`
    pub fn can_transition_to(self, next: SessionState, kind: SessionKind) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Error {
            return true;
        }
        match (self, next) {
            (Requesting, Negotiating) | (Requesting, Draining) => true,
            (Negotiating, Active) | (Negotiating, Draining) => true,
            (Negotiating, Requesting) | (Active, Requesting) => kind == SessionKind::Download,
            (Active, Draining) => true,
            (Active, Negotiating) => kind == SessionKind::Watch,
            (Active, sub) if sub.is_replay_substate() => kind == SessionKind::Replay,
            (sub, Active) | (sub, Draining) if sub.is_replay_substate() => true,
            (Draining, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Requesting => "requesting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Seeking => "seeking",
            SessionState::FastForward => "fast-forward",
            SessionState::FastRewind => "fast-rewind",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}
