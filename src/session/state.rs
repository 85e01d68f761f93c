use std::fmt;

use serde::{Serialize, Serializer};

/// Activity state of a voice session. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Connecting,
    Listening,
    Processing,
    Speaking,
    Closed,
    Errored(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored(_))
    }

    /// The channel is open and audio may flow.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Listening | SessionState::Processing | SessionState::Speaking
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::Closed => "closed",
            SessionState::Errored(_) => "errored",
        }
    }

    /// Whether `next` may follow `self`.
    ///
    /// Terminal states accept nothing. Any live state may close or fail, and
    /// staying put is always allowed.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Closed | Errored(_)) => true,
            (Connecting, Listening) => true,
            (Listening, Processing | Speaking) => true,
            (Processing, Listening | Speaking) => true,
            (Speaking, Listening | Processing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Errored(reason) => write!(f, "errored: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn starts_connecting() {
        assert_eq!(SessionState::default(), Connecting);
        assert!(!Connecting.is_open());
    }

    #[test]
    fn terminal_states_are_sinks() {
        for terminal in [Closed, Errored("network".into())] {
            assert!(terminal.is_terminal());
            for next in [Connecting, Listening, Processing, Speaking, Closed] {
                assert!(!terminal.can_transition_to(&next));
            }
        }
    }

    #[test]
    fn conversation_cycle_is_legal() {
        assert!(Connecting.can_transition_to(&Listening));
        assert!(Listening.can_transition_to(&Processing));
        assert!(Processing.can_transition_to(&Listening));
        assert!(Processing.can_transition_to(&Speaking));
        assert!(Speaking.can_transition_to(&Listening));
        assert!(!Connecting.can_transition_to(&Speaking));
        assert!(!Listening.can_transition_to(&Connecting));
    }

    #[test]
    fn any_live_state_can_fail() {
        for state in [Connecting, Listening, Processing, Speaking] {
            assert!(state.can_transition_to(&Closed));
            assert!(state.can_transition_to(&Errored("x".into())));
        }
    }

    #[test]
    fn serializes_as_label() {
        assert_eq!(serde_json::to_string(&Speaking).unwrap(), "\"speaking\"");
        assert_eq!(
            serde_json::to_string(&Errored("mic".into())).unwrap(),
            "\"errored\""
        );
        assert_eq!(Errored("mic".into()).to_string(), "errored: mic");
    }
}
