//! Non-blocking status channel for the application layer

use crate::media::MediaKind;
use crate::session::{ConnectionState, SessionPhase};
use crate::types::{PeerId, UserId};
use serde::Serialize;
use std::fmt;

/// Whether the session survives the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Local to one operation or one peer; the session keeps running
    Recoverable,
    /// The session has been torn down
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable => f.write_str("recoverable"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: ConnectionState,
        phase: SessionPhase,
    },
    PeerJoined {
        peer_id: PeerId,
        user_id: UserId,
        user_name: String,
    },
    PeerTrackAdded {
        peer_id: PeerId,
        kind: MediaKind,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    DevicesChanged,
    Error {
        severity: Severity,
        message: String,
    },
}

impl SessionEvent {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Error {
            severity: Severity::Recoverable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Error {
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Error {
                severity: Severity::Fatal,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::PeerTrackAdded {
            peer_id: PeerId::from("b"),
            kind: MediaKind::Audio,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "peer_track_added");
        assert_eq!(json["kind"], "audio");

        let fatal = SessionEvent::fatal("join rejected");
        assert!(fatal.is_fatal());
        assert!(!SessionEvent::recoverable("camera busy").is_fatal());
    }
}
