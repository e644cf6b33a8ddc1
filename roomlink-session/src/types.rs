//! Identifier types shared across the session crate

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a 12-character nanoid for locally created objects
#[must_use]
pub fn generate_id() -> String {
    nanoid::nanoid!(12)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Meeting (room) identifier chosen by the user
    MeetingId
);

string_id!(
    /// Application-level user identifier
    UserId
);

string_id!(
    /// Signaling-level identifier of a remote participant connection
    PeerId
);

string_id!(
    /// SFU transport identifier
    TransportId
);

string_id!(
    /// SFU producer identifier
    ProducerId
);

string_id!(
    /// SFU consumer identifier
    ConsumerId
);

string_id!(
    /// Identity of a [`MediaStream`](crate::media::MediaStream)
    StreamId
);

impl StreamId {
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }
}

/// The local participant as announced to the meeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub user_id: UserId,
    pub user_name: String,
}

impl LocalUser {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let peer = PeerId::from("peer-1");
        assert_eq!(serde_json::to_string(&peer).unwrap(), "\"peer-1\"");

        let parsed: ProducerId = serde_json::from_str("\"prod-9\"").unwrap();
        assert_eq!(parsed.as_str(), "prod-9");
    }

    #[test]
    fn test_generated_stream_ids_are_unique() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }
}
