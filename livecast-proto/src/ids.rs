//! Identifier newtypes shared by the server and the client driver

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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
                f.write_str(&self.0)
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
    /// Stream alias a room is keyed by. Supplied by clients, never minted server-side.
    RoomId
);

string_id!(
    /// Per-connection peer identifier, a UUID minted by the client driver.
    PeerId
);

string_id!(
    /// Media engine transport identifier
    TransportId
);

string_id!(
    /// Media engine producer identifier
    ProducerId
);

string_id!(
    /// Media engine consumer identifier
    ConsumerId
);

impl PeerId {
    /// Mint a fresh random peer id
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = RoomId::from("stream-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"stream-42\"");

        let back: RoomId = serde_json::from_str("\"stream-42\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_peer_ids_differ() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }
}
