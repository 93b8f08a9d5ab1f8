use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of one call attempt; also the routing key on the relay.
    CallId
);
string_id!(
    /// A physical device: the initiating device or a target display.
    DeviceId
);
string_id!(
    /// One local execution context (browser tab, window) on the initiating device.
    ContextId
);
string_id!(
    /// Identity of a relay participant connection, stable across reconnects.
    ParticipantId
);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ParticipantId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn generated_call_ids_are_unique_uuids() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test_timeout::timeout]
    fn ids_serialize_as_plain_strings() {
        let id = DeviceId::from("living-room-tv");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"living-room-tv\""
        );
    }
}
