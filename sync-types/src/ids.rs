//! Identity types for chatsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TypesError;

/// Identifier of a channel, written `"<type>:<id>"` on the wire.
///
/// The type segment selects the server-side channel configuration
/// (`messaging`, `livestream`, ...), the id segment is unique within it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    kind: String,
    id: String,
}

impl ChannelId {
    /// Create a ChannelId from its two segments.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Result<Self, TypesError> {
        let kind = kind.into();
        let id = id.into();
        if kind.is_empty() || id.is_empty() || kind.contains(':') {
            return Err(TypesError::InvalidChannelId(format!("{kind}:{id}")));
        }
        Ok(Self { kind, id })
    }

    /// The channel type segment.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The channel id segment.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for ChannelId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) => Self::new(kind, id),
            None => Err(TypesError::InvalidChannelId(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChannelId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(cid: ChannelId) -> Self {
        cid.to_string()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
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
    /// Identifier of a message.
    MessageId
);

string_id!(
    /// Identifier of a user.
    UserId
);

string_id!(
    /// Server-assigned identifier of a realtime connection.
    ///
    /// Required before any request that must be attributed to the live
    /// connection (watching channels, presence queries).
    SessionId
);

impl MessageId {
    /// Generate a fresh client-side message id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
