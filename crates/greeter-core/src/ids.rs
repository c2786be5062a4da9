//! Branded identifiers.
//!
//! Every id is a string newtype so visitor ids cannot be passed where agent
//! ids are expected. Server-minted ids carry a short prefix and a UUIDv7,
//! which keeps them sortable by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an externally supplied id verbatim.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// A website visitor, stable across page loads when the widget resends it.
    VisitorId,
    "visitor"
);
branded_id!(
    /// A human agent. Normally issued by the auth backend, not minted here.
    AgentId,
    "agent"
);
branded_id!(
    /// One WebSocket connection.
    ConnectionId,
    "conn"
);
branded_id!(
    /// One call attempt (ring cycle).
    RequestId,
    "req"
);
branded_id!(
    /// One connected call.
    CallId,
    "call"
);
branded_id!(
    /// A routing pool.
    PoolId,
    "pool"
);
branded_id!(
    /// A customer organization.
    OrgId,
    "org"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_have_prefix() {
        assert!(VisitorId::new().as_str().starts_with("visitor_"));
        assert!(ConnectionId::new().as_str().starts_with("conn_"));
        assert!(RequestId::new().as_str().starts_with("req_"));
        assert!(CallId::new().as_str().starts_with("call_"));
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let ids: Vec<RequestId> = (0..50).map(|_| RequestId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = AgentId::from_raw("user-42");
        assert_eq!(id.as_str(), "user-42");
        assert_eq!(id.to_string(), "user-42");
    }

    #[test]
    fn serializes_transparently() {
        let id = OrgId::from_raw("org-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"org-1\"");
        let back: OrgId = serde_json::from_str("\"org-1\"").unwrap();
        assert_eq!(back, id);
    }
}
