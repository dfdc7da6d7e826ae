//! Peer addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable identifier of a remote peer.
///
/// Used for routing and as the key of every per-peer registry (stream cache,
/// dial breakers, inbound bulkheads). No structure is imposed on the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Wrap a peer id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PeerAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversions() {
        let peer = PeerAddress::from("12D3KooWPeer");
        assert_eq!(peer.to_string(), "12D3KooWPeer");
        assert_eq!(peer.as_str(), "12D3KooWPeer");
        assert_eq!(peer, PeerAddress::new(String::from("12D3KooWPeer")));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let peer = PeerAddress::new("peer-a");
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"peer-a\"");
        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}
