/// Core identity types for the private-feed protocol.
///
/// - `UserId`: stable account handle, the key for owners and followers
/// - `DocumentId`: opaque identifier assigned by the document store
/// - `Epoch`: per-owner key-generation counter (starts at 1)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-owner key-generation counter. Strictly increasing, gapless,
/// restarts at 1 only on a feed reset.
pub type Epoch = u32;

/// The first epoch of any enabled (or freshly reset) feed.
pub const FIRST_EPOCH: Epoch = 1;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Stable account identity — an opaque handle assigned by the host
/// application's identity layer (authentication is out of scope here).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(handle: impl Into<String>) -> Self {
        UserId(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DocumentId
// ---------------------------------------------------------------------------

/// Opaque identifier assigned by the document store on creation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = if self.0.len() > 8 { &self.0[..8] } else { &self.0 };
        write!(f, "DocumentId({}..)", short)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_roundtrip() {
        let id = UserId::new("alice");
        assert_eq!(id.as_str(), "alice");
        assert_eq!(id, UserId::from("alice"));
        assert_ne!(id, UserId::from("bob"));
    }

    #[test]
    fn test_user_id_serde_transparent() {
        let id = UserId::new("carol");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_document_id_ordering_is_stable() {
        let a = DocumentId::new("00001");
        let b = DocumentId::new("00002");
        assert!(a < b);
    }
}
