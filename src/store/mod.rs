//! Document-store contract and the private-feed document schema.
//!
//! The authoritative state lives in an external append-only, eventually
//! consistent document database reachable only asynchronously. This module
//! defines the consumed interface exactly as the host application provides
//! it — generic keyed documents with create/read/delete — plus typed
//! wrappers for the five document types this protocol stores.
//!
//! The store is the sole serialization point between an identity's
//! devices: reads return documents in creation order, which is what the
//! epoch-advance conflict resolution keys off.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::FeedError;
use crate::ids::{DocumentId, Epoch, UserId};

mod memory;
pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Network(String),

    #[error("document not found")]
    NotFound,

    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<StoreError> for FeedError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Network(msg) => FeedError::Network(msg),
            StoreError::NotFound => FeedError::NotFound,
            StoreError::Malformed(msg) => FeedError::Validation(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Generic documents
// ---------------------------------------------------------------------------

/// The five document types the protocol persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocType {
    FeedState,
    Grant,
    Rekey,
    FollowRequest,
    Post,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::FeedState => "private_feed_state",
            DocType::Grant => "private_feed_grant",
            DocType::Rekey => "private_feed_rekey",
            DocType::FollowRequest => "follow_request",
            DocType::Post => "post",
        }
    }
}

/// Flat JSON field map — the store's native record shape.
pub type Fields = serde_json::Map<String, Value>;

/// A stored document as returned by reads.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub doc_type: DocType,
    pub fields: Fields,
}

/// Equality filter over document fields. An empty filter matches every
/// document of the requested type. The reserved key `_id` matches the
/// document id instead of a field.
#[derive(Debug, Clone, Default)]
pub struct Filter(Vec<(String, Value)>);

impl Filter {
    pub fn new() -> Self {
        Filter(Vec::new())
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.push((field.to_string(), value.into()));
        self
    }

    /// Match a single document by id.
    pub fn id(self, id: &DocumentId) -> Self {
        self.eq("_id", id.as_str())
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.0
            .iter()
            .all(|(k, v)| fields.get(k).map_or(false, |fv| fv == v))
    }

    pub fn matches_doc(&self, doc: &Document) -> bool {
        self.0.iter().all(|(k, v)| {
            if k == "_id" {
                v.as_str() == Some(doc.id.as_str())
            } else {
                doc.fields.get(k).map_or(false, |fv| fv == v)
            }
        })
    }
}

/// The consumed document-store interface. Every call may suspend; failures
/// are `Network` (retryable) or `NotFound`.
///
/// Implementations must return documents from `read_documents` in creation
/// order — the protocol's only ordering assumption.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, doc_type: DocType, fields: Fields) -> Result<DocumentId>;

    async fn read_documents(&self, doc_type: DocType, filter: &Filter) -> Result<Vec<Document>>;

    async fn delete_document(&self, id: &DocumentId) -> Result<()>;
}

// Devices of one identity share a store client behind an Arc.
#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<T> {
    async fn create_document(&self, doc_type: DocType, fields: Fields) -> Result<DocumentId> {
        (**self).create_document(doc_type, fields).await
    }

    async fn read_documents(&self, doc_type: DocType, filter: &Filter) -> Result<Vec<Document>> {
        (**self).read_documents(doc_type, filter).await
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<()> {
        (**self).delete_document(id).await
    }
}

// ---------------------------------------------------------------------------
// Typed documents
// ---------------------------------------------------------------------------

/// Per-owner feed state. Replaced wholesale (delete + create) on every
/// owner mutation; a reset replaces it under a fresh generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStateDoc {
    pub owner: UserId,
    pub epoch: Epoch,
    /// One-way fingerprint of the root seed; changes only on reset.
    pub generation: String,
    pub follower_count: u32,
    pub revocation_count: u32,
    /// Permanently revoked followers — re-requesting is refused forever.
    pub revoked: Vec<UserId>,
    pub enabled: bool,
}

/// Per owner × follower grant. The sealed box holds the grant payload
/// (path key at the grant epoch, member secret, epoch, generation),
/// openable only by the follower's device key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantDoc {
    pub owner: UserId,
    pub follower: UserId,
    pub epoch: Epoch,
    pub generation: String,
    /// Base64 X25519 sealed box.
    pub sealed: String,
}

/// Broadcast rekey document for one epoch transition. Append-only within
/// a generation; `epoch` is the NEW epoch this document derives (≥ 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyDoc {
    pub owner: UserId,
    pub epoch: Epoch,
    pub generation: String,
    /// Delta sealed to the owner's seed-derived wrap key (base64).
    pub owner_box: String,
    /// Delta sealed per still-approved follower (base64), keyed by user id.
    /// A revoked follower has no entry — that absence IS the revocation.
    pub boxes: BTreeMap<String, String>,
}

/// Pending access request. `ignored` removes it from the owner's pending
/// view without invalidating it; approval stays possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRequestDoc {
    pub owner: UserId,
    pub follower: UserId,
    /// Follower's X25519 public key (base64), used to seal the grant.
    pub follower_public_key: String,
    pub ignored: bool,
}

/// Post visibility tag as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityTag {
    Public,
    Private,
    PrivateWithTeaser,
}

/// A post record. Public posts carry `body` in plaintext; private posts
/// carry base64 AEAD ciphertext tagged with the `(key_owner, key_epoch)`
/// that encrypts it. Replies that inherit their parent's encryption are
/// tagged with the PARENT's context and `inherits_parent = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDoc {
    pub author: UserId,
    pub visibility: VisibilityTag,
    pub teaser: Option<String>,
    pub body: String,
    pub key_owner: Option<UserId>,
    pub key_epoch: Option<Epoch>,
    /// Generation the CEK belongs to. Epoch numbers restart at 1 on reset,
    /// so the tag disambiguates pre-reset content (permanently unreadable)
    /// from same-numbered post-reset epochs.
    pub key_generation: Option<String>,
    pub inherits_parent: bool,
    pub parent_id: Option<DocumentId>,
    pub quoted_post_id: Option<DocumentId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Field (de)serialization
// ---------------------------------------------------------------------------

/// Serialize a typed document into the store's flat field map.
pub fn encode_fields<T: Serialize>(doc: &T) -> Fields {
    match serde_json::to_value(doc) {
        Ok(Value::Object(map)) => map,
        _ => Fields::new(), // typed docs above always serialize to objects
    }
}

/// Decode a stored document back into its typed form.
pub fn decode_fields<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(Value::Object(doc.fields.clone()))
        .map_err(|e| StoreError::Malformed(format!("{} ({})", e, doc.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let mut fields = Fields::new();
        fields.insert("owner".into(), Value::String("alice".into()));
        fields.insert("epoch".into(), Value::from(3u32));

        assert!(Filter::new().matches(&fields));
        assert!(Filter::new().eq("owner", "alice").matches(&fields));
        assert!(Filter::new().eq("owner", "alice").eq("epoch", 3).matches(&fields));
        assert!(!Filter::new().eq("owner", "bob").matches(&fields));
        assert!(!Filter::new().eq("missing", 1).matches(&fields));
    }

    #[test]
    fn test_typed_doc_field_roundtrip() {
        let state = FeedStateDoc {
            owner: UserId::new("alice"),
            epoch: 4,
            generation: "00aa11bb22cc33dd".into(),
            follower_count: 2,
            revocation_count: 3,
            revoked: vec![UserId::new("mallory")],
            enabled: true,
        };

        let doc = Document {
            id: DocumentId::new("d1"),
            doc_type: DocType::FeedState,
            fields: encode_fields(&state),
        };

        let back: FeedStateDoc = decode_fields(&doc).unwrap();
        assert_eq!(back.owner, state.owner);
        assert_eq!(back.epoch, 4);
        assert_eq!(back.revoked, state.revoked);
        assert!(back.enabled);
    }

    #[test]
    fn test_malformed_document_is_reported() {
        let doc = Document {
            id: DocumentId::new("d2"),
            doc_type: DocType::FeedState,
            fields: Fields::new(),
        };
        let err = decode_fields::<FeedStateDoc>(&doc).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_visibility_tag_encoding() {
        let json = serde_json::to_string(&VisibilityTag::PrivateWithTeaser).unwrap();
        assert_eq!(json, "\"private_with_teaser\"");
    }
}
