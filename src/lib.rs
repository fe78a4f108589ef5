//! # Veilfeed Protocol SDK
//!
//! **Client-side access control and key rotation for private social feeds.**
//!
//! Veilfeed lets a content owner keep an encrypted feed readable only by a
//! dynamic, revocable set of approved followers. Revocation rekeys the
//! feed through a single broadcast document — no per-follower messaging —
//! and achieves forward secrecy: a revoked follower can never derive any
//! key from the revocation epoch onward, no matter what they cached.
//!
//! The crate is a standalone protocol library. The host application
//! supplies three contracts:
//!
//! - [`store::DocumentStore`] — the external append-only document
//!   database (async; the sole serialization point between devices)
//! - [`feed::DeviceCache`] — local per-device key-state persistence
//! - [`feed::FollowGraph`] — the plain follow relation
//!
//! ## Quick start
//!
//! ```no_run
//! use veilfeed_protocol::crypto::RootSecret;
//! use veilfeed_protocol::feed::{MemoryCache, MemoryFollowGraph, PrivateFeed, Session, Visibility};
//! use veilfeed_protocol::ids::UserId;
//! use veilfeed_protocol::store::MemoryStore;
//!
//! # async fn demo() -> veilfeed_protocol::error::Result<()> {
//! let feed = PrivateFeed::new(MemoryStore::new(), MemoryCache::new(), MemoryFollowGraph::new());
//!
//! let root = RootSecret::generate();
//! let owner = Session::new(UserId::new("alice"), [7u8; 32]).with_root_secret(root);
//!
//! feed.enable(&owner).await?;
//! feed.compose_post(&owner, "followers only", Visibility::Private, Default::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Content AEAD, X25519 grant sealing, forward path-key derivation |
//! | [`store`] | Document-store contract, document schema, in-memory reference store |
//! | [`feed`] | Epoch state machine, grants, content encryption, sync, reset |
//! | [`ids`] | User / document / epoch identity types |
//! | [`limits`] | Follower and rekey-epoch capacity guardrails |
//! | [`error`] | The protocol error taxonomy |

// ── Public modules ──────────────────────────────────────────────────────────

/// Cryptographic primitives: AEAD, sealed boxes, path-key derivation.
pub mod crypto;

/// Protocol error taxonomy.
pub mod error;

/// The private-feed service: epoch manager, grants, posts, sync, reset.
pub mod feed;

/// Identity and handle types.
pub mod ids;

/// Capacity guardrails.
pub mod limits;

/// Document-store contract and schema.
pub mod store;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use crypto::{PathKey, RootSecret};
pub use error::{ErrorKind, FeedError};
pub use feed::{
    ComposeOptions, ContentView, FeedStatus, FollowGraph, PostRef, PostView, PrivateFeed,
    RevokeReason, Session, Visibility, RESET_CONFIRMATION_PHRASE,
};
pub use ids::{DocumentId, Epoch, UserId};
pub use store::{DocumentStore, MemoryStore};

// ── Library metadata ────────────────────────────────────────────────────────

/// Veilfeed Protocol SDK version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the SDK version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
