//! The private-feed service facade.
//!
//! [`PrivateFeed`] wires the document store, the device cache, and the
//! follow graph together and exposes the operations the UI layer calls.
//! Every operation takes an explicit [`Session`] — there is no ambient
//! "current user" anywhere in the crate.
//!
//! One `PrivateFeed` instance is one device. Devices of the same identity
//! share a store (the sole serialization point) but never a cache.

use std::collections::HashSet;
use std::sync::Mutex;

use zeroize::Zeroize;

use crate::crypto::keywrap;
use crate::crypto::path_key::{initial_path_key, RootSecret};
use crate::error::{FeedError, Result};
use crate::ids::{DocumentId, Epoch, UserId};
use crate::limits::follower_capacity_remaining;
use crate::store::DocumentStore;

pub mod epoch;
pub mod grants;
pub mod posts;
pub mod reset;
pub mod sync;

pub use grants::RevokeReason;
pub use posts::{ComposeOptions, ContentView, PostRef, PostView, Visibility};
pub use reset::RESET_CONFIRMATION_PHRASE;
pub use sync::{CachedKeyState, DeviceCache, MemoryCache, SyncPhase, SyncStatus};

use posts::CekCache;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The caller's identity context, passed explicitly into every operation.
///
/// Holds the user's X25519 encryption secret — grants are sealed to its
/// public half, so the host app shares it across the user's devices the
/// same way it shares the root secret — and, on owner devices after
/// out-of-band entry, the feed's root secret.
pub struct Session {
    user: UserId,
    device_public: [u8; 32],
    device_secret: [u8; 32],
    root_secret: Option<RootSecret>,
}

impl Session {
    pub fn new(user: UserId, device_secret: [u8; 32]) -> Self {
        let device_public = keywrap::derive_public_key(&device_secret);
        Session {
            user,
            device_public,
            device_secret,
            root_secret: None,
        }
    }

    /// Attach the feed's root secret (owner devices, after the user
    /// entered it out of band).
    pub fn with_root_secret(mut self, root: RootSecret) -> Self {
        self.root_secret = Some(root);
        self
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn device_public(&self) -> &[u8; 32] {
        &self.device_public
    }

    pub(crate) fn device_secret(&self) -> &[u8; 32] {
        &self.device_secret
    }

    pub(crate) fn root_secret(&self) -> Option<&RootSecret> {
        self.root_secret.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.device_secret.zeroize();
    }
}

// ---------------------------------------------------------------------------
// Follow graph contract
// ---------------------------------------------------------------------------

/// The host application's plain follow relation. Requesting private-feed
/// access requires an existing follow; everything else about the social
/// graph stays outside this crate.
pub trait FollowGraph: Send + Sync {
    fn is_following(&self, follower: &UserId, owner: &UserId) -> bool;
}

impl<T: FollowGraph + ?Sized> FollowGraph for std::sync::Arc<T> {
    fn is_following(&self, follower: &UserId, owner: &UserId) -> bool {
        (**self).is_following(follower, owner)
    }
}

/// In-memory follow graph for tests.
#[derive(Default)]
pub struct MemoryFollowGraph {
    edges: Mutex<HashSet<(UserId, UserId)>>,
}

impl MemoryFollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_follow(&self, follower: &UserId, owner: &UserId) {
        self.edges
            .lock()
            .unwrap()
            .insert((follower.clone(), owner.clone()));
    }
}

impl FollowGraph for MemoryFollowGraph {
    fn is_following(&self, follower: &UserId, owner: &UserId) -> bool {
        self.edges
            .lock()
            .unwrap()
            .contains(&(follower.clone(), owner.clone()))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Owner-facing feed status for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatus {
    pub enabled: bool,
    /// 0 while disabled.
    pub epoch: Epoch,
    pub follower_count: u32,
    pub pending_count: u32,
    /// Remaining follower slots.
    pub capacity_remaining: u32,
}

// ---------------------------------------------------------------------------
// PrivateFeed
// ---------------------------------------------------------------------------

/// One device's view of the private-feed protocol.
pub struct PrivateFeed<S, C, G> {
    store: S,
    cache: C,
    graph: G,
    cek_cache: CekCache,
}

impl<S, C, G> PrivateFeed<S, C, G>
where
    S: DocumentStore,
    C: DeviceCache,
    G: FollowGraph,
{
    pub fn new(store: S, cache: C, graph: G) -> Self {
        PrivateFeed {
            store,
            cache,
            graph,
            cek_cache: CekCache::new(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────

    /// Enable the caller's private feed at epoch 1. The session must carry
    /// the root secret the feed is to be keyed from.
    pub async fn enable(&self, session: &Session) -> Result<()> {
        let seed = session
            .root_secret()
            .ok_or_else(|| FeedError::Validation("root secret required to enable".into()))?;
        epoch::enable_feed(&self.store, session.user(), seed).await?;
        self.cache.save(
            session.user(),
            &CachedKeyState {
                generation: seed.generation(),
                epoch: crate::ids::FIRST_EPOCH,
                path_key: *initial_path_key(seed).as_bytes(),
                root_secret_entered: true,
            },
        );
        Ok(())
    }

    pub async fn status(&self, owner: &UserId) -> Result<FeedStatus> {
        let chain = match sync::load_chain(&self.store, owner).await? {
            Some(c) => c,
            None => {
                return Ok(FeedStatus {
                    enabled: false,
                    epoch: 0,
                    follower_count: 0,
                    pending_count: 0,
                    capacity_remaining: 0,
                })
            }
        };
        let pending = grants::pending_requests(&self.store, owner).await?;
        Ok(FeedStatus {
            enabled: true,
            epoch: chain.current,
            follower_count: chain.state.follower_count,
            pending_count: pending.len() as u32,
            capacity_remaining: follower_capacity_remaining(chain.state.follower_count as usize)
                as u32,
        })
    }

    /// Authoritative current epoch, straight from the store.
    pub async fn current_epoch(&self, owner: &UserId) -> Result<Epoch> {
        epoch::current_epoch(&self.store, owner).await
    }

    /// Destructive full re-keying; see [`RESET_CONFIRMATION_PHRASE`].
    pub async fn reset(
        &self,
        session: &Session,
        new_root: &RootSecret,
        confirmation_phrase: &str,
    ) -> Result<()> {
        reset::reset(&self.store, &self.cache, session, new_root, confirmation_phrase).await
    }

    // ── Grants ──────────────────────────────────────────

    pub async fn request_access(&self, session: &Session, owner: &UserId) -> Result<DocumentId> {
        grants::request_access(&self.store, &self.graph, session, owner).await
    }

    pub async fn approve(&self, session: &Session, follower: &UserId) -> Result<()> {
        grants::approve(&self.store, &self.cache, session, follower).await
    }

    pub async fn ignore(&self, session: &Session, follower: &UserId) -> Result<()> {
        grants::ignore(&self.store, session, follower).await
    }

    pub async fn revoke(
        &self,
        session: &Session,
        follower: &UserId,
        reason: RevokeReason,
    ) -> Result<()> {
        grants::revoke(&self.store, &self.cache, session, follower, reason).await
    }

    /// Hook for the host's block action: the owner blocking `blocked`
    /// revokes an active grant, and is a no-op otherwise. Returns whether
    /// a revocation happened. Being blocked BY a follower must not be
    /// routed here — that direction never changes the owner's grants.
    pub async fn auto_revoke_on_block(&self, session: &Session, blocked: &UserId) -> Result<bool> {
        grants::auto_revoke_on_block(&self.store, &self.cache, session, blocked).await
    }

    // ── Content ─────────────────────────────────────────

    pub async fn compose_post(
        &self,
        session: &Session,
        body: &str,
        visibility: Visibility,
        opts: ComposeOptions,
    ) -> Result<PostRef> {
        posts::compose(
            &self.store,
            &self.cache,
            &self.cek_cache,
            session,
            body,
            visibility,
            opts,
        )
        .await
    }

    pub async fn decrypt_post(&self, session: &Session, post_id: &DocumentId) -> Result<PostView> {
        posts::decrypt(&self.store, &self.cache, &self.cek_cache, session, post_id).await
    }

    // ── Sync ────────────────────────────────────────────

    /// Non-blocking read-path sync of this device's cache for one feed.
    pub async fn refresh(&self, session: &Session, feed_owner: &UserId) -> SyncStatus {
        sync::refresh(&self.store, &self.cache, session, feed_owner).await
    }

    /// Bootstrap a new owner device from the out-of-band root secret.
    pub async fn bootstrap_device(&self, session: &Session) -> Result<Epoch> {
        let synced =
            sync::bootstrap_owner_device(&self.store, &self.cache, session, session.user()).await?;
        Ok(synced.key.epoch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
