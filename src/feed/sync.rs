/// Multi-device sync coordinator.
///
/// A device's cached `(epoch, path key)` is only ever a hint. Before any
/// write whose correctness depends on currency the caller runs
/// [`ensure_current`], which reconciles the cache against the
/// authoritative chain; read paths use [`refresh`], which runs the same
/// machine but never blocks the caller on failure.
///
/// Catch-up is an explicit state machine:
///
/// ```text
/// Idle → FetchingEpoch → FetchingRekeys → Deriving → Persisting → Current
///                                  └──────────┴──────→ Failed{retryable}
/// ```
///
/// The cache is persisted only after the derivation verifiably reached
/// the authoritative epoch; a cancelled catch-up leaves the previous
/// cache intact.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroize;

use crate::crypto::path_key::{
    self, derive_forward, initial_path_key, PathKey, RekeyAccess, RekeyStep,
};
use crate::error::{FeedError, Result};
use crate::feed::grants::GrantPayload;
use crate::feed::Session;
use crate::ids::{DocumentId, Epoch, UserId, FIRST_EPOCH};
use crate::store::{
    decode_fields, DocType, DocumentStore, FeedStateDoc, Filter, GrantDoc, RekeyDoc, StoreError,
};

/// Store read attempts before a network failure surfaces to the caller.
const MAX_STORE_ATTEMPTS: u32 = 3;
/// Initial backoff between attempts; doubles per retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Device cache contract
// ---------------------------------------------------------------------------

/// Locally cached key state for one feed, per device. Non-authoritative.
#[derive(Clone)]
pub struct CachedKeyState {
    /// Generation fingerprint the cache belongs to. A mismatch against the
    /// authoritative state means the feed was reset since this device last
    /// synced — the cache is then invalid and bootstrap is required.
    pub generation: String,
    pub epoch: Epoch,
    pub path_key: [u8; 32],
    /// Whether the out-of-band root secret has been entered on this device
    /// (owner devices only).
    pub root_secret_entered: bool,
}

impl Drop for CachedKeyState {
    fn drop(&mut self) {
        self.path_key.zeroize();
    }
}

/// Contract for per-device key-state persistence, implemented by the host
/// application (keystore-backed on mobile, IndexedDB on web). One record
/// per feed owner namespace.
///
/// Implementations must persist `save` atomically: a torn write would turn
/// the cache from a stale hint into a wrong one.
pub trait DeviceCache: Send + Sync {
    fn load(&self, feed_owner: &UserId) -> Option<CachedKeyState>;

    fn save(&self, feed_owner: &UserId, state: &CachedKeyState);

    fn clear(&self, feed_owner: &UserId);
}

impl<T: DeviceCache + ?Sized> DeviceCache for std::sync::Arc<T> {
    fn load(&self, feed_owner: &UserId) -> Option<CachedKeyState> {
        (**self).load(feed_owner)
    }

    fn save(&self, feed_owner: &UserId, state: &CachedKeyState) {
        (**self).save(feed_owner, state)
    }

    fn clear(&self, feed_owner: &UserId) {
        (**self).clear(feed_owner)
    }
}

/// In-memory reference implementation for tests.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<HashMap<UserId, CachedKeyState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceCache for MemoryCache {
    fn load(&self, feed_owner: &UserId) -> Option<CachedKeyState> {
        self.inner.lock().unwrap().get(feed_owner).cloned()
    }

    fn save(&self, feed_owner: &UserId, state: &CachedKeyState) {
        self.inner
            .lock()
            .unwrap()
            .insert(feed_owner.clone(), state.clone());
    }

    fn clear(&self, feed_owner: &UserId) {
        self.inner.lock().unwrap().remove(feed_owner);
    }
}

// ---------------------------------------------------------------------------
// Sync state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    FetchingEpoch,
    FetchingRekeys,
    Deriving,
    Persisting,
    Current,
    Failed,
}

/// Outcome of a non-blocking [`refresh`].
#[derive(Debug)]
pub enum SyncStatus {
    Current { epoch: Epoch },
    Failed { phase: SyncPhase, retryable: bool },
}

/// In-memory key state for one feed after a successful sync.
pub struct KeyState {
    pub generation: String,
    pub epoch: Epoch,
    pub path_key: PathKey,
}

/// A successful sync: the current key state plus the chain snapshot it was
/// verified against, so callers mutate the same view they synced to.
pub(crate) struct Synced {
    pub key: KeyState,
    pub chain: FeedChain,
}

struct Progress {
    phase: SyncPhase,
}

impl Progress {
    fn new() -> Self {
        Progress { phase: SyncPhase::Idle }
    }

    fn advance(&mut self, feed_owner: &UserId, next: SyncPhase) {
        log::debug!("sync[{}]: {:?} -> {:?}", feed_owner, self.phase, next);
        self.phase = next;
    }
}

// ---------------------------------------------------------------------------
// Authoritative chain view
// ---------------------------------------------------------------------------

/// One consistent read of the authoritative chain: the state document plus
/// every rekey document of the current generation, in epoch order.
pub(crate) struct FeedChain {
    pub state_id: DocumentId,
    pub state: FeedStateDoc,
    pub rekeys: Vec<RekeyDoc>,
    /// The rekey chain is authoritative; the state document's counter is a
    /// convenience copy that can lag one step behind a crashed advance.
    pub current: Epoch,
}

pub(crate) async fn load_chain<S: DocumentStore>(
    store: &S,
    owner: &UserId,
) -> Result<Option<FeedChain>> {
    let state_filter = Filter::new().eq("owner", owner.as_str());
    let states = with_retry("feed state", || {
        store.read_documents(DocType::FeedState, &state_filter)
    })
    .await?;

    // State replacement creates the successor before deleting the
    // predecessor, so the newest (last-created) document wins.
    let doc = match states.last() {
        Some(d) => d,
        None => return Ok(None),
    };
    let state: FeedStateDoc = decode_fields(doc)?;
    if !state.enabled {
        return Ok(None);
    }

    let rekey_filter = Filter::new()
        .eq("owner", owner.as_str())
        .eq("generation", state.generation.clone());
    let rekey_docs = with_retry("rekey chain", || {
        store.read_documents(DocType::Rekey, &rekey_filter)
    })
    .await?;

    let mut rekeys = Vec::with_capacity(rekey_docs.len());
    for d in &rekey_docs {
        rekeys.push(decode_fields::<RekeyDoc>(d)?);
    }
    rekeys.sort_by_key(|r| r.epoch);
    rekeys.dedup_by_key(|r| r.epoch); // store order already resolved races

    let current = rekeys.last().map_or(state.epoch, |r| r.epoch.max(state.epoch));

    Ok(Some(FeedChain {
        state_id: doc.id.clone(),
        state,
        rekeys,
        current,
    }))
}

/// Select the rekey steps covering `(from, to]` for one caller, failing
/// fast on a chain gap or a missing box.
fn steps_for(
    rekeys: &[RekeyDoc],
    from: Epoch,
    to: Epoch,
    member: Option<&UserId>,
) -> Result<Vec<RekeyStep>> {
    let mut steps = Vec::with_capacity((to - from) as usize);
    for epoch in (from + 1)..=to {
        let doc = rekeys
            .iter()
            .find(|r| r.epoch == epoch)
            .ok_or(FeedError::ChainGap { missing: epoch })?;

        let sealed_b64 = match member {
            None => &doc.owner_box,
            Some(user) => doc
                .boxes
                .get(user.as_str())
                .ok_or(FeedError::Foreclosed { epoch })?,
        };
        let sealed_delta = BASE64
            .decode(sealed_b64)
            .map_err(|_| FeedError::Validation(format!("corrupt rekey box at epoch {epoch}")))?;

        steps.push(RekeyStep { epoch, sealed_delta });
    }
    Ok(steps)
}

// ---------------------------------------------------------------------------
// Key resolution
// ---------------------------------------------------------------------------

/// Fetch and open the caller's grant for `owner`'s feed. Absence means the
/// caller was never approved — or was revoked, which deletes the grant.
pub(crate) async fn open_own_grant<S: DocumentStore>(
    store: &S,
    session: &Session,
    owner: &UserId,
) -> Result<Option<GrantPayload>> {
    let grant_filter = Filter::new()
        .eq("owner", owner.as_str())
        .eq("follower", session.user().as_str());
    let docs = with_retry("grant", || store.read_documents(DocType::Grant, &grant_filter)).await?;

    let doc = match docs.last() {
        Some(d) => d,
        None => return Ok(None),
    };
    let grant: GrantDoc = decode_fields(doc)?;
    let boxed = BASE64
        .decode(&grant.sealed)
        .map_err(|_| FeedError::Validation("corrupt grant box".into()))?;
    let plain = crate::crypto::keywrap::open_sealed(session.device_secret(), &boxed)
        .map_err(|_| FeedError::Decryption)?;
    let payload: GrantPayload =
        bincode::deserialize(&plain).map_err(|_| FeedError::Validation("corrupt grant".into()))?;
    Ok(Some(payload))
}

/// Resolve the path key for `owner`'s feed at exactly `epoch`, using the
/// cache when it lands on that epoch, otherwise re-deriving from the
/// caller's base (root seed for the owner, grant for a follower).
pub(crate) async fn path_key_at<S: DocumentStore>(
    store: &S,
    chain: &FeedChain,
    cached: Option<&CachedKeyState>,
    session: &Session,
    owner: &UserId,
    epoch: Epoch,
) -> Result<PathKey> {
    if let Some(c) = cached {
        if c.generation == chain.state.generation && c.epoch == epoch {
            return Ok(PathKey::from_bytes(c.path_key));
        }
    }

    if session.user() == owner {
        let seed = session
            .root_secret()
            .ok_or_else(|| FeedError::Validation("root secret required on this device".into()))?;
        if seed.generation() != chain.state.generation {
            return Err(FeedError::Validation(
                "root secret does not match the current feed generation".into(),
            ));
        }
        let p1 = initial_path_key(seed);
        if epoch == FIRST_EPOCH {
            return Ok(p1);
        }
        let steps = steps_for(&chain.rekeys, FIRST_EPOCH, epoch, None)?;
        return derive_forward(FIRST_EPOCH, &p1, epoch, &steps, &RekeyAccess::Owner(seed))
            .map_err(map_path_key_err);
    }

    // Follower path: the grant is the derivation base.
    let grant = open_own_grant(store, session, owner)
        .await?
        .ok_or(FeedError::Foreclosed { epoch })?;
    if grant.generation != chain.state.generation {
        // Grant predates a reset — orphaned, the follower must re-request.
        return Err(FeedError::Foreclosed { epoch });
    }
    if epoch < grant.epoch {
        // Granted later than the requested epoch; path keys never go back.
        return Err(FeedError::Foreclosed { epoch });
    }
    let base = PathKey::from_bytes(grant.path_key);
    if epoch == grant.epoch {
        return Ok(base);
    }
    let steps = steps_for(&chain.rekeys, grant.epoch, epoch, Some(session.user()))?;
    derive_forward(
        grant.epoch,
        &base,
        epoch,
        &steps,
        &RekeyAccess::Member(&grant.member_secret),
    )
    .map_err(map_path_key_err)
}

fn map_path_key_err(e: path_key::PathKeyError) -> FeedError {
    use path_key::PathKeyError::*;
    match e {
        ChainGap { expected, .. } => FeedError::ChainGap { missing: expected },
        ChainShort { reached, .. } => FeedError::ChainGap { missing: reached + 1 },
        UnwrapFailed { epoch } => FeedError::Foreclosed { epoch },
        BadRange { .. } | PassphraseStretch => FeedError::Decryption,
    }
}

// ---------------------------------------------------------------------------
// ensure_current / refresh
// ---------------------------------------------------------------------------

/// Blocking write-path sync: reconcile this device's cache with the
/// authoritative chain and return the current key state. Every write whose
/// correctness depends on currency (post, approve, revoke) calls this
/// first.
pub(crate) async fn ensure_current<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    feed_owner: &UserId,
) -> Result<Synced> {
    let mut progress = Progress::new();

    progress.advance(feed_owner, SyncPhase::FetchingEpoch);
    let chain = load_chain(store, feed_owner)
        .await?
        .ok_or(FeedError::NotEnabled)?;

    let cached = cache.load(feed_owner);
    if let Some(c) = &cached {
        if c.generation == chain.state.generation && c.epoch > chain.current {
            // The store read is behind a write this identity already made
            // elsewhere; eventually-consistent lag. Never write against it.
            progress.advance(feed_owner, SyncPhase::Failed);
            return Err(FeedError::Conflict);
        }
    }

    progress.advance(feed_owner, SyncPhase::FetchingRekeys);
    // Prefer advancing from the cache instead of the base when it is valid
    // and behind: fewer unwraps, and for followers no grant re-fetch.
    let derived = match &cached {
        Some(c) if c.generation == chain.state.generation && c.epoch < chain.current => {
            let member = (session.user() != feed_owner).then(|| session.user().clone());
            match advance_from_cache(store, &chain, c, session, member.as_ref()).await {
                Ok(key) => Some(key),
                // A cache-based advance can fail where the base can still
                // succeed (e.g. member secret needed); fall through.
                Err(FeedError::Validation(_)) | Err(FeedError::Decryption) => None,
                Err(e) => {
                    progress.advance(feed_owner, SyncPhase::Failed);
                    return Err(e);
                }
            }
        }
        _ => None,
    };

    progress.advance(feed_owner, SyncPhase::Deriving);
    let path_key = match derived {
        Some(key) => key,
        None => {
            path_key_at(store, &chain, cached.as_ref(), session, feed_owner, chain.current)
                .await
                .map_err(|e| {
                    log::debug!("sync[{}]: derivation failed: {}", feed_owner, e);
                    e
                })?
        }
    };

    progress.advance(feed_owner, SyncPhase::Persisting);
    let root_entered = session.root_secret().is_some()
        || cached.as_ref().map_or(false, |c| c.root_secret_entered);
    cache.save(
        feed_owner,
        &CachedKeyState {
            generation: chain.state.generation.clone(),
            epoch: chain.current,
            path_key: *path_key.as_bytes(),
            root_secret_entered: root_entered,
        },
    );

    progress.advance(feed_owner, SyncPhase::Current);
    Ok(Synced {
        key: KeyState {
            generation: chain.state.generation.clone(),
            epoch: chain.current,
            path_key,
        },
        chain,
    })
}

/// Advance from the cached epoch to the chain head. Followers need their
/// member secret for the wrap keys, which lives in the grant.
async fn advance_from_cache<S: DocumentStore>(
    store: &S,
    chain: &FeedChain,
    cached: &CachedKeyState,
    session: &Session,
    member: Option<&UserId>,
) -> Result<PathKey> {
    let base = PathKey::from_bytes(cached.path_key);
    let steps = steps_for(&chain.rekeys, cached.epoch, chain.current, member)?;

    match member {
        None => {
            let seed = session
                .root_secret()
                .ok_or_else(|| FeedError::Validation("root secret required".into()))?;
            derive_forward(cached.epoch, &base, chain.current, &steps, &RekeyAccess::Owner(seed))
                .map_err(map_path_key_err)
        }
        Some(_) => {
            let grant = open_own_grant(store, session, &chain.state.owner)
                .await?
                .ok_or(FeedError::Foreclosed { epoch: chain.current })?;
            if grant.generation != chain.state.generation {
                return Err(FeedError::Foreclosed { epoch: chain.current });
            }
            derive_forward(
                cached.epoch,
                &base,
                chain.current,
                &steps,
                &RekeyAccess::Member(&grant.member_secret),
            )
            .map_err(map_path_key_err)
        }
    }
}

/// Non-blocking read-path sync. Runs the same machine as
/// [`ensure_current`] but converts failure into an inspectable status
/// instead of an error, so rendering never blocks on a slow or
/// unavailable store.
pub(crate) async fn refresh<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    feed_owner: &UserId,
) -> SyncStatus {
    match ensure_current(store, cache, session, feed_owner).await {
        Ok(synced) => SyncStatus::Current { epoch: synced.key.epoch },
        Err(e) => {
            log::info!("background sync for {} failed: {}", feed_owner, e);
            SyncStatus::Failed {
                phase: SyncPhase::Failed,
                retryable: e.is_retryable(),
            }
        }
    }
}

/// Bootstrap a brand-new owner device from the out-of-band root secret,
/// without waiting for a write operation to trigger catch-up.
pub(crate) async fn bootstrap_owner_device<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    owner: &UserId,
) -> Result<Synced> {
    let seed = session
        .root_secret()
        .ok_or_else(|| FeedError::Validation("root secret required to bootstrap".into()))?;
    let chain = load_chain(store, owner).await?.ok_or(FeedError::NotEnabled)?;
    if seed.generation() != chain.state.generation {
        return Err(FeedError::Validation(
            "root secret does not match the current feed generation".into(),
        ));
    }
    // Drop any stale-generation cache, then run the normal machine.
    if let Some(c) = cache.load(owner) {
        if c.generation != chain.state.generation {
            cache.clear(owner);
        }
    }
    ensure_current(store, cache, session, owner).await
}

// ---------------------------------------------------------------------------
// Store retry
// ---------------------------------------------------------------------------

/// Retry transient store failures with exponential backoff before
/// surfacing `Network`. "Slow" is the store client's concern; by the time
/// an attempt returns `Network` it is treated as unavailable.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, StoreError>>,
{
    let mut delay = RETRY_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StoreError::Network(msg)) if attempt < MAX_STORE_ATTEMPTS => {
                log::debug!(
                    "store read '{}' unavailable (attempt {}/{}): {}",
                    what,
                    attempt,
                    MAX_STORE_ATTEMPTS,
                    msg
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
