/// Grant/revocation lifecycle.
///
/// Approval wraps the current path key and a per-follower member secret
/// into a box only the follower's device can open; revocation deletes the
/// grant and advances the epoch as one linked operation, so the new rekey
/// delta is reachable only through still-approved members' secrets.
/// Explicit revocation is permanent: the follower lands on the state
/// document's revoked list and can never re-request — distinct from
/// "never requested".

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::keywrap;
use crate::crypto::path_key::member_secret;
use crate::error::{FeedError, Result};
use crate::feed::epoch::{advance_epoch, replace_state};
use crate::feed::sync::{self, load_chain, CachedKeyState, DeviceCache};
use crate::feed::{FollowGraph, Session};
use crate::ids::{DocumentId, Epoch, UserId};
use crate::limits::{check_follower_capacity, CapacityStatus};
use crate::store::{
    decode_fields, encode_fields, DocType, Document, DocumentStore, Filter, FollowRequestDoc,
    GrantDoc,
};

/// Why a grant is being revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    /// Owner explicitly revoked — permanent, re-requesting is refused.
    Explicit,
    /// Owner blocked the follower — the grant goes away, but permanence is
    /// the block's job, not this subsystem's.
    AutoBlock,
}

/// What a follower's device receives inside the sealed grant box.
#[derive(Serialize, Deserialize)]
pub(crate) struct GrantPayload {
    pub path_key: [u8; 32],
    pub member_secret: [u8; 32],
    pub epoch: Epoch,
    pub generation: String,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A follower asks for access to an owner's private feed. Requires an
/// existing plain follow relationship and no prior pending / approved /
/// permanently-revoked record.
pub(crate) async fn request_access<S: DocumentStore, G: FollowGraph>(
    store: &S,
    graph: &G,
    session: &Session,
    owner: &UserId,
) -> Result<DocumentId> {
    let chain = load_chain(store, owner).await?.ok_or(FeedError::NotEnabled)?;

    if !graph.is_following(session.user(), owner) {
        return Err(FeedError::NotFollowing);
    }
    if chain.state.revoked.contains(session.user()) {
        return Err(FeedError::PermanentlyRevoked);
    }
    if find_grant(store, owner, session.user()).await?.is_some() {
        return Err(FeedError::AlreadyApproved);
    }
    if find_request(store, owner, session.user()).await?.is_some() {
        return Err(FeedError::AlreadyPending);
    }

    let request = FollowRequestDoc {
        owner: owner.clone(),
        follower: session.user().clone(),
        follower_public_key: BASE64.encode(session.device_public()),
        ignored: false,
    };
    let id = store
        .create_document(DocType::FollowRequest, encode_fields(&request))
        .await?;
    log::debug!("access request from {} to {}", session.user(), owner);
    Ok(id)
}

/// Requests visible in the owner's pending view (ignored ones filtered).
pub(crate) async fn pending_requests<S: DocumentStore>(
    store: &S,
    owner: &UserId,
) -> Result<Vec<FollowRequestDoc>> {
    let filter = Filter::new().eq("owner", owner.as_str()).eq("ignored", false);
    let docs = sync::with_retry("pending requests", || {
        store.read_documents(DocType::FollowRequest, &filter)
    })
    .await?;
    docs.iter()
        .map(|d| decode_fields(d).map_err(Into::into))
        .collect()
}

/// Remove a request from the pending view without invalidating it; the
/// follower stays approvable later.
pub(crate) async fn ignore<S: DocumentStore>(
    store: &S,
    session: &Session,
    follower: &UserId,
) -> Result<()> {
    let (id, mut request) = find_request(store, session.user(), follower)
        .await?
        .ok_or(FeedError::NotFound)?;
    if request.ignored {
        return Ok(());
    }
    request.ignored = true;
    store
        .create_document(DocType::FollowRequest, encode_fields(&request))
        .await?;
    store.delete_document(&id).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Approve
// ---------------------------------------------------------------------------

/// Approve a pending request: seal the current path key plus a fresh
/// member secret to the follower's device key, valid from the current
/// epoch onward. At the follower cap this fails before touching anything —
/// no grant created, no request deleted.
pub(crate) async fn approve<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    follower: &UserId,
) -> Result<()> {
    let seed = session
        .root_secret()
        .ok_or_else(|| FeedError::Validation("root secret required to approve".into()))?;
    let owner = session.user().clone();

    let synced = sync::ensure_current(store, cache, session, &owner).await?;
    let chain = &synced.chain;

    if check_follower_capacity(chain.state.follower_count as usize) == CapacityStatus::FollowersFull
    {
        return Err(FeedError::FollowerCapacity);
    }
    if chain.state.revoked.contains(follower) {
        return Err(FeedError::PermanentlyRevoked);
    }
    if find_grant(store, &owner, follower).await?.is_some() {
        return Err(FeedError::AlreadyApproved);
    }
    let (request_id, request) = find_request(store, &owner, follower)
        .await?
        .ok_or(FeedError::NotFound)?;

    let follower_public: [u8; 32] = BASE64
        .decode(&request.follower_public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FeedError::Validation("malformed follower public key".into()))?;

    let payload = GrantPayload {
        path_key: *synced.key.path_key.as_bytes(),
        member_secret: member_secret(seed, follower, synced.key.epoch),
        epoch: synced.key.epoch,
        generation: synced.key.generation.clone(),
    };
    let plain = bincode::serialize(&payload)
        .map_err(|e| FeedError::Validation(format!("grant encoding: {e}")))?;
    let sealed = keywrap::seal_to(&follower_public, &plain).map_err(|_| FeedError::Decryption)?;

    let grant = GrantDoc {
        owner: owner.clone(),
        follower: follower.clone(),
        epoch: synced.key.epoch,
        generation: synced.key.generation.clone(),
        sealed: BASE64.encode(sealed),
    };
    store
        .create_document(DocType::Grant, encode_fields(&grant))
        .await?;
    store.delete_document(&request_id).await?;

    let mut new_state = chain.state.clone();
    new_state.epoch = chain.current;
    new_state.follower_count += 1;
    replace_state(store, &chain.state_id, &new_state).await?;

    log::info!(
        "approved {} for {}'s private feed at epoch {}",
        follower,
        owner,
        synced.key.epoch
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Revoke
// ---------------------------------------------------------------------------

/// Revoke a follower's grant and advance the epoch as one linked
/// operation. The new rekey document carries boxes only for the members
/// that remain, so the revoked follower cannot derive the new path key
/// from anything they hold.
pub(crate) async fn revoke<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    follower: &UserId,
    reason: RevokeReason,
) -> Result<()> {
    let seed = session
        .root_secret()
        .ok_or_else(|| FeedError::Validation("root secret required to revoke".into()))?
        .clone();
    let owner = session.user().clone();

    let synced = sync::ensure_current(store, cache, session, &owner).await?;
    let chain = &synced.chain;

    let grants = all_grants(store, &owner).await?;
    let (target_id, _) = grants
        .iter()
        .find(|(_, g)| &g.follower == follower)
        .ok_or(FeedError::NotFound)?
        .clone();

    let remaining: Vec<(UserId, Epoch)> = grants
        .iter()
        .filter(|(_, g)| &g.follower != follower)
        .map(|(_, g)| (g.follower.clone(), g.epoch))
        .collect();

    let outcome = advance_epoch(
        store,
        &seed,
        chain,
        &synced.key.path_key,
        &remaining,
        follower,
        reason == RevokeReason::Explicit,
    )
    .await?;

    // Even if this deletion is lost to a crash, the grant is inert: its
    // member secret has no box in the new rekey document.
    store.delete_document(&target_id).await?;

    cache.save(
        &owner,
        &CachedKeyState {
            generation: synced.key.generation.clone(),
            epoch: outcome.epoch,
            path_key: *outcome.path_key.as_bytes(),
            root_secret_entered: true,
        },
    );

    log::info!(
        "revoked {} from {}'s private feed ({:?}), now at epoch {}",
        follower,
        owner,
        reason,
        outcome.epoch
    );
    Ok(())
}

/// Owner blocked `blocked`: revoke iff an active grant exists; blocking a
/// non-follower is a no-op for this subsystem. The effect is strictly
/// one-directional — a follower blocking the owner changes nothing here.
pub(crate) async fn auto_revoke_on_block<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    blocked: &UserId,
) -> Result<bool> {
    if find_grant(store, session.user(), blocked).await?.is_none() {
        return Ok(false);
    }
    revoke(store, cache, session, blocked, RevokeReason::AutoBlock).await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub(crate) async fn find_grant<S: DocumentStore>(
    store: &S,
    owner: &UserId,
    follower: &UserId,
) -> Result<Option<(DocumentId, GrantDoc)>> {
    let filter = Filter::new()
        .eq("owner", owner.as_str())
        .eq("follower", follower.as_str());
    let docs = sync::with_retry("grant lookup", || {
        store.read_documents(DocType::Grant, &filter)
    })
    .await?;
    decode_last(docs)
}

pub(crate) async fn all_grants<S: DocumentStore>(
    store: &S,
    owner: &UserId,
) -> Result<Vec<(DocumentId, GrantDoc)>> {
    let filter = Filter::new().eq("owner", owner.as_str());
    let docs = sync::with_retry("grants", || store.read_documents(DocType::Grant, &filter)).await?;
    docs.iter()
        .map(|d| Ok((d.id.clone(), decode_fields(d)?)))
        .collect()
}

async fn find_request<S: DocumentStore>(
    store: &S,
    owner: &UserId,
    follower: &UserId,
) -> Result<Option<(DocumentId, FollowRequestDoc)>> {
    let filter = Filter::new()
        .eq("owner", owner.as_str())
        .eq("follower", follower.as_str());
    let docs = sync::with_retry("request lookup", || {
        store.read_documents(DocType::FollowRequest, &filter)
    })
    .await?;
    decode_last(docs)
}

fn decode_last<T: serde::de::DeserializeOwned>(
    docs: Vec<Document>,
) -> Result<Option<(DocumentId, T)>> {
    match docs.last() {
        Some(d) => Ok(Some((d.id.clone(), decode_fields(d)?))),
        None => Ok(None),
    }
}
