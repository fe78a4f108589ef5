/// Epoch state manager.
///
/// Lifecycle per owner: `Disabled → enable() → Enabled(epoch=1)`, then
/// `Enabled(e) → advance → Enabled(e+1)` on every revocation, and
/// `Enabled(e) → reset → Enabled(1, new seed)`. There is no transition
/// back to `Disabled` — explicit disable is unsupported.
///
/// The rekey chain is the authoritative epoch record; the state document
/// carries a convenience copy that an interrupted advance can leave one
/// step behind, and which the next advance repairs. Epoch advancement is
/// totally ordered per owner by the store: when two devices race, store
/// creation order picks the winner and the loser withdraws its rekey
/// document and surfaces a retryable conflict.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroize;

use crate::crypto::encryption;
use crate::crypto::path_key::{
    generate_delta, member_secret, member_wrap_key, owner_wrap_key, step_path_key, PathKey,
    RootSecret,
};
use crate::error::{FeedError, Result};
use crate::feed::sync::{load_chain, FeedChain};
use crate::ids::{DocumentId, Epoch, UserId, FIRST_EPOCH};
use crate::limits::{check_epoch_capacity, CapacityStatus};
use crate::store::{encode_fields, DocType, DocumentStore, FeedStateDoc, Filter, RekeyDoc};

/// Authoritative current epoch for an owner. Always read from the store,
/// never from a device cache.
pub(crate) async fn current_epoch<S: DocumentStore>(store: &S, owner: &UserId) -> Result<Epoch> {
    let chain = load_chain(store, owner).await?.ok_or(FeedError::NotEnabled)?;
    Ok(chain.current)
}

/// `Disabled → Enabled(epoch=1)`.
pub(crate) async fn enable_feed<S: DocumentStore>(
    store: &S,
    owner: &UserId,
    seed: &RootSecret,
) -> Result<DocumentId> {
    if load_chain(store, owner).await?.is_some() {
        return Err(FeedError::AlreadyEnabled);
    }

    let state = FeedStateDoc {
        owner: owner.clone(),
        epoch: FIRST_EPOCH,
        generation: seed.generation(),
        follower_count: 0,
        revocation_count: 0,
        revoked: Vec::new(),
        enabled: true,
    };
    let id = store
        .create_document(DocType::FeedState, encode_fields(&state))
        .await?;
    log::info!("private feed enabled for {} (generation {})", owner, state.generation);
    Ok(id)
}

/// Replace the state document: create the successor, then delete the
/// predecessor. Readers take the newest document, so the transient overlap
/// is harmless; a missing predecessor means a concurrent replacement
/// already removed it.
pub(crate) async fn replace_state<S: DocumentStore>(
    store: &S,
    old_id: &DocumentId,
    new_state: &FeedStateDoc,
) -> Result<DocumentId> {
    let new_id = store
        .create_document(DocType::FeedState, encode_fields(new_state))
        .await?;
    match store.delete_document(old_id).await {
        Ok(()) => {}
        Err(crate::store::StoreError::NotFound) => {
            log::warn!("state document {} already replaced concurrently", old_id);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(new_id)
}

pub(crate) struct AdvanceOutcome {
    pub epoch: Epoch,
    pub path_key: PathKey,
}

impl std::fmt::Debug for AdvanceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvanceOutcome")
            .field("epoch", &self.epoch)
            .field("path_key", &"<redacted>")
            .finish()
    }
}

/// Advance the epoch by one: publish exactly one rekey document whose
/// delta is reachable only by `remaining` members (and the owner), then
/// replace the state document. Linked to a revocation — `revoked_user` is
/// excluded from the boxes and, when `permanent`, recorded in the state's
/// revoked list.
pub(crate) async fn advance_epoch<S: DocumentStore>(
    store: &S,
    seed: &RootSecret,
    chain: &FeedChain,
    prev_key: &PathKey,
    remaining: &[(UserId, Epoch)],
    revoked_user: &UserId,
    permanent: bool,
) -> Result<AdvanceOutcome> {
    if check_epoch_capacity(chain.current) == CapacityStatus::EpochsExhausted {
        return Err(FeedError::EpochCapacity);
    }
    let next = chain.current + 1;

    let mut delta = generate_delta();
    let owner_box = encryption::seal(&delta, &owner_wrap_key(seed, next))
        .map_err(|_| FeedError::Decryption)?;

    let mut boxes = BTreeMap::new();
    for (follower, grant_epoch) in remaining {
        let w = member_secret(seed, follower, *grant_epoch);
        let sealed = encryption::seal(&delta, &member_wrap_key(&w, next))
            .map_err(|_| FeedError::Decryption)?;
        boxes.insert(follower.as_str().to_string(), BASE64.encode(sealed));
    }

    let rekey = RekeyDoc {
        owner: chain.state.owner.clone(),
        epoch: next,
        generation: chain.state.generation.clone(),
        owner_box: BASE64.encode(owner_box),
        boxes,
    };
    let rekey_id = store
        .create_document(DocType::Rekey, encode_fields(&rekey))
        .await?;

    // Total order check: if another device advanced to the same epoch
    // first, withdraw our document and let the caller re-sync and retry.
    let race_filter = Filter::new()
        .eq("owner", chain.state.owner.as_str())
        .eq("generation", chain.state.generation.clone())
        .eq("epoch", next);
    let competitors = store.read_documents(DocType::Rekey, &race_filter).await?;
    match competitors.first() {
        Some(winner) if winner.id != rekey_id => {
            log::info!(
                "epoch advance to {} for {} lost the race, withdrawing",
                next,
                chain.state.owner
            );
            let _ = store.delete_document(&rekey_id).await;
            return Err(FeedError::Conflict);
        }
        _ => {}
    }

    let mut revoked = chain.state.revoked.clone();
    if permanent && !revoked.contains(revoked_user) {
        revoked.push(revoked_user.clone());
    }
    let new_state = FeedStateDoc {
        owner: chain.state.owner.clone(),
        epoch: next,
        generation: chain.state.generation.clone(),
        follower_count: remaining.len() as u32,
        // One revocation per transition past epoch 1; recomputing from the
        // new epoch also repairs a counter left behind by a crashed advance.
        revocation_count: next - 1,
        revoked,
        enabled: true,
    };
    replace_state(store, &chain.state_id, &new_state).await?;

    let path_key = step_path_key(prev_key, &delta, next);
    delta.zeroize();
    log::info!(
        "epoch advanced to {} for {} ({} member boxes)",
        next,
        chain.state.owner,
        remaining.len()
    );
    Ok(AdvanceOutcome { epoch: next, path_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::path_key::initial_path_key;
    use crate::store::MemoryStore;

    fn owner() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_enable_starts_at_epoch_one() {
        let store = MemoryStore::new();
        let seed = RootSecret::from_bytes([1u8; 32]);

        enable_feed(&store, &owner(), &seed).await.unwrap();
        assert_eq!(current_epoch(&store, &owner()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enable_twice_fails() {
        let store = MemoryStore::new();
        let seed = RootSecret::from_bytes([1u8; 32]);

        enable_feed(&store, &owner(), &seed).await.unwrap();
        assert!(matches!(
            enable_feed(&store, &owner(), &seed).await,
            Err(FeedError::AlreadyEnabled)
        ));
    }

    #[tokio::test]
    async fn test_current_epoch_requires_enabled_feed() {
        let store = MemoryStore::new();
        assert!(matches!(
            current_epoch(&store, &owner()).await,
            Err(FeedError::NotEnabled)
        ));
    }

    #[tokio::test]
    async fn test_advance_increments_by_exactly_one() {
        let store = MemoryStore::new();
        let seed = RootSecret::from_bytes([2u8; 32]);
        enable_feed(&store, &owner(), &seed).await.unwrap();

        let chain = load_chain(&store, &owner()).await.unwrap().unwrap();
        let p1 = initial_path_key(&seed);
        let out = advance_epoch(&store, &seed, &chain, &p1, &[], &UserId::new("bob"), true)
            .await
            .unwrap();

        assert_eq!(out.epoch, 2);
        assert_ne!(out.path_key, p1);
        assert_eq!(current_epoch(&store, &owner()).await.unwrap(), 2);

        let chain = load_chain(&store, &owner()).await.unwrap().unwrap();
        assert_eq!(chain.state.revocation_count, 1);
        assert!(chain.state.revoked.contains(&UserId::new("bob")));
    }

    #[tokio::test]
    async fn test_advance_at_epoch_cap_fails() {
        let store = MemoryStore::new();
        let seed = RootSecret::from_bytes([3u8; 32]);

        let state = FeedStateDoc {
            owner: owner(),
            epoch: crate::limits::MAX_EPOCH,
            generation: seed.generation(),
            follower_count: 0,
            revocation_count: crate::limits::MAX_EPOCH - 1,
            revoked: Vec::new(),
            enabled: true,
        };
        store
            .create_document(DocType::FeedState, encode_fields(&state))
            .await
            .unwrap();

        let chain = load_chain(&store, &owner()).await.unwrap().unwrap();
        let p = initial_path_key(&seed);
        let err = advance_epoch(&store, &seed, &chain, &p, &[], &UserId::new("bob"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::EpochCapacity));
    }

    #[tokio::test]
    async fn test_concurrent_advance_loses_to_store_order() {
        let store = MemoryStore::new();
        let seed = RootSecret::from_bytes([4u8; 32]);
        enable_feed(&store, &owner(), &seed).await.unwrap();
        let chain = load_chain(&store, &owner()).await.unwrap().unwrap();

        // A competing device already published the epoch-2 rekey.
        let competitor = RekeyDoc {
            owner: owner(),
            epoch: 2,
            generation: seed.generation(),
            owner_box: BASE64.encode([0u8; 72]),
            boxes: BTreeMap::new(),
        };
        store
            .create_document(DocType::Rekey, encode_fields(&competitor))
            .await
            .unwrap();

        let p1 = initial_path_key(&seed);
        let err = advance_epoch(&store, &seed, &chain, &p1, &[], &UserId::new("bob"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Conflict));

        // The loser withdrew its rekey document: only the winner remains.
        let rekeys = store
            .read_documents(DocType::Rekey, &Filter::new().eq("epoch", 2))
            .await
            .unwrap();
        assert_eq!(rekeys.len(), 1);
    }
}
