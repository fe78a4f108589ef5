/// Destructive full re-keying.
///
/// Reset replaces the root seed, restarts the epoch at 1 under a fresh
/// generation, and orphans every grant — nothing encrypted before the
/// reset is ever readable again, and no content is re-encrypted. Every
/// prior follower reverts to "never requested" and must re-request and be
/// re-approved from scratch.
///
/// Irreversible, so it demands a multi-field confirmation: the literal
/// phrase AND the current root secret, both checked before anything is
/// touched.

use subtle::ConstantTimeEq;

use crate::crypto::path_key::{initial_path_key, RootSecret};
use crate::error::{FeedError, Result};
use crate::feed::sync::{self, load_chain, CachedKeyState, DeviceCache};
use crate::feed::Session;
use crate::ids::{UserId, FIRST_EPOCH};
use crate::store::{encode_fields, DocType, DocumentStore, FeedStateDoc, Filter};

/// The literal phrase the owner must type to confirm a reset.
pub const RESET_CONFIRMATION_PHRASE: &str = "permanently reset my private feed";

pub(crate) async fn reset<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    session: &Session,
    new_root: &RootSecret,
    confirmation_phrase: &str,
) -> Result<()> {
    let owner = session.user().clone();
    let chain = load_chain(store, &owner).await?.ok_or(FeedError::NotEnabled)?;

    if !ct_str_eq(confirmation_phrase, RESET_CONFIRMATION_PHRASE) {
        return Err(FeedError::Validation(
            "reset confirmation phrase does not match".into(),
        ));
    }

    let current = session
        .root_secret()
        .ok_or_else(|| FeedError::Validation("current root secret required to reset".into()))?;
    if !ct_str_eq(&current.generation(), &chain.state.generation) {
        return Err(FeedError::Validation(
            "current root secret does not match the feed".into(),
        ));
    }

    let new_generation = new_root.generation();
    if ct_str_eq(&new_generation, &chain.state.generation) {
        return Err(FeedError::Validation(
            "new root secret must differ from the current one".into(),
        ));
    }

    // Confirmations passed; from here the old generation is torn down.
    delete_all(store, DocType::Grant, &owner).await?;
    delete_all(store, DocType::FollowRequest, &owner).await?;
    delete_all(store, DocType::Rekey, &owner).await?;

    let new_state = FeedStateDoc {
        owner: owner.clone(),
        epoch: FIRST_EPOCH,
        generation: new_generation.clone(),
        follower_count: 0,
        revocation_count: 0,
        revoked: Vec::new(),
        enabled: true,
    };
    store
        .create_document(DocType::FeedState, encode_fields(&new_state))
        .await?;
    match store.delete_document(&chain.state_id).await {
        Ok(()) | Err(crate::store::StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    cache.save(
        &owner,
        &CachedKeyState {
            generation: new_generation.clone(),
            epoch: FIRST_EPOCH,
            path_key: *initial_path_key(new_root).as_bytes(),
            root_secret_entered: true,
        },
    );

    log::warn!(
        "private feed for {} was reset: generation {} -> {}; all grants orphaned",
        owner,
        chain.state.generation,
        new_generation
    );
    Ok(())
}

/// Delete every document of `doc_type` belonging to `owner`, across all
/// generations.
async fn delete_all<S: DocumentStore>(store: &S, doc_type: DocType, owner: &UserId) -> Result<()> {
    let filter = Filter::new().eq("owner", owner.as_str());
    let docs =
        sync::with_retry("reset sweep", || store.read_documents(doc_type, &filter)).await?;
    for doc in docs {
        match store.delete_document(&doc.id).await {
            Ok(()) | Err(crate::store::StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
