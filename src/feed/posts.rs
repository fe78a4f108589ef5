/// Content encryption service.
///
/// Posts encrypt at composition time under the CEK of the *current* epoch
/// and are tagged with `(owner, generation, epoch)`, so later epoch
/// advances never retroactively break them for holders of that epoch's
/// key. Two relationships get special treatment:
///
/// - **Reply inheritance**: a reply to a private post always encrypts
///   under the PARENT's context, never the replier's own feed, so exactly
///   the parent's audience can read it. A public reply to a private
///   parent changes the audience to "everyone" and therefore demands an
///   explicit acknowledgement.
/// - **Quote separation**: a quote wrapper is keyed to the quoter's own
///   feed; the embedded quoted post stays keyed to the original owner.
///   A viewer missing either grant sees a locked placeholder for that
///   layer, not an error.
///
/// Decryption failures degrade to `Locked` and are never cached; only
/// successfully derived CEKs enter the (in-memory, bounded) key cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use lru::LruCache;

use crate::crypto::encryption;
use crate::crypto::path_key::content_key;
use crate::error::{FeedError, Result};
use crate::feed::sync::{self, load_chain, DeviceCache};
use crate::feed::Session;
use crate::ids::{DocumentId, Epoch, UserId};
use crate::store::{
    decode_fields, encode_fields, DocType, DocumentStore, Filter, PostDoc, VisibilityTag,
};

/// Bounded cache of successfully derived CEKs, keyed by
/// `(owner, generation, epoch)`. Failures never enter it.
pub(crate) struct CekCache {
    inner: Mutex<LruCache<(UserId, String, Epoch), [u8; 32]>>,
}

impl CekCache {
    pub fn new() -> Self {
        CekCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(256).unwrap())),
        }
    }

    fn get(&self, key: &(UserId, String, Epoch)) -> Option<[u8; 32]> {
        self.inner.lock().unwrap().get(key).copied()
    }

    fn put(&self, key: (UserId, String, Epoch), cek: [u8; 32]) {
        self.inner.lock().unwrap().put(key, cek);
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Post visibility, chosen by the author at composition time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Plaintext, readable by everyone.
    Public,
    /// Body encrypted for the feed's approved followers.
    Private,
    /// Plaintext teaser plus encrypted body.
    PrivateWithTeaser { teaser: String },
}

/// Composition options beyond body and visibility.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub parent_id: Option<DocumentId>,
    pub quoted_post_id: Option<DocumentId>,
    /// Required when posting a PUBLIC reply to a private parent: the
    /// author explicitly acknowledges widening the audience to everyone.
    pub acknowledge_public_reply: bool,
}

/// Handle to a stored post.
#[derive(Debug, Clone)]
pub struct PostRef {
    pub id: DocumentId,
    /// Epoch the body is encrypted under; `None` for public posts.
    pub epoch: Option<Epoch>,
}

/// One content layer as presented to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentView {
    Public { body: String },
    Unlocked { teaser: Option<String>, body: String },
    /// Undecryptable here and now; retryable, never persisted as failed.
    Locked { teaser: Option<String> },
}

/// A decrypted post plus its independently keyed quoted layer, if any.
#[derive(Debug, Clone)]
pub struct PostView {
    pub id: DocumentId,
    pub author: UserId,
    pub content: ContentView,
    pub quoted: Option<(DocumentId, ContentView)>,
}

// ---------------------------------------------------------------------------
// Compose
// ---------------------------------------------------------------------------

pub(crate) async fn compose<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    cek_cache: &CekCache,
    session: &Session,
    body: &str,
    visibility: Visibility,
    opts: ComposeOptions,
) -> Result<PostRef> {
    let parent = match &opts.parent_id {
        Some(pid) => Some(fetch_post(store, pid).await?.ok_or(FeedError::NotFound)?),
        None => None,
    };
    if let Some(qid) = &opts.quoted_post_id {
        // The quoted post must exist; its key material is never touched.
        fetch_post(store, qid).await?.ok_or(FeedError::NotFound)?;
    }

    let parent_is_private = parent
        .as_ref()
        .map_or(false, |(_, p)| p.visibility != VisibilityTag::Public);

    let (tag, teaser) = match &visibility {
        Visibility::Public => {
            if parent_is_private && !opts.acknowledge_public_reply {
                return Err(FeedError::Validation(
                    "a public reply to a private post changes its audience to everyone; \
                     explicit acknowledgement required"
                        .into(),
                ));
            }
            (VisibilityTag::Public, None)
        }
        Visibility::Private => (VisibilityTag::Private, None),
        Visibility::PrivateWithTeaser { teaser } => {
            (VisibilityTag::PrivateWithTeaser, Some(teaser.clone()))
        }
    };

    let doc = if tag == VisibilityTag::Public {
        PostDoc {
            author: session.user().clone(),
            visibility: tag,
            teaser: None,
            body: body.to_string(),
            key_owner: None,
            key_epoch: None,
            key_generation: None,
            inherits_parent: false,
            parent_id: opts.parent_id.clone(),
            quoted_post_id: opts.quoted_post_id.clone(),
            created_at: Utc::now(),
        }
    } else if parent_is_private {
        // Reply inheritance: encrypt under the parent's owner+epoch, even
        // cross-owner, so exactly the parent's audience can read it.
        let (_, parent_doc) = parent.as_ref().unwrap();
        let (key_owner, key_gen, key_epoch) = parent_tag(parent_doc)?;
        let cek = resolve_cek(store, cache, cek_cache, session, &key_owner, &key_gen, key_epoch)
            .await?;
        let sealed = encryption::seal(body.as_bytes(), &cek).map_err(|_| FeedError::Decryption)?;
        PostDoc {
            author: session.user().clone(),
            visibility: tag,
            teaser,
            body: BASE64.encode(sealed),
            key_owner: Some(key_owner),
            key_epoch: Some(key_epoch),
            key_generation: Some(key_gen),
            inherits_parent: true,
            parent_id: opts.parent_id.clone(),
            quoted_post_id: opts.quoted_post_id.clone(),
            created_at: Utc::now(),
        }
    } else {
        // Own-feed private post: block on write-path sync, then encrypt
        // under the current epoch.
        let synced = sync::ensure_current(store, cache, session, session.user()).await?;
        let cek = content_key(&synced.key.path_key, session.user(), synced.key.epoch);
        let sealed = encryption::seal(body.as_bytes(), &cek).map_err(|_| FeedError::Decryption)?;
        cek_cache.put(
            (session.user().clone(), synced.key.generation.clone(), synced.key.epoch),
            cek,
        );
        PostDoc {
            author: session.user().clone(),
            visibility: tag,
            teaser,
            body: BASE64.encode(sealed),
            key_owner: Some(session.user().clone()),
            key_epoch: Some(synced.key.epoch),
            key_generation: Some(synced.key.generation.clone()),
            inherits_parent: false,
            parent_id: opts.parent_id.clone(),
            quoted_post_id: opts.quoted_post_id.clone(),
            created_at: Utc::now(),
        }
    };

    let epoch = doc.key_epoch;
    let id = store.create_document(DocType::Post, encode_fields(&doc)).await?;
    Ok(PostRef { id, epoch })
}

fn parent_tag(parent: &PostDoc) -> Result<(UserId, String, Epoch)> {
    match (&parent.key_owner, &parent.key_generation, parent.key_epoch) {
        (Some(o), Some(g), Some(e)) => Ok((o.clone(), g.clone(), e)),
        _ => Err(FeedError::Validation(
            "parent post is private but carries no key tag".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

/// Decrypt a post for display. Never fails on key trouble — the affected
/// layer degrades to `Locked` and stays retryable. Only a failure to read
/// the post document itself is an error.
pub(crate) async fn decrypt<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    cek_cache: &CekCache,
    session: &Session,
    post_id: &DocumentId,
) -> Result<PostView> {
    let (id, doc) = fetch_post(store, post_id).await?.ok_or(FeedError::NotFound)?;

    let content = decrypt_content(store, cache, cek_cache, session, &doc).await;

    let quoted = match &doc.quoted_post_id {
        Some(qid) => {
            // Independently keyed layer; any trouble becomes a placeholder.
            let view = match fetch_post(store, qid).await {
                Ok(Some((_, qdoc))) => {
                    decrypt_content(store, cache, cek_cache, session, &qdoc).await
                }
                _ => ContentView::Locked { teaser: None },
            };
            Some((qid.clone(), view))
        }
        None => None,
    };

    Ok(PostView {
        id,
        author: doc.author.clone(),
        content,
        quoted,
    })
}

async fn decrypt_content<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    cek_cache: &CekCache,
    session: &Session,
    doc: &PostDoc,
) -> ContentView {
    if doc.visibility == VisibilityTag::Public {
        return ContentView::Public { body: doc.body.clone() };
    }

    let locked = ContentView::Locked { teaser: doc.teaser.clone() };

    let (owner, generation, epoch) =
        match (&doc.key_owner, &doc.key_generation, doc.key_epoch) {
            (Some(o), Some(g), Some(e)) => (o.clone(), g.clone(), e),
            _ => {
                log::warn!("private post without key tag; rendering locked");
                return locked;
            }
        };

    let cek = match resolve_cek(store, cache, cek_cache, session, &owner, &generation, epoch).await
    {
        Ok(cek) => cek,
        Err(e) => {
            log::debug!(
                "CEK for {}@{} (gen {}) unavailable: {}",
                owner,
                epoch,
                generation,
                e
            );
            return locked;
        }
    };

    let sealed = match BASE64.decode(&doc.body) {
        Ok(b) => b,
        Err(_) => return locked,
    };
    match encryption::open(&sealed, &cek) {
        Ok(plain) => match String::from_utf8(plain) {
            Ok(body) => ContentView::Unlocked { teaser: doc.teaser.clone(), body },
            Err(_) => locked,
        },
        Err(_) => locked,
    }
}

/// Derive-or-fetch the CEK for one `(owner, generation, epoch)` context,
/// triggering catch-up through the rekey chain as needed. Successes are
/// cached; failures never are.
async fn resolve_cek<S: DocumentStore, C: DeviceCache>(
    store: &S,
    cache: &C,
    cek_cache: &CekCache,
    session: &Session,
    owner: &UserId,
    generation: &str,
    epoch: Epoch,
) -> Result<[u8; 32]> {
    let cache_key = (owner.clone(), generation.to_string(), epoch);
    if let Some(cek) = cek_cache.get(&cache_key) {
        return Ok(cek);
    }

    let chain = load_chain(store, owner).await?.ok_or(FeedError::NotEnabled)?;
    if chain.state.generation != generation {
        // Content from a generation that was reset away is permanently
        // unreadable; no amount of catch-up derives its keys.
        return Err(FeedError::Foreclosed { epoch });
    }

    let cached_state = cache.load(owner);
    let path_key =
        sync::path_key_at(store, &chain, cached_state.as_ref(), session, owner, epoch).await?;
    let cek = content_key(&path_key, owner, epoch);
    cek_cache.put(cache_key, cek);
    Ok(cek)
}

async fn fetch_post<S: DocumentStore>(
    store: &S,
    id: &DocumentId,
) -> Result<Option<(DocumentId, PostDoc)>> {
    let filter = Filter::new().id(id);
    let docs =
        sync::with_retry("post", || store.read_documents(DocType::Post, &filter)).await?;
    match docs.first() {
        Some(d) => Ok(Some((d.id.clone(), decode_fields(d)?))),
        None => Ok(None),
    }
}
