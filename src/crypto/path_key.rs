/// Path-key derivation engine.
///
/// Forward-only key chain across epoch transitions:
///
/// 1. **Epoch 1**: `P1 = BLAKE3-derive(init-context, root_seed)`.
/// 2. **Transition e → e+1**: the owner publishes one broadcast rekey
///    document carrying a fresh random 32-byte delta, AEAD-sealed once per
///    still-approved member (and once for the owner). The next path key is
///    `P(e+1) = HMAC-SHA256(P(e), 0x01 ‖ delta ‖ e+1)` — a one-way step
///    that requires BOTH the previous path key and the unwrapped delta.
///    A revoked member holds `P(e)` but has no box for the delta, so every
///    path key from the revocation epoch onward is unreachable.
/// 3. **CEK**: `BLAKE3-derive(content-context, P(e) ‖ owner ‖ e)` —
///    deterministic and collision-free across owners and epochs.
///
/// `derive_forward` applies rekey documents strictly in increasing epoch
/// order and fails fast on any gap: skipping a document would derive a
/// wrong key, not a stale one.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ids::{Epoch, UserId};

type HmacSha256 = Hmac<Sha256>;

const INIT_CONTEXT: &str = "Veilfeed-PathKey-Init-v1";
const MEMBER_SECRET_CONTEXT: &str = "Veilfeed-MemberSecret-v1";
const OWNER_WRAP_CONTEXT: &str = "Veilfeed-OwnerWrap-v1";
const MEMBER_WRAP_CONTEXT: &str = "Veilfeed-MemberWrap-v1";
const CONTENT_KEY_CONTEXT: &str = "Veilfeed-ContentKey-v1";
const GENERATION_CONTEXT: &str = "Veilfeed-Generation-v1";
const PASSPHRASE_SALT_CONTEXT: &str = "Veilfeed-Passphrase-Salt-v1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PathKeyError {
    #[error("Rekey chain gap: expected epoch {expected}, got {found}")]
    ChainGap { expected: Epoch, found: Epoch },

    #[error("Rekey chain ends at epoch {reached}, target was {target}")]
    ChainShort { reached: Epoch, target: Epoch },

    #[error("Could not unwrap rekey delta for epoch {epoch}")]
    UnwrapFailed { epoch: Epoch },

    #[error("Target epoch {target} is not ahead of known epoch {known}")]
    BadRange { known: Epoch, target: Epoch },

    #[error("Passphrase stretching failed")]
    PassphraseStretch,
}

pub type Result<T> = std::result::Result<T, PathKeyError>;

// ---------------------------------------------------------------------------
// RootSecret
// ---------------------------------------------------------------------------

/// The owner's root seed. Never leaves the owner's devices; every other
/// secret in the feed derives from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootSecret([u8; 32]);

impl RootSecret {
    /// Wrap 32 bytes of existing entropy (e.g. from a platform keystore).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        RootSecret(bytes)
    }

    /// Generate a fresh random root secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        RootSecret(bytes)
    }

    /// Stretch a user passphrase into a root secret with Argon2id.
    /// The salt is derived from the owner id so all of the owner's devices
    /// reach the same seed from the same passphrase.
    pub fn from_passphrase(passphrase: &str, owner: &UserId) -> Result<Self> {
        let salt = blake3::derive_key(PASSPHRASE_SALT_CONTEXT, owner.as_str().as_bytes());
        let mut seed = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut seed)
            .map_err(|_| PathKeyError::PassphraseStretch)?;
        Ok(RootSecret(seed))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One-way public fingerprint of the seed. Stored in the feed-state
    /// document so devices can detect a reset (new seed → new generation)
    /// without ever seeing the seed itself.
    pub fn generation(&self) -> String {
        let digest = blake3::derive_key(GENERATION_CONTEXT, &self.0);
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootSecret(gen={})", self.generation())
    }
}

// ---------------------------------------------------------------------------
// PathKey
// ---------------------------------------------------------------------------

/// The shared per-epoch path key. All approved members hold the same path
/// key for a given epoch; the CEK derives from it.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PathKey([u8; 32]);

impl PathKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PathKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathKey(..)")
    }
}

/// Epoch-1 path key for a seed.
pub fn initial_path_key(seed: &RootSecret) -> PathKey {
    PathKey(blake3::derive_key(INIT_CONTEXT, seed.as_bytes()))
}

// ---------------------------------------------------------------------------
// Per-member secrets and wrap keys
// ---------------------------------------------------------------------------

/// Per-follower member secret, handed over inside the sealed grant. The
/// owner recomputes it from the seed at any time, so authoring a rekey
/// document needs no per-follower state beyond the grant documents.
pub fn member_secret(seed: &RootSecret, follower: &UserId, grant_epoch: Epoch) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + follower.as_str().len() + 4);
    input.extend_from_slice(seed.as_bytes());
    input.extend_from_slice(follower.as_str().as_bytes());
    input.extend_from_slice(&grant_epoch.to_be_bytes());
    blake3::derive_key(MEMBER_SECRET_CONTEXT, &input)
}

/// Key wrapping the rekey delta for the owner's own devices.
pub fn owner_wrap_key(seed: &RootSecret, epoch: Epoch) -> [u8; 32] {
    let mut input = Vec::with_capacity(36);
    input.extend_from_slice(seed.as_bytes());
    input.extend_from_slice(&epoch.to_be_bytes());
    blake3::derive_key(OWNER_WRAP_CONTEXT, &input)
}

/// Key wrapping the rekey delta for one member at one epoch.
pub fn member_wrap_key(member_secret: &[u8; 32], epoch: Epoch) -> [u8; 32] {
    let mut input = Vec::with_capacity(36);
    input.extend_from_slice(member_secret);
    input.extend_from_slice(&epoch.to_be_bytes());
    blake3::derive_key(MEMBER_WRAP_CONTEXT, &input)
}

/// Fresh random delta for one epoch transition.
pub fn generate_delta() -> [u8; 32] {
    let mut delta = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut delta);
    delta
}

// ---------------------------------------------------------------------------
// Forward derivation
// ---------------------------------------------------------------------------

/// One unwrapped-for-the-caller rekey step: the sealed delta addressed to
/// this caller (owner box or the caller's member box), tagged with the
/// epoch the step derives.
#[derive(Clone)]
pub struct RekeyStep {
    pub epoch: Epoch,
    pub sealed_delta: Vec<u8>,
}

/// How the caller unwraps rekey deltas during catch-up.
pub enum RekeyAccess<'a> {
    /// The owner, deriving wrap keys from the root seed.
    Owner(&'a RootSecret),
    /// An approved member, deriving wrap keys from the member secret
    /// delivered in their grant.
    Member(&'a [u8; 32]),
}

impl RekeyAccess<'_> {
    fn wrap_key(&self, epoch: Epoch) -> [u8; 32] {
        match self {
            RekeyAccess::Owner(seed) => owner_wrap_key(seed, epoch),
            RekeyAccess::Member(secret) => member_wrap_key(secret, epoch),
        }
    }
}

/// One-way step: `P(next) = HMAC-SHA256(P(prev), 0x01 ‖ delta ‖ next)`.
pub fn step_path_key(prev: &PathKey, delta: &[u8; 32], next_epoch: Epoch) -> PathKey {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(prev.as_bytes())
        .expect("HMAC key length valid");
    mac.update(&[0x01]);
    mac.update(delta);
    mac.update(&next_epoch.to_be_bytes());
    let next: [u8; 32] = mac.finalize().into_bytes().into();
    PathKey(next)
}

/// Advance a known path key to `target` by applying rekey steps strictly
/// in increasing epoch order over `(known, target]`.
///
/// Pure and idempotent: the same inputs always yield the same key. Any
/// missing epoch in the range fails fast with `ChainGap` — applying a
/// later step to an earlier key would derive a wrong key, not a stale one.
pub fn derive_forward(
    known_epoch: Epoch,
    known_key: &PathKey,
    target_epoch: Epoch,
    steps: &[RekeyStep],
    access: &RekeyAccess<'_>,
) -> Result<PathKey> {
    if target_epoch <= known_epoch {
        return Err(PathKeyError::BadRange {
            known: known_epoch,
            target: target_epoch,
        });
    }

    let mut key = known_key.clone();
    let mut at = known_epoch;

    for step in steps {
        let expected = at + 1;
        if step.epoch != expected {
            return Err(PathKeyError::ChainGap {
                expected,
                found: step.epoch,
            });
        }

        let wrap_key = access.wrap_key(step.epoch);
        let delta_bytes = crate::crypto::encryption::open(&step.sealed_delta, &wrap_key)
            .map_err(|_| PathKeyError::UnwrapFailed { epoch: step.epoch })?;
        let mut delta = [0u8; 32];
        if delta_bytes.len() != 32 {
            return Err(PathKeyError::UnwrapFailed { epoch: step.epoch });
        }
        delta.copy_from_slice(&delta_bytes);

        key = step_path_key(&key, &delta, step.epoch);
        delta.zeroize();
        at = step.epoch;

        if at == target_epoch {
            break;
        }
    }

    if at != target_epoch {
        return Err(PathKeyError::ChainShort {
            reached: at,
            target: target_epoch,
        });
    }

    Ok(key)
}

// ---------------------------------------------------------------------------
// Content encryption key
// ---------------------------------------------------------------------------

/// Per-epoch content encryption key. Deterministic KDF of
/// `(path_key, owner, epoch)` — distinct owners or epochs can never
/// collide on a CEK even with equal path-key bytes.
pub fn content_key(path_key: &PathKey, owner: &UserId, epoch: Epoch) -> [u8; 32] {
    let mut input = Vec::with_capacity(32 + owner.as_str().len() + 4);
    input.extend_from_slice(path_key.as_bytes());
    input.extend_from_slice(owner.as_str().as_bytes());
    input.extend_from_slice(&epoch.to_be_bytes());
    blake3::derive_key(CONTENT_KEY_CONTEXT, &input)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encryption;

    fn seal_delta(delta: &[u8; 32], wrap_key: &[u8; 32]) -> Vec<u8> {
        encryption::seal(delta, wrap_key).unwrap()
    }

    /// Build an owner-accessible chain of `n` transitions from epoch 1.
    fn build_chain(seed: &RootSecret, n: u32) -> Vec<RekeyStep> {
        let mut steps = Vec::new();
        for e in 2..=(n + 1) {
            let delta = generate_delta();
            steps.push(RekeyStep {
                epoch: e,
                sealed_delta: seal_delta(&delta, &owner_wrap_key(seed, e)),
            });
        }
        steps
    }

    #[test]
    fn test_initial_path_key_deterministic() {
        let seed = RootSecret::from_bytes([7u8; 32]);
        assert_eq!(initial_path_key(&seed), initial_path_key(&seed));

        let other = RootSecret::from_bytes([8u8; 32]);
        assert_ne!(initial_path_key(&seed), initial_path_key(&other));
    }

    #[test]
    fn test_derive_forward_walks_chain() {
        let seed = RootSecret::from_bytes([1u8; 32]);
        let p1 = initial_path_key(&seed);
        let steps = build_chain(&seed, 3); // epochs 2..=4

        let p4 = derive_forward(1, &p1, 4, &steps, &RekeyAccess::Owner(&seed)).unwrap();
        assert_ne!(p4, p1);

        // Intermediate target uses only a prefix of the chain
        let p2 = derive_forward(1, &p1, 2, &steps, &RekeyAccess::Owner(&seed)).unwrap();
        let p4_again = derive_forward(2, &p2, 4, &steps[1..], &RekeyAccess::Owner(&seed)).unwrap();
        assert_eq!(p4, p4_again);
    }

    #[test]
    fn test_derive_forward_idempotent() {
        let seed = RootSecret::from_bytes([2u8; 32]);
        let p1 = initial_path_key(&seed);
        let steps = build_chain(&seed, 5);

        let a = derive_forward(1, &p1, 6, &steps, &RekeyAccess::Owner(&seed)).unwrap();
        let b = derive_forward(1, &p1, 6, &steps, &RekeyAccess::Owner(&seed)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_gap_fails_fast() {
        let seed = RootSecret::from_bytes([3u8; 32]);
        let p1 = initial_path_key(&seed);
        let mut steps = build_chain(&seed, 3);
        steps.remove(1); // drop epoch 3 → gap

        let err = derive_forward(1, &p1, 4, &steps, &RekeyAccess::Owner(&seed)).unwrap_err();
        assert!(matches!(err, PathKeyError::ChainGap { expected: 3, found: 4 }));
    }

    #[test]
    fn test_short_chain_fails() {
        let seed = RootSecret::from_bytes([4u8; 32]);
        let p1 = initial_path_key(&seed);
        let steps = build_chain(&seed, 2); // reaches epoch 3

        let err = derive_forward(1, &p1, 5, &steps, &RekeyAccess::Owner(&seed)).unwrap_err();
        assert!(matches!(err, PathKeyError::ChainShort { reached: 3, target: 5 }));
    }

    #[test]
    fn test_bad_range_rejected() {
        let seed = RootSecret::from_bytes([5u8; 32]);
        let p1 = initial_path_key(&seed);
        assert!(derive_forward(3, &p1, 3, &[], &RekeyAccess::Owner(&seed)).is_err());
        assert!(derive_forward(3, &p1, 2, &[], &RekeyAccess::Owner(&seed)).is_err());
    }

    #[test]
    fn test_delta_alone_is_useless_without_prior_key() {
        let seed = RootSecret::from_bytes([6u8; 32]);
        let p1 = initial_path_key(&seed);
        let delta = generate_delta();

        let p2 = step_path_key(&p1, &delta, 2);
        let from_wrong_base = step_path_key(&initial_path_key(&RootSecret::from_bytes([9u8; 32])), &delta, 2);
        assert_ne!(p2, from_wrong_base);
    }

    #[test]
    fn test_member_access_unwraps_member_boxes() {
        let seed = RootSecret::from_bytes([10u8; 32]);
        let follower = UserId::new("bob");
        let w = member_secret(&seed, &follower, 1);

        let p1 = initial_path_key(&seed);
        let delta = generate_delta();
        let step = RekeyStep {
            epoch: 2,
            sealed_delta: seal_delta(&delta, &member_wrap_key(&w, 2)),
        };

        let via_member =
            derive_forward(1, &p1, 2, &[step.clone()], &RekeyAccess::Member(&w)).unwrap();
        assert_eq!(via_member, step_path_key(&p1, &delta, 2));

        // The owner wrap key cannot open a member box
        let err = derive_forward(1, &p1, 2, &[step], &RekeyAccess::Owner(&seed)).unwrap_err();
        assert!(matches!(err, PathKeyError::UnwrapFailed { epoch: 2 }));
    }

    #[test]
    fn test_content_key_domain_separation() {
        let seed = RootSecret::from_bytes([11u8; 32]);
        let p = initial_path_key(&seed);
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert_ne!(content_key(&p, &alice, 1), content_key(&p, &bob, 1));
        assert_ne!(content_key(&p, &alice, 1), content_key(&p, &alice, 2));
        assert_eq!(content_key(&p, &alice, 1), content_key(&p, &alice, 1));
    }

    #[test]
    fn test_generation_is_stable_and_seed_bound() {
        let a = RootSecret::from_bytes([12u8; 32]);
        let b = RootSecret::from_bytes([13u8; 32]);
        assert_eq!(a.generation(), a.generation());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(a.generation().len(), 16);
    }

    #[test]
    fn test_passphrase_stretching_deterministic_per_owner() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let a1 = RootSecret::from_passphrase("correct horse", &alice).unwrap();
        let a2 = RootSecret::from_passphrase("correct horse", &alice).unwrap();
        let b = RootSecret::from_passphrase("correct horse", &bob).unwrap();

        assert_eq!(a1.as_bytes(), a2.as_bytes());
        assert_ne!(a1.as_bytes(), b.as_bytes());
    }
}
