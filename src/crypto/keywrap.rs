/// X25519 sealed boxes for grant delivery.
///
/// A grant wraps path-key material for exactly one follower. The owner
/// seals it to the follower's static X25519 public key with an ephemeral
/// keypair, so only the follower's device can open it and the owner keeps
/// no per-follower symmetric state.
///
/// Wire format: [ephemeral public: 32][nonce: 24][ciphertext + tag]

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::crypto::encryption;

#[derive(Error, Debug)]
pub enum KeyWrapError {
    #[error("Sealing failed")]
    SealFailed,
    #[error("Opening failed (wrong recipient or corrupted box)")]
    OpenFailed,
    #[error("Malformed sealed box")]
    Malformed,
}

pub type Result<T> = std::result::Result<T, KeyWrapError>;

const HKDF_INFO: &[u8] = b"Veilfeed-GrantWrap-v1";

/// Generate a static X25519 keypair for a device identity.
///
/// # Returns
/// (public_key, secret_key) - Both as 32-byte arrays
pub fn generate_recipient_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public.to_bytes(), secret.to_bytes())
}

/// Derive the public key for a stored secret key.
pub fn derive_public_key(secret_key: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret_key);
    PublicKey::from(&secret).to_bytes()
}

/// Seal `plaintext` to a recipient's static X25519 public key.
pub fn seal_to(recipient_public: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_public));
    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, recipient_public)?;

    let sealed = encryption::seal(plaintext, &wrap_key).map_err(|_| KeyWrapError::SealFailed)?;

    let mut boxed = Vec::with_capacity(32 + sealed.len());
    boxed.extend_from_slice(&ephemeral_public);
    boxed.extend_from_slice(&sealed);
    Ok(boxed)
}

/// Open a sealed box with the recipient's static X25519 secret key.
pub fn open_sealed(recipient_secret: &[u8; 32], boxed: &[u8]) -> Result<Vec<u8>> {
    if boxed.len() < 32 {
        return Err(KeyWrapError::Malformed);
    }
    let (eph_bytes, sealed) = boxed.split_at(32);
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(eph_bytes);

    let secret = StaticSecret::from(*recipient_secret);
    let recipient_public = PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));

    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, &recipient_public)?;

    encryption::open(sealed, &wrap_key).map_err(|_| KeyWrapError::OpenFailed)
}

/// HKDF-SHA256 over the DH output, bound to both public keys so a box
/// cannot be replayed toward a different recipient.
fn derive_wrap_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<[u8; 32]> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut wrap_key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut wrap_key)
        .map_err(|_| KeyWrapError::SealFailed)?;
    Ok(wrap_key)
}
