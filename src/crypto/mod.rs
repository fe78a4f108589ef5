/// Cryptographic primitives: content AEAD, X25519 grant sealing, and the
/// forward path-key derivation engine.

pub mod encryption;
pub mod keywrap;
pub mod path_key;

pub use encryption::{open, seal};
pub use keywrap::{generate_recipient_keypair, open_sealed, seal_to};
pub use path_key::{
    content_key, derive_forward, initial_path_key, PathKey, RekeyAccess, RekeyStep, RootSecret,
};
