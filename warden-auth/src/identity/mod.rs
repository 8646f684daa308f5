//! Ed25519 identities for hosts, users and the two certificate authorities.
//!
//! - [`PrivateKey`] - signing key, zeroized on drop, optionally sealed under a passphrase
//! - [`PublicKey`] - verification key, serialized as base64
//! - [`Signature`] - Ed25519 signature
//! - [`Fingerprint`] - `SHA256:{base64_no_padding}` display form of a public key
//!
//! # Example
//!
//! ```
//! use warden_auth::identity::PrivateKey;
//!
//! let key = PrivateKey::generate();
//! let signature = key.sign(b"hello");
//! assert!(key.public_key().verify(b"hello", &signature));
//! ```

mod keys;
mod sealed;

pub use keys::{Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature};
