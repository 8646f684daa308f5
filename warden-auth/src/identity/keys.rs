//! Ed25519 key material for hosts, users and certificate authorities.
//!
//! - Private keys are zeroized on drop and never implement `Debug`
//! - Public keys and signatures serialize as standard base64 strings
//! - Fingerprints are OpenSSH `SHA256:{base64_no_padding}` hashes of the
//!   `ssh-ed25519` key blob, so they match `ssh-keygen -lf`

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssh_key::private::Ed25519Keypair;
use ssh_key::public::{Ed25519PublicKey, KeyData};
use ssh_key::HashAlg;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors that can occur during key operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The provided bytes have an invalid length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The provided bytes do not represent a valid key.
    #[error("invalid key format")]
    InvalidFormat,

    /// PKCS#8 encoding of a private key failed.
    #[error("failed to encode private key")]
    Encoding,

    /// A passphrase-protected key could not be opened.
    #[error("wrong passphrase or corrupted key")]
    Decryption,

    /// A passphrase-protected key is stored but no passphrase was supplied.
    #[error("private key is passphrase protected")]
    PassphraseRequired,
}

/// A zeroize-on-drop wrapper for secret bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Copy the secret into a plain `Vec<u8>`.
    ///
    /// The copy is NOT zeroized; only use this at the boundary of APIs that
    /// cannot accept `SecretBytes`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

/// A private Ed25519 signing key.
///
/// No `Debug` implementation, so keys cannot end up in logs by accident.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Derive a private key deterministically from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    /// Load a private key from raw seed bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::from_seed(&bytes))
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Export the raw seed bytes.
    #[must_use]
    pub fn to_bytes(&self) -> SecretBytes {
        SecretBytes(self.0.to_bytes().to_vec())
    }

    /// Export the private key as PKCS#8 DER, the format rcgen and rustls expect.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::Encoding` if the DER encoder fails.
    pub fn to_pkcs8_der(&self) -> Result<SecretBytes, KeyError> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        let der = self.0.to_pkcs8_der().map_err(|_| KeyError::Encoding)?;
        Ok(SecretBytes(der.as_bytes().to_vec()))
    }

    /// Load a private key from PKCS#8 DER bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` if the bytes are not valid PKCS#8.
    pub fn from_pkcs8_der(bytes: &[u8]) -> Result<Self, KeyError> {
        use ed25519_dalek::pkcs8::DecodePrivateKey;
        let key =
            ed25519_dalek::SigningKey::from_pkcs8_der(bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }

    /// Load a private key produced by `CertificateAuthority::generate_key_pair`.
    ///
    /// Sealed keys need the passphrase they were sealed with; plain keys are
    /// PKCS#8 DER and ignore it.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::PassphraseRequired` for a sealed key without a
    /// passphrase, `KeyError::Decryption` for a wrong one and
    /// `KeyError::InvalidFormat` for anything unparseable.
    pub fn from_stored(bytes: &[u8], passphrase: Option<&str>) -> Result<Self, KeyError> {
        if super::sealed::is_sealed(bytes) {
            let passphrase = passphrase.ok_or(KeyError::PassphraseRequired)?;
            return super::sealed::open(bytes, passphrase);
        }
        Self::from_pkcs8_der(bytes)
    }

    /// The same key as an OpenSSH private key, for signing certificates.
    pub(crate) fn to_ssh_key(&self) -> ssh_key::PrivateKey {
        ssh_key::PrivateKey::from(Ed25519Keypair::from(&self.0))
    }

    /// Encode for storage: sealed under `passphrase` when one is given,
    /// plain PKCS#8 DER otherwise. [`Self::from_stored`] reads either.
    pub fn to_stored(&self, passphrase: Option<&str>) -> Result<SecretBytes, KeyError> {
        match passphrase.filter(|p| !p.is_empty()) {
            Some(passphrase) => super::sealed::seal(self, passphrase),
            None => self.to_pkcs8_der(),
        }
    }
}

/// A public Ed25519 verification key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Load a public key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 32 bytes.
    /// Returns `KeyError::InvalidFormat` if the bytes don't represent a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Verify a signature over a message.
    ///
    /// Uses `verify_strict` to reject weak/small-order keys.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(self)
    }

    pub(crate) fn to_key_data(&self) -> KeyData {
        KeyData::Ed25519(Ed25519PublicKey::from(&self.0))
    }

    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` for any key type other than Ed25519.
    pub(crate) fn from_key_data(key: &KeyData) -> Result<Self, KeyError> {
        let key = key.ed25519().ok_or(KeyError::InvalidFormat)?;
        Self::from_bytes(&key.0)
    }

    /// `ssh-ed25519 AAAA...` line, as it appears in `authorized_keys`.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::Encoding` if the encoder fails.
    pub fn to_openssh(&self) -> Result<String, KeyError> {
        ssh_key::PublicKey::from(self.to_key_data())
            .to_openssh()
            .map_err(|_| KeyError::Encoding)
    }

    /// Parse an `ssh-ed25519 AAAA... [comment]` line.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` for malformed lines or other key types.
    pub fn from_openssh(line: &str) -> Result<Self, KeyError> {
        let key = ssh_key::PublicKey::from_openssh(line.trim()).map_err(|_| KeyError::InvalidFormat)?;
        Self::from_key_data(key.key_data())
    }

    /// Standard base64 encoding of the raw key, as used in config files.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` for malformed base64.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| KeyError::InvalidFormat)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        })?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_bytes();
        write!(
            f,
            "Signature({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// OpenSSH SHA-256 fingerprint of a public key, `SHA256:{base64_no_padding}`.
///
/// Equality is constant-time.
#[derive(Clone, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const PREFIX: &'static str = "SHA256:";

    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(
            public_key
                .to_key_data()
                .fingerprint(HashAlg::Sha256)
                .to_string(),
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(Self::PREFIX).ok_or(KeyError::InvalidFormat)?;
        let hash = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|_| KeyError::InvalidFormat)?;
        if hash.len() != 32 {
            return Err(KeyError::InvalidLength {
                expected: 32,
                actual: hash.len(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_keys_are_deterministic() {
        let a = PrivateKey::from_seed(&[7u8; 32]);
        let b = PrivateKey::from_seed(&[7u8; 32]);
        let c = PrivateKey::from_seed(&[8u8; 32]);

        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_signature_wrong_key_rejected() {
        let key1 = PrivateKey::generate();
        let key2 = PrivateKey::generate();

        let signature = key1.sign(b"hello");

        assert!(key1.public_key().verify(b"hello", &signature));
        assert!(!key2.public_key().verify(b"hello", &signature));
        assert!(!key1.public_key().verify(b"hellO", &signature));
    }

    #[test]
    fn test_public_key_serializes_as_base64_string() {
        let key = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&key).unwrap();

        assert!(json.starts_with('"'));
        let restored: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, key);
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = PrivateKey::generate().public_key().fingerprint();

        assert!(fingerprint.as_str().starts_with("SHA256:"));
        // 7 prefix chars + 43 chars of unpadded base64
        assert_eq!(fingerprint.as_str().len(), 50);

        let parsed: Fingerprint = fingerprint.as_str().parse().unwrap();
        assert_eq!(parsed, fingerprint);
        assert!("MD5:abc".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_fingerprint_matches_ssh_keygen() {
        // ssh-keygen -lf on the public half of the all-sevens seed
        const LINE: &str =
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOpKbGPinFIKvvVQexMuxfmVR3auvr57kkIe6mkURtIs";
        let key = PrivateKey::from_seed(&[7u8; 32]).public_key();

        assert_eq!(
            key.fingerprint().as_str(),
            "SHA256:z/fSv0Z0RZS+Lccbc6ZoOWwt/fbj1VFJGSBKQbo4icE"
        );
        assert!(key.to_openssh().unwrap().starts_with(LINE));
        assert_eq!(PublicKey::from_openssh(&format!("{LINE} node-1")).unwrap(), key);
        assert!(PublicKey::from_openssh("ssh-rsa AAAA").is_err());
    }

    #[test]
    fn test_pkcs8_der_roundtrip() {
        let original = PrivateKey::generate();
        let der = original.to_pkcs8_der().unwrap();
        let restored = PrivateKey::from_pkcs8_der(der.as_bytes()).unwrap();

        assert_eq!(original.public_key(), restored.public_key());
        assert!(PrivateKey::from_pkcs8_der(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }

    #[test]
    fn test_invalid_key_lengths() {
        assert!(PrivateKey::from_bytes(&[0u8; 16]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 64]).is_err());
        assert!(Signature::from_bytes(&[0u8; 32]).is_err());
    }
}
