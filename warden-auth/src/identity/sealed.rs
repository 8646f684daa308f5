//! Passphrase sealing for private keys at rest.
//!
//! Layout: `MAGIC(8) || salt(16) || nonce(24) || XChaCha20-Poly1305(pkcs8_der)`.
//! The encryption key is derived from the passphrase with Argon2id.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::keys::{KeyError, PrivateKey, SecretBytes};

const MAGIC: &[u8; 8] = b"WDNKEY1\x00";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

pub(crate) fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() > HEADER_LEN && bytes.starts_with(MAGIC)
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    // OWASP interactive minimums: 19 MiB, 2 passes
    let params =
        Params::new(19 * 1024, 2, 1, Some(KEY_LEN)).map_err(|_| KeyError::Encoding)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|_| KeyError::Encoding)?;
    Ok(key)
}

/// Encrypt a private key under a passphrase.
pub(crate) fn seal(key: &PrivateKey, passphrase: &str) -> Result<SecretBytes, KeyError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let kek = derive_key(passphrase, &salt)?;
    let cipher = XChaCha20Poly1305::new_from_slice(kek.as_ref()).map_err(|_| KeyError::Encoding)?;
    let der = key.to_pkcs8_der()?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), der.as_bytes())
        .map_err(|_| KeyError::Encoding)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(SecretBytes::new(out))
}

/// Decrypt a key produced by [`seal`].
pub(crate) fn open(bytes: &[u8], passphrase: &str) -> Result<PrivateKey, KeyError> {
    if !is_sealed(bytes) {
        return Err(KeyError::InvalidFormat);
    }
    let (salt, rest) = bytes[MAGIC.len()..].split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let kek = derive_key(passphrase, salt)?;
    let cipher = XChaCha20Poly1305::new_from_slice(kek.as_ref()).map_err(|_| KeyError::Encoding)?;
    let der = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyError::Decryption)?,
    );
    PrivateKey::from_pkcs8_der(&der)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let key = PrivateKey::generate();
        let sealed = seal(&key, "correct horse").unwrap();

        assert!(is_sealed(&sealed));
        let opened = open(&sealed, "correct horse").unwrap();
        assert_eq!(opened.public_key(), key.public_key());
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let key = PrivateKey::generate();
        let sealed = seal(&key, "correct horse").unwrap();

        assert_eq!(
            open(&sealed, "battery staple").err(),
            Some(KeyError::Decryption)
        );
    }

    #[test]
    fn test_from_stored_requires_passphrase_for_sealed_keys() {
        let key = PrivateKey::generate();
        let sealed = seal(&key, "pw").unwrap();
        let plain = key.to_pkcs8_der().unwrap();

        assert_eq!(
            PrivateKey::from_stored(&sealed, None).err(),
            Some(KeyError::PassphraseRequired)
        );
        assert!(PrivateKey::from_stored(&plain, None).is_ok());
        assert!(PrivateKey::from_stored(&sealed, Some("pw")).is_ok());
    }
}
