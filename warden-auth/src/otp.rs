//! Counter-based one-time passwords (HOTP, RFC 4226) with HMAC-SHA1.
//!
//! SHA1 is what RFC 4226 specifies and what authenticator apps implement
//! for `otpauth://hotp` keys.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use url::Url;

use crate::identity::SecretBytes;

type HmacSha1 = Hmac<Sha1>;

/// Number of digits in a code.
pub const OTP_DIGITS: u32 = 6;

/// Length of a freshly provisioned secret.
pub const OTP_SECRET_LEN: usize = 20;

const ISSUER: &str = "Warden";

/// Generate a random HOTP secret.
#[must_use]
pub fn generate_secret() -> SecretBytes {
    let mut secret = vec![0u8; OTP_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    SecretBytes::new(secret)
}

/// Compute the code for `counter`.
#[must_use]
pub fn hotp(secret: &[u8], counter: u64) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(OTP_DIGITS);
    format!("{:0width$}", code, width = OTP_DIGITS as usize)
}

/// Build the `otpauth://hotp/...` key URI used to enroll an authenticator.
#[must_use]
pub fn enrollment_url(user: &str, secret: &[u8], counter: u64) -> String {
    let mut url = match Url::parse("otpauth://hotp/") {
        Ok(url) => url,
        Err(_) => return String::new(),
    };
    if let Ok(mut path) = url.path_segments_mut() {
        path.clear().push(&format!("{ISSUER}:{user}"));
    }
    url.query_pairs_mut()
        .append_pair("secret", &base32_encode(secret))
        .append_pair("issuer", ISSUER)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &OTP_DIGITS.to_string())
        .append_pair("counter", &counter.to_string());
    url.into()
}

/// RFC 4648 base32, upper case, no padding.
#[must_use]
pub fn base32_encode(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data)
}

/// Inverse of [`base32_encode`]; accepts lower case and ignores padding.
#[must_use]
pub fn base32_decode(encoded: &str) -> Option<Vec<u8>> {
    let normalized = encoded.trim().trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD.decode(normalized.as_bytes()).ok()
}

/// Pull the base32 `secret` parameter out of an enrollment URL.
#[must_use]
pub fn secret_from_url(url: &str) -> Option<Vec<u8>> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == "secret")
        .and_then(|(_, value)| base32_decode(&value))
}
