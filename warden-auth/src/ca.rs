//! The certificate authority.
//!
//! One [`CertificateAuthority`] value owns both signing keys (host CA and
//! user CA), the serial counter and the password/OTP records of every user.
//! It is shared by `Arc` between the auth server, the proxy and tests; there
//! is no process-global CA state.
//!
//! # One-time passwords
//!
//! Each user has an HOTP secret and the counter of the next code the CA
//! expects. [`CertificateAuthority::check_password`] accepts the code for
//! that counter or for one of the next `otp_lookahead` counters, then moves
//! the counter past it. The check and the advance happen under the user's
//! map entry lock, so two concurrent submissions of one code cannot both
//! succeed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::authn::{AuthMethod, IdentitySource, VerifiedIdentity};
use crate::cert::{CertError, CertKind, CertTemplate, Certificate};
use crate::identity::{KeyError, PrivateKey, PublicKey, SecretBytes};
use crate::otp;
use crate::password::{PasswordCost, PasswordError, PasswordHasher};
use crate::role::Role;
use crate::trust::TrustedAuthorities;

/// Codes for this many counters behind the current one are reported as
/// replays instead of plain mismatches.
const REPLAY_WINDOW: u64 = 10;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaError {
    /// The signing key for this kind has never been generated.
    #[error("{0} certificate authority is not initialized")]
    NotInitialized(CertKind),

    /// Unknown user, wrong password or rejected certificate.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Password matched but the one-time code did not.
    #[error("invalid one-time password")]
    InvalidOtp,

    /// The code belongs to a counter that was already consumed.
    #[error("one-time password already used")]
    ReplayedOtp,

    #[error("role {role} is not allowed on {kind} certificates")]
    InvalidRole { role: Role, kind: CertKind },

    #[error("invalid username {0:?}")]
    InvalidUsername(String),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error("corrupt authority state: {0}")]
    CorruptState(&'static str),
}

/// Tunables for a [`CertificateAuthority`].
#[derive(Debug, Clone, Copy)]
pub struct CaConfig {
    /// How many counters past the expected one a submitted code may be.
    pub otp_lookahead: u64,
    /// Argon2id cost for stored password hashes.
    pub password: PasswordCost,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            otp_lookahead: 10,
            password: PasswordCost::default(),
        }
    }
}

struct UserRecord {
    password_hash: String,
    otp_secret: SecretBytes,
    /// Counter of the next code that will be accepted.
    otp_counter: u64,
    role: Role,
}

/// Issues and verifies host and user certificates.
pub struct CertificateAuthority {
    config: CaConfig,
    hasher: PasswordHasher,
    host_key: ArcSwapOption<PrivateKey>,
    user_key: ArcSwapOption<PrivateKey>,
    next_serial: AtomicU64,
    users: DashMap<String, UserRecord>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("host_ca", &self.host_ca_public_key())
            .field("user_ca", &self.user_ca_public_key())
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create an authority with no signing keys.
    ///
    /// Every issuing operation fails with [`CaError::NotInitialized`] until
    /// the matching `reset_*_certificate_authority` has run.
    ///
    /// # Errors
    ///
    /// Fails if the password cost parameters are out of range.
    pub fn new(config: CaConfig) -> Result<Self, CaError> {
        Ok(Self {
            hasher: PasswordHasher::new(config.password)?,
            config,
            host_key: ArcSwapOption::empty(),
            user_key: ArcSwapOption::empty(),
            next_serial: AtomicU64::new(1),
            users: DashMap::new(),
        })
    }

    /// Replace the host CA signing key. Certificates signed by the previous
    /// key stop verifying.
    pub fn reset_host_certificate_authority(&self, seed: Option<[u8; 32]>) -> PublicKey {
        Self::reset(&self.host_key, seed)
    }

    /// Replace the user CA signing key. Certificates signed by the previous
    /// key stop verifying.
    pub fn reset_user_certificate_authority(&self, seed: Option<[u8; 32]>) -> PublicKey {
        Self::reset(&self.user_key, seed)
    }

    fn reset(slot: &ArcSwapOption<PrivateKey>, seed: Option<[u8; 32]>) -> PublicKey {
        let key = seed.map_or_else(PrivateKey::generate, |seed| PrivateKey::from_seed(&seed));
        let public_key = key.public_key();
        slot.store(Some(Arc::new(key)));
        public_key
    }

    #[must_use]
    pub fn host_ca_public_key(&self) -> Option<PublicKey> {
        self.host_key.load().as_ref().map(|key| key.public_key())
    }

    #[must_use]
    pub fn user_ca_public_key(&self) -> Option<PublicKey> {
        self.user_key.load().as_ref().map(|key| key.public_key())
    }

    /// Current trust roots, for handing to routers and clients.
    #[must_use]
    pub fn trusted_authorities(&self) -> TrustedAuthorities {
        TrustedAuthorities {
            host: self.host_ca_public_key().into_iter().collect(),
            user: self.user_ca_public_key().into_iter().collect(),
        }
    }

    /// Generate a fresh host keypair.
    ///
    /// The private half comes back as PKCS#8 DER, or sealed under
    /// `passphrase` when one is given. [`Self::open_private_key`] reads
    /// either form.
    ///
    /// # Errors
    ///
    /// Fails only if encoding or sealing the key fails.
    pub fn generate_key_pair(
        &self,
        passphrase: Option<&str>,
    ) -> Result<(SecretBytes, PublicKey), CaError> {
        let key = PrivateKey::generate();
        let stored = key.to_stored(passphrase)?;
        Ok((stored, key.public_key()))
    }

    /// Load a private key returned by [`Self::generate_key_pair`].
    ///
    /// # Errors
    ///
    /// See [`PrivateKey::from_stored`].
    pub fn open_private_key(stored: &[u8], passphrase: Option<&str>) -> Result<PrivateKey, CaError> {
        Ok(PrivateKey::from_stored(stored, passphrase.filter(|p| !p.is_empty()))?)
    }

    /// Sign a host certificate. A zero `ttl` never expires.
    ///
    /// # Errors
    ///
    /// `NotInitialized` without a host CA, `InvalidRole` for user-only roles.
    pub fn generate_host_cert(
        &self,
        public_key: &PublicKey,
        id: &str,
        hostname: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<Certificate, CaError> {
        self.issue(CertKind::Host, public_key, id, hostname, role, ttl)
    }

    /// Sign a user certificate. A zero `ttl` never expires.
    ///
    /// # Errors
    ///
    /// `NotInitialized` without a user CA, `InvalidRole` for host-only roles.
    pub fn generate_user_cert(
        &self,
        public_key: &PublicKey,
        username: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<Certificate, CaError> {
        self.issue(CertKind::User, public_key, username, username, role, ttl)
    }

    fn issue(
        &self,
        kind: CertKind,
        public_key: &PublicKey,
        key_id: &str,
        principal: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<Certificate, CaError> {
        let slot = match kind {
            CertKind::Host => &self.host_key,
            CertKind::User => &self.user_key,
        };
        let authority = slot.load_full().ok_or(CaError::NotInitialized(kind))?;
        if !role.valid_for(kind) {
            return Err(CaError::InvalidRole { role, kind });
        }

        let template = CertTemplate {
            kind,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            key_id,
            principal,
            role,
            public_key,
            ttl_secs: ttl.as_secs(),
        };
        Ok(Certificate::issue(&authority, template, crate::unix_now())?)
    }

    /// # Errors
    ///
    /// `NotInitialized` without a host CA, otherwise the verification error.
    pub fn verify_host_cert(&self, cert: &Certificate, now: i64) -> Result<(), CaError> {
        let key = self
            .host_ca_public_key()
            .ok_or(CaError::NotInitialized(CertKind::Host))?;
        Ok(cert.verify(&key, CertKind::Host, now)?)
    }

    /// # Errors
    ///
    /// `NotInitialized` without a user CA, otherwise the verification error.
    pub fn verify_user_cert(&self, cert: &Certificate, now: i64) -> Result<(), CaError> {
        let key = self
            .user_ca_public_key()
            .ok_or(CaError::NotInitialized(CertKind::User))?;
        Ok(cert.verify(&key, CertKind::User, now)?)
    }

    /// Set a user's password and provision a new HOTP secret.
    ///
    /// Returns the `otpauth://` enrollment URL and the raw secret. The OTP
    /// counter restarts at zero; an existing user keeps their role, a new
    /// one gets [`Role::User`].
    ///
    /// # Errors
    ///
    /// Fails for an empty username or if hashing fails.
    pub fn upsert_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(String, SecretBytes), CaError> {
        if user.is_empty() || user.len() > usize::from(u16::MAX) {
            return Err(CaError::InvalidUsername(user.to_string()));
        }
        let password_hash = self.hasher.hash(password)?;
        let secret = otp::generate_secret();
        let url = otp::enrollment_url(user, secret.as_bytes(), 0);

        let record = SecretBytes::new(secret.to_vec());
        self.users
            .entry(user.to_string())
            .and_modify(|existing| {
                existing.password_hash = password_hash.clone();
                existing.otp_secret = SecretBytes::new(secret.to_vec());
                existing.otp_counter = 0;
            })
            .or_insert_with(|| UserRecord {
                password_hash: password_hash.clone(),
                otp_secret: record,
                otp_counter: 0,
                role: Role::User,
            });
        Ok((url, secret))
    }

    /// Change the role a user's certificates are issued with.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` for an unknown user, `InvalidRole` for a
    /// host-only role.
    pub fn set_user_role(&self, user: &str, role: Role) -> Result<(), CaError> {
        if !role.valid_for(CertKind::User) {
            return Err(CaError::InvalidRole {
                role,
                kind: CertKind::User,
            });
        }
        let mut record = self
            .users
            .get_mut(user)
            .ok_or(CaError::AuthenticationFailed)?;
        record.role = role;
        Ok(())
    }

    /// Check a password and the next one-time code, consuming the code.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` for an unknown user or wrong password,
    /// `ReplayedOtp` for a code that was already used, `InvalidOtp` for any
    /// other wrong code.
    pub fn check_password(&self, user: &str, password: &str, otp_code: &str) -> Result<(), CaError> {
        self.check_password_role(user, password, otp_code).map(|_| ())
    }

    /// [`Self::check_password`], returning the identity the login grants.
    ///
    /// # Errors
    ///
    /// See [`Self::check_password`].
    pub fn authenticate_password(
        &self,
        user: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<VerifiedIdentity, CaError> {
        let role = self.check_password_role(user, password, otp_code)?;
        Ok(VerifiedIdentity::new(user, role, IdentitySource::Password))
    }

    fn check_password_role(&self, user: &str, password: &str, otp_code: &str) -> Result<Role, CaError> {
        // Argon2 runs without holding the entry lock.
        let password_hash = self
            .users
            .get(user)
            .map(|record| record.password_hash.clone())
            .ok_or(CaError::AuthenticationFailed)?;
        if !self.hasher.verify(password, &password_hash) {
            return Err(CaError::AuthenticationFailed);
        }

        let mut record = self
            .users
            .get_mut(user)
            .ok_or(CaError::AuthenticationFailed)?;
        if record.password_hash != password_hash {
            // Password changed while we were hashing.
            return Err(CaError::AuthenticationFailed);
        }

        let submitted = otp_code.trim().as_bytes();
        let current = record.otp_counter;
        for counter in current..=current.saturating_add(self.config.otp_lookahead) {
            let expected = otp::hotp(record.otp_secret.as_bytes(), counter);
            if bool::from(expected.as_bytes().ct_eq(submitted)) {
                record.otp_counter = counter.saturating_add(1);
                return Ok(record.role);
            }
        }
        for counter in current.saturating_sub(REPLAY_WINDOW)..current {
            let expected = otp::hotp(record.otp_secret.as_bytes(), counter);
            if bool::from(expected.as_bytes().ct_eq(submitted)) {
                return Err(CaError::ReplayedOtp);
            }
        }
        Err(CaError::InvalidOtp)
    }

    /// Validate a password login and turn it into a certificate-backed
    /// client auth method.
    ///
    /// A fresh key is generated and certified for `ttl`; the OTP secret never
    /// leaves the authority.
    ///
    /// # Errors
    ///
    /// Any [`Self::check_password`] error, or `NotInitialized` without a
    /// user CA.
    pub fn new_web_password_auth(
        &self,
        user: &str,
        password: &str,
        otp_code: &str,
        ttl: Duration,
    ) -> Result<AuthMethod, CaError> {
        let identity = self.authenticate_password(user, password, otp_code)?;
        let key = PrivateKey::generate();
        let cert = self.generate_user_cert(&key.public_key(), user, identity.role(), ttl)?;
        Ok(AuthMethod::certificate(Arc::new(key), cert))
    }

    /// Snapshot everything needed to rebuild this authority.
    ///
    /// The snapshot contains the CA signing keys in the clear.
    #[must_use]
    pub fn export_state(&self) -> CaState {
        let encode_key = |slot: &ArcSwapOption<PrivateKey>| {
            slot.load()
                .as_ref()
                .map(|key| STANDARD.encode(key.to_bytes().as_bytes()))
        };
        let users = self
            .users
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    StoredUser {
                        password_hash: entry.password_hash.clone(),
                        otp_secret: STANDARD.encode(entry.otp_secret.as_bytes()),
                        otp_counter: entry.otp_counter,
                        role: entry.role,
                    },
                )
            })
            .collect();
        CaState {
            host_ca: encode_key(&self.host_key),
            user_ca: encode_key(&self.user_key),
            next_serial: self.next_serial.load(Ordering::Relaxed),
            users,
        }
    }

    /// Replace keys, serial and users with a snapshot from [`Self::export_state`].
    ///
    /// # Errors
    ///
    /// Fails without modifying anything if the snapshot does not decode.
    pub fn import_state(&self, state: &CaState) -> Result<(), CaError> {
        let decode_key = |encoded: &Option<String>| -> Result<Option<PrivateKey>, CaError> {
            encoded
                .as_deref()
                .map(|encoded| {
                    let bytes = SecretBytes::new(
                        STANDARD
                            .decode(encoded)
                            .map_err(|_| CaError::CorruptState("signing key"))?,
                    );
                    Ok(PrivateKey::from_bytes(bytes.as_bytes())?)
                })
                .transpose()
        };
        let host = decode_key(&state.host_ca)?;
        let user = decode_key(&state.user_ca)?;

        let mut users = Vec::with_capacity(state.users.len());
        for (name, stored) in &state.users {
            let secret = STANDARD
                .decode(&stored.otp_secret)
                .map_err(|_| CaError::CorruptState("otp secret"))?;
            users.push((
                name.clone(),
                UserRecord {
                    password_hash: stored.password_hash.clone(),
                    otp_secret: SecretBytes::new(secret),
                    otp_counter: stored.otp_counter,
                    role: stored.role,
                },
            ));
        }

        self.host_key.store(host.map(Arc::new));
        self.user_key.store(user.map(Arc::new));
        self.next_serial
            .fetch_max(state.next_serial, Ordering::Relaxed);
        self.users.clear();
        for (name, record) in users {
            self.users.insert(name, record);
        }
        Ok(())
    }
}

/// Serializable snapshot of a [`CertificateAuthority`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CaState {
    #[serde(default)]
    pub host_ca: Option<String>,
    #[serde(default)]
    pub user_ca: Option<String>,
    #[serde(default)]
    pub next_serial: u64,
    #[serde(default)]
    pub users: BTreeMap<String, StoredUser>,
}

impl std::fmt::Debug for CaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaState")
            .field("host_ca", &self.host_ca.as_ref().map(|_| "[REDACTED]"))
            .field("user_ca", &self.user_ca.as_ref().map(|_| "[REDACTED]"))
            .field("next_serial", &self.next_serial)
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredUser {
    pub password_hash: String,
    pub otp_secret: String,
    pub otp_counter: u64,
    pub role: Role,
}
