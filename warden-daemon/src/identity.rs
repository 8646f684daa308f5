//! A host's key, its host certificate and the TLS identity derived from them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use warden_auth::{
    AuthMethod, CertificateAuthority, Certificate, PrivateKey, Role, TrustedAuthorities,
};

use crate::tls::TlsIdentity;

#[derive(Clone)]
pub struct HostIdentity {
    key: Arc<PrivateKey>,
    cert: Certificate,
    tls: TlsIdentity,
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("id", &self.cert.key_id())
            .field("role", &self.cert.role())
            .field("fingerprint", &self.tls.fingerprint)
            .finish()
    }
}

impl HostIdentity {
    /// Pair `key` with a host certificate for it.
    pub fn new(key: Arc<PrivateKey>, cert: Certificate) -> Result<Self> {
        if key.public_key() != *cert.public_key() {
            anyhow::bail!(
                "host certificate for {} does not certify this host's key",
                cert.key_id()
            );
        }
        let tls = TlsIdentity::self_signed(&key, cert.principal())?;
        Ok(Self { key, cert, tls })
    }

    /// Generate a key and have `ca` certify it. A zero `ttl` never expires.
    pub fn issue(
        ca: &CertificateAuthority,
        id: &str,
        hostname: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<Self> {
        let key = Arc::new(PrivateKey::generate());
        let cert = ca
            .generate_host_cert(&key.public_key(), id, hostname, role, ttl)
            .with_context(|| format!("Failed to issue host certificate for {id}"))?;
        Self::new(key, cert)
    }

    pub fn id(&self) -> &str {
        self.cert.key_id()
    }

    pub fn key(&self) -> &Arc<PrivateKey> {
        &self.key
    }

    pub fn cert(&self) -> &Certificate {
        &self.cert
    }

    pub fn tls(&self) -> &TlsIdentity {
        &self.tls
    }

    /// Log in to other Warden services as this host.
    pub fn auth_method(&self) -> AuthMethod {
        AuthMethod::certificate(Arc::clone(&self.key), self.cert.clone())
    }

    /// Act for `role` users on a second hop.
    pub fn delegate(&self, role: Role) -> AuthMethod {
        AuthMethod::delegated(Arc::clone(&self.key), self.cert.clone(), role)
    }
}

/// Host certificate plus the trust roots a host needs before it can reach
/// the auth server. Written by `wardend issue-host-cert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBundle {
    pub cert: Certificate,
    pub trust: TrustedAuthorities,
}

impl HostBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read host bundle {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse host bundle {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write host bundle {}", path.display()))
    }
}

/// Load the host key at `path`, or create it (mode 0600) if missing.
///
/// A non-empty `passphrase` seals a new key and is required to open a
/// sealed one.
pub fn load_or_create_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey> {
    if path.exists() {
        let stored = std::fs::read(path)
            .with_context(|| format!("Failed to read host key {}", path.display()))?;
        return CertificateAuthority::open_private_key(&stored, passphrase)
            .with_context(|| format!("Failed to open host key {}", path.display()));
    }

    let key = PrivateKey::generate();
    let stored = key.to_stored(passphrase)?;
    save_key(path, stored.as_bytes())?;
    info!(path = %path.display(), fingerprint = %key.public_key().fingerprint(), "generated host key");
    Ok(key)
}

/// Write a stored private key (mode 0600), creating parent directories.
pub fn save_key(path: &Path, stored: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_private(path, stored).with_context(|| format!("Failed to write key {}", path.display()))
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca() -> CertificateAuthority {
        let ca = CertificateAuthority::new(Default::default()).unwrap();
        ca.reset_host_certificate_authority(Some([3; 32]));
        ca
    }

    #[test]
    fn test_issue_matches_key() {
        let identity = HostIdentity::issue(&ca(), "n1", "node-1", Role::Node, Duration::ZERO).unwrap();
        assert_eq!(identity.id(), "n1");
        assert_eq!(identity.tls().fingerprint, identity.key().public_key().fingerprint());
    }

    #[test]
    fn test_rejects_foreign_cert() {
        let ca = ca();
        let other = PrivateKey::generate();
        let cert = ca
            .generate_host_cert(&other.public_key(), "n1", "node-1", Role::Node, Duration::ZERO)
            .unwrap();
        assert!(HostIdentity::new(Arc::new(PrivateKey::generate()), cert).is_err());
    }

    #[test]
    fn test_key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.key");

        let created = load_or_create_key(&path, None).unwrap();
        let loaded = load_or_create_key(&path, None).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_sealed_key_needs_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.key");

        let created = load_or_create_key(&path, Some("correct horse")).unwrap();
        assert!(load_or_create_key(&path, None).is_err());
        let opened = load_or_create_key(&path, Some("correct horse")).unwrap();
        assert_eq!(created.public_key(), opened.public_key());
    }
}
