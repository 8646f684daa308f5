//! The saved login: user certificate, session key and trust roots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use warden_auth::{AuthMethod, Certificate, PrivateKey, TrustedAuthorities};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user: String,
    pub auth_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_addr: Option<String>,
    pub trust: TrustedAuthorities,
    pub cert: Certificate,
}

impl Profile {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(dir.join("warden").join("profile.toml"))
    }

    fn key_path(path: &Path) -> PathBuf {
        path.with_extension("key")
    }

    pub fn load(path: &Path) -> Result<(Self, Arc<PrivateKey>)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Not logged in (no profile at {})", path.display()))?;
        let profile: Profile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse profile at {}", path.display()))?;

        let key_path = Self::key_path(path);
        let der = std::fs::read(&key_path)
            .with_context(|| format!("Failed to read key at {}", key_path.display()))?;
        let key = PrivateKey::from_pkcs8_der(&der).context("Invalid session key")?;
        if key.public_key() != *profile.cert.public_key() {
            anyhow::bail!("Session key does not match the saved certificate; log in again");
        }
        Ok((profile, Arc::new(key)))
    }

    pub fn save(&self, path: &Path, key: &PrivateKey) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize profile")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write profile to {}", path.display()))?;

        let key_path = Self::key_path(path);
        let der = key.to_pkcs8_der().context("Failed to encode session key")?;
        write_private(&key_path, der.as_bytes())
            .with_context(|| format!("Failed to write key to {}", key_path.display()))?;
        Ok(())
    }

    pub fn auth_method(&self, key: Arc<PrivateKey>) -> AuthMethod {
        AuthMethod::certificate(key, self.cert.clone())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}
