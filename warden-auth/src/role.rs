//! Roles carried by certificates.

use serde::{Deserialize, Serialize};

use crate::cert::CertKind;

/// The closed set of roles a certificate can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full access; valid on both host and user certificates.
    Admin,
    /// Interactive user; may open exec and shell sessions.
    User,
    /// Proxy host; may dial nodes on behalf of authenticated users.
    Proxy,
    /// Node host; serves sessions and heartbeats into the registry.
    Node,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::User, Role::Proxy, Role::Node];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Proxy => "proxy",
            Role::Node => "node",
        }
    }

    /// Whether a certificate of `kind` may carry this role.
    #[must_use]
    pub fn valid_for(self, kind: CertKind) -> bool {
        match kind {
            CertKind::User => matches!(self, Role::Admin | Role::User),
            CertKind::Host => matches!(self, Role::Admin | Role::Proxy | Role::Node),
        }
    }

    #[must_use]
    pub fn can_open_sessions(self) -> bool {
        matches!(self, Role::Admin | Role::User)
    }

    /// Whether a host with this role may vouch for a user on a second hop.
    #[must_use]
    pub fn can_delegate(self) -> bool {
        matches!(self, Role::Admin | Role::Proxy)
    }

    /// Whether a host with this role may hold a reverse tunnel or heartbeat.
    #[must_use]
    pub fn is_host_service(self) -> bool {
        matches!(self, Role::Admin | Role::Proxy | Role::Node)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0:?}")]
pub struct UnknownRole(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_validated_per_certificate_kind() {
        assert!(Role::User.valid_for(CertKind::User));
        assert!(!Role::User.valid_for(CertKind::Host));
        assert!(Role::Node.valid_for(CertKind::Host));
        assert!(!Role::Proxy.valid_for(CertKind::User));
        assert!(Role::Admin.valid_for(CertKind::Host));
        assert!(Role::Admin.valid_for(CertKind::User));
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!("Proxy".parse::<Role>(), Ok(Role::Proxy));
        assert_eq!(" node ".parse::<Role>(), Ok(Role::Node));
        assert!("root".parse::<Role>().is_err());
    }
}
