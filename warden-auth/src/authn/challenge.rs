//! Server challenge and the canonical message clients sign.

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;
use crate::role::Role;

/// Magic preamble for handshake signatures.
const AUTH_MAGIC: &[u8; 16] = b"WARDEN-AUTH\x00\x00\x00\x00\x00";

const AUTH_VERSION_V1: u8 = 0x01;

/// How the client is proving its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofKind {
    Certificate,
    Delegated,
}

impl ProofKind {
    fn tag(self) -> u8 {
        match self {
            ProofKind::Certificate => 0x01,
            ProofKind::Delegated => 0x02,
        }
    }
}

/// A random nonce bound to the server's host key.
///
/// Binding the host key stops a malicious server from replaying a client's
/// signature to a different server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: [u8; 32],
    pub server_key: PublicKey,
}

impl Challenge {
    #[must_use]
    pub fn generate(server_key: PublicKey) -> Self {
        Self {
            nonce: rand::random::<[u8; 32]>(),
            server_key,
        }
    }

    /// Build the message a client signs to answer this challenge.
    ///
    /// Wire format:
    ///
    /// | Field      | Size | Description                         |
    /// |------------|------|-------------------------------------|
    /// | magic      | 16   | `WARDEN-AUTH` padded with zeros     |
    /// | version    | 1    | 0x01                                |
    /// | nonce      | 32   | Server nonce                        |
    /// | server_key | 32   | Server host key                     |
    /// | kind       | 1    | 0x01 certificate, 0x02 delegated    |
    /// | signer     | 32   | Key that produces the signature     |
    /// | user_len   | 2    | u16 BE                              |
    /// | user       | var  | UTF-8 login                         |
    /// | role_len   | 1    | 0 when no role is claimed           |
    /// | role       | var  | Claimed role name                   |
    #[must_use]
    pub fn signing_message(
        &self,
        kind: ProofKind,
        signer: &PublicKey,
        user: &str,
        role: Option<Role>,
    ) -> Vec<u8> {
        // Handshake framing caps logins well below u16::MAX.
        let user_len = u16::try_from(user.len()).unwrap_or(u16::MAX);
        let role_name = role.map(Role::as_str).unwrap_or("").as_bytes();

        let mut msg = Vec::with_capacity(128 + user.len());
        msg.extend_from_slice(AUTH_MAGIC);
        msg.push(AUTH_VERSION_V1);
        msg.extend_from_slice(&self.nonce);
        msg.extend_from_slice(&self.server_key.to_bytes());
        msg.push(kind.tag());
        msg.extend_from_slice(&signer.to_bytes());
        msg.extend_from_slice(&user_len.to_be_bytes());
        msg.extend_from_slice(user.as_bytes());
        msg.push(role_name.len() as u8);
        msg.extend_from_slice(role_name);
        msg
    }
}
