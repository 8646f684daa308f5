//! Client errors.

use std::io;

use warden_core::AccessError;
use warden_proto::ErrorCode;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// The server's identity could not be verified.
    #[error("untrusted server: {0}")]
    UntrustedHost(String),

    #[error("authentication failed ({code}): {reason}")]
    AuthenticationFailed { code: ErrorCode, reason: String },

    /// The connection ended before the session finished.
    #[error("transport closed mid-session")]
    TransportClosed,

    #[error("unexpected message: {0}")]
    Protocol(String),

    /// The remote command ran but exited non-zero.
    #[error("command exited with status {code}")]
    CommandFailed { code: i32, output: String },

    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error(transparent)]
    Key(#[from] warden_auth::KeyError),
}

impl ClientError {
    pub(crate) fn unexpected(what: impl std::fmt::Debug) -> Self {
        ClientError::Protocol(format!("{what:?}"))
    }

    /// Whether the failure was the connection itself rather than a reply.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::TransportClosed)
    }
}

impl From<ClientError> for AccessError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote {
                code: ErrorCode::PermissionDenied,
                message,
            } => AccessError::Denied(message),
            ClientError::Remote { message, .. } => AccessError::Remote(message),
            ClientError::AuthenticationFailed { reason, .. } => AccessError::Denied(reason),
            other => AccessError::Unavailable(other.to_string()),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
