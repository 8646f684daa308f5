//! Connection authentication.
//!
//! Every endpoint opens with a server [`Challenge`]: a random nonce bound to
//! the server's host key. The client answers with a [`Credential`] produced
//! by its [`AuthMethod`]:
//!
//! - a user or host certificate plus a signature over the challenge,
//! - a proxy's host certificate vouching for an already-verified user, or
//! - a password and one-time code, checked by the certificate authority.
//!
//! [`verify_certificate`] and [`verify_delegated`] turn the first two into a
//! [`VerifiedIdentity`]; password logins go through
//! `CertificateAuthority::authenticate_password`.

mod challenge;
mod error;
mod method;
mod verify;

pub use challenge::{Challenge, ProofKind};
pub use error::AuthnError;
pub use method::{AuthMethod, Credential};
pub use verify::{verify_certificate, verify_delegated, IdentitySource, VerifiedIdentity};
