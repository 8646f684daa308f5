//! Warden wire protocol.
//!
//! Every connection is TLS. Inside it, messages are JSON documents in
//! length-delimited frames ([`framing`], [`codec`]): first the [`handshake`],
//! then [`session`] requests and responses. A reverse-tunnel control
//! connection switches to binary [`tunnel`] frames after its handshake.

pub mod b64;
pub mod codec;
pub mod framing;
pub mod handshake;
pub mod session;
pub mod tunnel;

pub use codec::{expect_handshake_message, expect_message, recv_message, send_message};
pub use handshake::{AuthClaim, AuthReply, ClientAuth, ServerHello, PROTOCOL_VERSION};
pub use session::{ErrorCode, Request, Response, Route};
pub use tunnel::{MuxError, MuxFrame};
