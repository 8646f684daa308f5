//! Reverse tunnels.
//!
//! A host that cannot be dialed keeps an outbound connection to a proxy's
//! tunnel listener. After the handshake that connection carries a
//! [`mux::MuxSession`]: the server opens streams toward the agent, which
//! dials the requested target locally and pipes bytes both ways.

pub mod agent;
pub mod mux;
pub mod server;

pub use agent::TunnelAgent;
pub use mux::{MuxConfig, MuxSession, MuxStream, OpenError, Side};
pub use server::{TunnelEndpoint, TunnelServer};
