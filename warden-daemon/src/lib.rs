//! # Warden Daemon
//!
//! Every server-side Warden role, usable as a library and started by the
//! `wardend` binary from a TOML config file.
//!
//! ## Modules
//!
//! - [`authserver`] - CA and registry RPCs, password logins
//! - [`router`] - Node sessions and proxy routing
//! - [`reversetunnel`] - Tunnel agent, tunnel server and the stream mux
//! - [`registry`] - Heartbeat-fed node catalog
//! - [`labels`] / [`heartbeat`] - Command-label evaluation and node announcements
//! - [`handshake`] - Server side of the connection handshake
//! - [`listener`] / [`tls`] - TLS accept loops and host TLS identities
//! - [`backend`] - Key-value storage (memory, SQLite)
//! - [`service`] / [`config`] - Role wiring and the config file

pub mod access_point;
pub mod audit;
pub mod authserver;
pub mod backend;
pub mod config;
pub mod handshake;
pub mod heartbeat;
pub mod identity;
pub mod labels;
pub mod listener;
pub mod rate_limit;
pub mod registry;
pub mod reversetunnel;
pub mod router;
pub mod service;
pub mod tls;

pub use config::Config;
pub use service::{Running, Service};
