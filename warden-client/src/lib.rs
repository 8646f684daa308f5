//! Warden client library.
//!
//! ```no_run
//! # async fn demo(trust: warden_client::HostTrust, method: warden_auth::AuthMethod)
//! # -> Result<(), warden_client::ClientError> {
//! let mut node = warden_client::connect_to_node("127.0.0.1:3022", &trust, "alice", &method).await?;
//! assert_eq!(node.run("expr 3 + 5").await?, "8\n");
//!
//! let mut proxy = warden_client::connect_to_proxy("127.0.0.1:3023", &trust, "alice", &method).await?;
//! for node in proxy.find_servers("role", "db-primary").await? {
//!     println!("{} {}", node.id, node.addr);
//! }
//! # Ok(())
//! # }
//! ```

pub mod conn;
pub mod error;
pub mod io;
pub mod node;
pub mod proxy;
pub mod tls;
pub mod tunclient;

pub use conn::{Connection, HostTrust};
pub use error::ClientError;
pub use io::BoxedIo;
pub use node::{NodeClient, Shell};
pub use proxy::{connect_to_node, connect_to_proxy, ProxyClient};
pub use tunclient::TunnelClient;
