//! Type-erased byte streams.
//!
//! A session can run over a TLS socket, over a reverse-tunnel stream, or
//! over a proxy relay; everything above the transport works on [`BoxedIo`].

use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

pub type BoxedIo = Box<dyn AsyncReadWrite>;
