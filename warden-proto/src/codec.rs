//! JSON messages over length-delimited frames.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::framing::{read_frame, read_frame_limited, write_frame, MAX_HANDSHAKE_FRAME_SIZE};

pub async fn send_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &data).await
}

/// Receive one message; `Ok(None)` on a clean close.
pub async fn recv_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    decode(read_frame(reader).await?)
}

fn decode<T: DeserializeOwned>(frame: Option<bytes::Bytes>) -> io::Result<Option<T>> {
    match frame {
        Some(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}

/// Receive one message, treating a clean close as an error.
pub async fn expect_message<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    recv_message(reader).await?.ok_or_else(closed)
}

/// [`expect_message`] for messages exchanged before authentication, capped
/// at [`MAX_HANDSHAKE_FRAME_SIZE`].
pub async fn expect_handshake_message<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    decode(read_frame_limited(reader, MAX_HANDSHAKE_FRAME_SIZE).await?)?.ok_or_else(closed)
}
