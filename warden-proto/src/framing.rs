//! Length-delimited message framing.
//!
//! Wire format: 4-byte big-endian length prefix followed by payload.
//!
//! Payloads are read as they arrive rather than into a buffer sized from
//! the length prefix, so a peer cannot make us allocate memory it never
//! sends.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame size before the peer has authenticated (64 KB).
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound on the buffer reserved up front for one frame.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Read one frame of at most [`MAX_FRAME_SIZE`] bytes.
///
/// Returns `Ok(None)` when the peer closed cleanly between frames. A close in
/// the middle of a frame is `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    read_frame_limited(reader, MAX_FRAME_SIZE).await
}

/// Read one frame, rejecting a length prefix above `max` with `InvalidData`.
pub async fn read_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (limit {max})"),
        ));
    }

    let mut buf = Vec::with_capacity(len.min(INITIAL_CAPACITY));
    (&mut *reader).take(len as u64).read_to_end(&mut buf).await?;
    if buf.len() < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(Some(Bytes::from(buf)))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", data.len()),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
