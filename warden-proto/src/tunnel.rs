//! Reverse-tunnel multiplexing frames.
//!
//! After an agent authenticates, the control connection carries only
//! [`MuxFrame`]s, each inside one length-delimited frame:
//!
//! | Field   | Size | Description               |
//! |---------|------|---------------------------|
//! | type    | 1    | Frame type                |
//! | stream  | 4    | u32 BE, 0 for ping/pong   |
//! | payload | var  | Type-specific             |
//!
//! Payloads: `Ping`/`Pong` carry a u64 BE sequence number, `Open` the UTF-8
//! dial target, `OpenErr` a UTF-8 reason, `Data` raw bytes, `Window` a u32 BE
//! credit. The rest are empty.
//!
//! Stream IDs opened by the server are odd, those opened by the agent even.

use bytes::{BufMut, Bytes, BytesMut};

/// Initial per-stream send window in bytes.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Largest `Data` payload a sender puts in one frame.
pub const MAX_DATA_FRAME: usize = 32 * 1024;

const HEADER_LEN: usize = 5;

/// Largest encoded frame a peer may send; longer frames end the session.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_DATA_FRAME;

const TYPE_PING: u8 = 0x01;
const TYPE_PONG: u8 = 0x02;
const TYPE_OPEN: u8 = 0x10;
const TYPE_OPEN_OK: u8 = 0x11;
const TYPE_OPEN_ERR: u8 = 0x12;
const TYPE_DATA: u8 = 0x20;
const TYPE_WINDOW: u8 = 0x21;
const TYPE_FIN: u8 = 0x22;
const TYPE_RESET: u8 = 0x23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    Ping { seq: u64 },
    Pong { seq: u64 },
    Open { stream: u32, target: String },
    OpenOk { stream: u32 },
    OpenErr { stream: u32, reason: String },
    Data { stream: u32, data: Bytes },
    /// Return `credit` bytes of send window to the peer.
    Window { stream: u32, credit: u32 },
    /// No more data from the sender on this stream.
    Fin { stream: u32 },
    /// Abort the stream in both directions.
    Reset { stream: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("truncated mux frame")]
    Truncated,

    #[error("unknown mux frame type {0:#04x}")]
    UnknownType(u8),

    #[error("mux frame text is not UTF-8")]
    InvalidUtf8,
}

impl MuxFrame {
    pub fn stream(&self) -> u32 {
        match self {
            MuxFrame::Ping { .. } | MuxFrame::Pong { .. } => 0,
            MuxFrame::Open { stream, .. }
            | MuxFrame::OpenOk { stream }
            | MuxFrame::OpenErr { stream, .. }
            | MuxFrame::Data { stream, .. }
            | MuxFrame::Window { stream, .. }
            | MuxFrame::Fin { stream }
            | MuxFrame::Reset { stream } => *stream,
        }
    }

    pub fn encode(&self) -> Bytes {
        let (kind, payload_len) = match self {
            MuxFrame::Ping { .. } => (TYPE_PING, 8),
            MuxFrame::Pong { .. } => (TYPE_PONG, 8),
            MuxFrame::Open { target, .. } => (TYPE_OPEN, target.len()),
            MuxFrame::OpenOk { .. } => (TYPE_OPEN_OK, 0),
            MuxFrame::OpenErr { reason, .. } => (TYPE_OPEN_ERR, reason.len()),
            MuxFrame::Data { data, .. } => (TYPE_DATA, data.len()),
            MuxFrame::Window { .. } => (TYPE_WINDOW, 4),
            MuxFrame::Fin { .. } => (TYPE_FIN, 0),
            MuxFrame::Reset { .. } => (TYPE_RESET, 0),
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u8(kind);
        buf.put_u32(self.stream());
        match self {
            MuxFrame::Ping { seq } | MuxFrame::Pong { seq } => buf.put_u64(*seq),
            MuxFrame::Open { target, .. } => buf.put_slice(target.as_bytes()),
            MuxFrame::OpenErr { reason, .. } => buf.put_slice(reason.as_bytes()),
            MuxFrame::Data { data, .. } => buf.put_slice(data),
            MuxFrame::Window { credit, .. } => buf.put_u32(*credit),
            MuxFrame::OpenOk { .. } | MuxFrame::Fin { .. } | MuxFrame::Reset { .. } => {}
        }
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, MuxError> {
        if frame.len() < HEADER_LEN {
            return Err(MuxError::Truncated);
        }
        let kind = frame[0];
        let stream = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let payload = frame.split_off(HEADER_LEN);

        let text = |payload: Bytes| {
            String::from_utf8(payload.to_vec()).map_err(|_| MuxError::InvalidUtf8)
        };
        let seq = |payload: &Bytes| -> Result<u64, MuxError> {
            let bytes: [u8; 8] = payload[..].try_into().map_err(|_| MuxError::Truncated)?;
            Ok(u64::from_be_bytes(bytes))
        };

        Ok(match kind {
            TYPE_PING => MuxFrame::Ping { seq: seq(&payload)? },
            TYPE_PONG => MuxFrame::Pong { seq: seq(&payload)? },
            TYPE_OPEN => MuxFrame::Open {
                stream,
                target: text(payload)?,
            },
            TYPE_OPEN_OK => MuxFrame::OpenOk { stream },
            TYPE_OPEN_ERR => MuxFrame::OpenErr {
                stream,
                reason: text(payload)?,
            },
            TYPE_DATA => MuxFrame::Data {
                stream,
                data: payload,
            },
            TYPE_WINDOW => {
                let bytes: [u8; 4] = payload[..].try_into().map_err(|_| MuxError::Truncated)?;
                MuxFrame::Window {
                    stream,
                    credit: u32::from_be_bytes(bytes),
                }
            }
            TYPE_FIN => MuxFrame::Fin { stream },
            TYPE_RESET => MuxFrame::Reset { stream },
            other => return Err(MuxError::UnknownType(other)),
        })
    }
}
