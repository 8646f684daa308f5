//! Stream multiplexing over one tunnel connection.
//!
//! A [`MuxSession`] runs three tasks: a reader that dispatches inbound
//! frames to per-stream buffers, a writer that serializes outbound frames,
//! and a keep-alive that pings the peer and tears the session down when it
//! goes silent. Each [`MuxStream`] has a send window; the reader never
//! blocks on a slow stream because the peer cannot send past the window.
//! A peer that does is reset: inbound data per stream is capped at
//! [`INITIAL_WINDOW`] unacknowledged bytes in a bounded queue.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSemaphore};
use tracing::{debug, trace, warn};
use warden_proto::framing::{read_frame_limited, write_frame};
use warden_proto::tunnel::{INITIAL_WINDOW, MAX_DATA_FRAME, MAX_FRAME_LEN};
use warden_proto::MuxFrame;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How long [`MuxSession::open`] waits for the peer's answer.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Incoming opens not yet picked up by the owner.
const ACCEPT_BACKLOG: usize = 64;

/// Queued inbound frames per stream. Peers writing frames smaller than
/// 64 bytes into a stalled stream run out of queue before window.
const INBOUND_FRAMES: usize = INITIAL_WINDOW as usize / 64;

/// Consumed bytes are returned to the peer in batches of this size.
const WINDOW_UPDATE_THRESHOLD: u32 = MAX_DATA_FRAME as u32;

/// Which end of the tunnel this is; decides stream ID parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opens odd stream IDs.
    Server,
    /// Opens even stream IDs.
    Agent,
}

impl Side {
    fn first_stream(self) -> u32 {
        match self {
            Side::Server => 1,
            Side::Agent => 2,
        }
    }

    /// Whether `stream` was opened by the other side.
    fn is_peer_stream(self, stream: u32) -> bool {
        stream != 0 && (stream % 2 == 1) != (self == Side::Server)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    pub keepalive_interval: Duration,
    /// Silence longer than this ends the session.
    pub keepalive_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::with_interval(DEFAULT_KEEPALIVE_INTERVAL)
    }
}

impl MuxConfig {
    /// Ping every `interval`, give up after three silent intervals.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            keepalive_interval: interval,
            keepalive_timeout: interval * 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("tunnel session closed")]
    Closed,

    #[error("peer refused stream: {0}")]
    Rejected(String),

    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),
}

struct StreamSlot {
    /// Inbound data; `None` once the peer sent `Fin`.
    data: Option<mpsc::Sender<Bytes>>,
    /// Send window.
    credit: Arc<Semaphore>,
    inbound: Arc<InboundState>,
}

/// Receive side of a stream, shared by the stream and the reader task.
#[derive(Default)]
struct InboundState {
    /// Bytes received and not yet returned to the peer as window.
    outstanding: AtomicU32,
    /// Set when the stream ends abnormally; readers see it after the
    /// queued data.
    reset: OnceLock<io::ErrorKind>,
}

enum Delivery {
    Queued,
    Overflow,
    NoStream,
}

struct Shared {
    side: Side,
    out: mpsc::UnboundedSender<MuxFrame>,
    streams: DashMap<u32, StreamSlot>,
    pending: DashMap<u32, oneshot::Sender<Result<(), String>>>,
    next_stream: AtomicU32,
    closed: CancellationToken,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last inbound frame.
    last_seen: AtomicU64,
}

impl Shared {
    fn send(&self, frame: MuxFrame) -> io::Result<()> {
        self.out
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel session closed"))
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen.store(elapsed, Ordering::Relaxed);
    }

    fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn new_stream(self: &Arc<Self>, id: u32) -> MuxStream {
        let (tx, rx) = mpsc::channel(INBOUND_FRAMES);
        let credit = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
        let inbound = Arc::new(InboundState::default());
        self.streams.insert(
            id,
            StreamSlot {
                data: Some(tx),
                credit: Arc::clone(&credit),
                inbound: Arc::clone(&inbound),
            },
        );
        MuxStream {
            id,
            shared: Arc::clone(self),
            data: rx,
            inbound,
            read_buf: Bytes::new(),
            unacked: 0,
            credit: PollSemaphore::new(credit),
            read_done: false,
            write_done: false,
        }
    }

    fn reset_stream(&self, id: u32, kind: io::ErrorKind) {
        if let Some((_, slot)) = self.streams.remove(&id) {
            let _ = slot.inbound.reset.set(kind);
            slot.credit.close();
        }
        if let Some((_, pending)) = self.pending.remove(&id) {
            let _ = pending.send(Err("stream reset".into()));
        }
    }

    /// End every stream and pending open.
    fn teardown(&self) {
        self.closed.cancel();
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.reset_stream(id, io::ErrorKind::ConnectionAborted);
        }
        self.pending.clear();
    }
}

/// One end of a multiplexed tunnel connection. Cheap to clone.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("side", &self.shared.side)
            .field("streams", &self.shared.streams.len())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl MuxSession {
    /// Take over `io` and start the session tasks.
    ///
    /// Streams the peer opens arrive on the returned receiver, which closes
    /// when the session ends.
    pub fn start<S>(
        io: S,
        side: Side,
        config: MuxConfig,
    ) -> (Self, mpsc::Receiver<IncomingStream>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shared = Arc::new(Shared {
            side,
            out: out_tx,
            streams: DashMap::new(),
            pending: DashMap::new(),
            next_stream: AtomicU32::new(side.first_stream()),
            closed: CancellationToken::new(),
            epoch: Instant::now(),
            last_seen: AtomicU64::new(0),
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(writer, out_rx, shared.closed.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), incoming_tx));
        tokio::spawn(keepalive_loop(Arc::clone(&shared), config));

        (Self { shared }, incoming_rx)
    }

    /// Ask the peer to open a stream to `target`.
    pub async fn open(&self, target: &str) -> Result<MuxStream, OpenError> {
        let shared = &self.shared;
        if shared.closed.is_cancelled() {
            return Err(OpenError::Closed);
        }

        let id = shared.next_stream.fetch_add(2, Ordering::Relaxed);
        let mut stream = shared.new_stream(id);
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id, tx);
        // Teardown may have run between the check above and the inserts.
        if shared.closed.is_cancelled() {
            stream.finish();
            shared.pending.remove(&id);
            return Err(OpenError::Closed);
        }

        shared
            .send(MuxFrame::Open {
                stream: id,
                target: target.to_string(),
            })
            .map_err(|_| OpenError::Closed)?;
        trace!(stream = id, %target, "open sent");

        match tokio::time::timeout(OPEN_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(stream),
            Ok(Ok(Err(reason))) => {
                stream.finish();
                Err(OpenError::Rejected(reason))
            }
            Ok(Err(_)) => Err(OpenError::Closed),
            Err(_) => {
                shared.pending.remove(&id);
                Err(OpenError::Timeout(OPEN_TIMEOUT))
            }
        }
    }

    /// Tear the session down; every stream ends with an error.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Streams currently open in either direction.
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }
}

/// A stream the peer asked to open. Dropping it refuses the stream.
pub struct IncomingStream {
    stream: MuxStream,
    target: String,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("stream", &self.stream.id)
            .field("target", &self.target)
            .finish()
    }
}

impl IncomingStream {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn accept(self) -> io::Result<MuxStream> {
        self.stream
            .shared
            .send(MuxFrame::OpenOk {
                stream: self.stream.id,
            })?;
        Ok(self.stream)
    }

    pub fn reject(mut self, reason: &str) {
        let _ = self.stream.shared.send(MuxFrame::OpenErr {
            stream: self.stream.id,
            reason: reason.to_string(),
        });
        self.stream.finish();
    }
}

/// One logical byte stream inside a [`MuxSession`].
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    data: mpsc::Receiver<Bytes>,
    inbound: Arc<InboundState>,
    read_buf: Bytes,
    /// Bytes consumed but not yet returned to the peer.
    unacked: u32,
    credit: PollSemaphore,
    read_done: bool,
    write_done: bool,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("read_done", &self.read_done)
            .field("write_done", &self.write_done)
            .finish_non_exhaustive()
    }
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Forget the stream locally without telling the peer.
    fn finish(&mut self) {
        self.read_done = true;
        self.write_done = true;
        self.shared.streams.remove(&self.id);
    }

    fn consumed(&mut self, n: usize) {
        self.unacked = self.unacked.saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
        if self.unacked >= WINDOW_UPDATE_THRESHOLD {
            let credit = std::mem::take(&mut self.unacked);
            // Before the frame goes out, so data the peer sends against
            // this credit is never counted as overflow.
            self.inbound.outstanding.fetch_sub(credit, Ordering::AcqRel);
            let _ = self.shared.send(MuxFrame::Window {
                stream: self.id,
                credit,
            });
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                self.consumed(n);
                return Poll::Ready(Ok(()));
            }
            if self.read_done {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.data.poll_recv(cx)) {
                Some(data) => self.read_buf = data,
                None => {
                    self.read_done = true;
                    return Poll::Ready(match self.inbound.reset.get() {
                        Some(kind) => Err(io::Error::new(*kind, "stream reset")),
                        None => Ok(()),
                    });
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_done {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = buf.len().min(MAX_DATA_FRAME);
        let permits = u32::try_from(len).unwrap_or(u32::MAX);
        match ready!(self.credit.poll_acquire_many(cx, permits)) {
            Some(permit) => permit.forget(),
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )))
            }
        }

        self.shared.send(MuxFrame::Data {
            stream: self.id,
            data: Bytes::copy_from_slice(&buf[..len]),
        })?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.write_done {
            self.write_done = true;
            let id = self.id;
            self.shared.send(MuxFrame::Fin { stream: id })?;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !(self.read_done && self.write_done) && !self.shared.closed.is_cancelled() {
            let _ = self.shared.send(MuxFrame::Reset { stream: self.id });
        }
        self.shared.streams.remove(&self.id);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<MuxFrame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = write_frame(&mut writer, &frame.encode()).await {
            debug!(error = %e, "tunnel write failed");
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, incoming: mpsc::Sender<IncomingStream>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame_limited(&mut reader, MAX_FRAME_LEN) => frame,
            _ = shared.closed.cancelled() => break,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("tunnel closed by peer");
                break;
            }
            Err(e) => {
                debug!(error = %e, "tunnel read failed");
                break;
            }
        };
        shared.touch();

        match MuxFrame::decode(frame) {
            Ok(frame) => dispatch(&shared, &incoming, frame),
            Err(e) => {
                warn!(error = %e, "malformed tunnel frame, closing session");
                break;
            }
        }
    }
    shared.teardown();
}

fn dispatch(shared: &Arc<Shared>, incoming: &mpsc::Sender<IncomingStream>, frame: MuxFrame) {
    match frame {
        MuxFrame::Ping { seq } => {
            let _ = shared.send(MuxFrame::Pong { seq });
        }
        MuxFrame::Pong { .. } => {}
        MuxFrame::Open { stream, target } => {
            if !shared.side.is_peer_stream(stream) || shared.streams.contains_key(&stream) {
                warn!(stream, "peer opened an invalid stream ID");
                let _ = shared.send(MuxFrame::Reset { stream });
                return;
            }
            let request = IncomingStream {
                stream: shared.new_stream(stream),
                target,
            };
            if let Err(e) = incoming.try_send(request) {
                let refused = match e {
                    mpsc::error::TrySendError::Full(refused)
                    | mpsc::error::TrySendError::Closed(refused) => refused,
                };
                refused.reject("not accepting streams");
            }
        }
        MuxFrame::OpenOk { stream } => {
            if let Some((_, pending)) = shared.pending.remove(&stream) {
                let _ = pending.send(Ok(()));
            }
        }
        MuxFrame::OpenErr { stream, reason } => {
            if let Some((_, pending)) = shared.pending.remove(&stream) {
                let _ = pending.send(Err(reason));
            }
        }
        MuxFrame::Data { stream, data } => match deliver(shared, stream, data) {
            Delivery::Queued => {}
            Delivery::Overflow => {
                warn!(stream, "peer overran the receive window, resetting stream");
                let _ = shared.send(MuxFrame::Reset { stream });
                shared.reset_stream(stream, io::ErrorKind::InvalidData);
            }
            Delivery::NoStream => {
                trace!(stream, "data for unknown or finished stream");
                let _ = shared.send(MuxFrame::Reset { stream });
            }
        },
        MuxFrame::Window { stream, credit } => {
            if let Some(slot) = shared.streams.get(&stream) {
                slot.credit.add_permits(credit as usize);
            }
        }
        MuxFrame::Fin { stream } => {
            if let Some(mut slot) = shared.streams.get_mut(&stream) {
                slot.data = None;
            }
        }
        MuxFrame::Reset { stream } => shared.reset_stream(stream, io::ErrorKind::ConnectionReset),
    }
}

fn deliver(shared: &Shared, stream: u32, data: Bytes) -> Delivery {
    let Some(slot) = shared.streams.get(&stream) else {
        return Delivery::NoStream;
    };
    let Some(tx) = &slot.data else {
        return Delivery::NoStream;
    };
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    let outstanding = slot
        .inbound
        .outstanding
        .fetch_add(len, Ordering::AcqRel)
        .saturating_add(len);
    if outstanding > INITIAL_WINDOW {
        return Delivery::Overflow;
    }
    match tx.try_send(data) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoStream,
    }
}

async fn keepalive_loop(shared: Arc<Shared>, config: MuxConfig) {
    let mut ticker = tokio::time::interval(config.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.closed.cancelled() => return,
        }
        let silence = shared.silence();
        if silence > config.keepalive_timeout {
            warn!(?silence, "tunnel peer unresponsive, closing session");
            shared.teardown();
            return;
        }
        seq = seq.wrapping_add(1);
        if shared.send(MuxFrame::Ping { seq }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn pair(config: MuxConfig) -> (
        MuxSession,
        mpsc::Receiver<IncomingStream>,
        MuxSession,
        mpsc::Receiver<IncomingStream>,
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (server, server_incoming) = MuxSession::start(a, Side::Server, config);
        let (agent, agent_incoming) = MuxSession::start(b, Side::Agent, config);
        (server, server_incoming, agent, agent_incoming)
    }

    #[test]
    fn test_stream_parity() {
        assert!(Side::Server.is_peer_stream(2));
        assert!(!Side::Server.is_peer_stream(1));
        assert!(Side::Agent.is_peer_stream(1));
        assert!(!Side::Agent.is_peer_stream(0));
    }

    #[tokio::test]
    async fn test_open_and_echo() {
        let (server, _si, _agent, mut incoming) = pair(MuxConfig::default());

        tokio::spawn(async move {
            let request = incoming.recv().await.unwrap();
            assert_eq!(request.target(), "127.0.0.1:3022");
            let mut stream = request.accept().unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = server.open("127.0.0.1:3022").await.unwrap();
        assert_eq!(stream.id() % 2, 1);
        stream.write_all(b"ping over tunnel").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ping over tunnel");
    }

    #[tokio::test]
    async fn test_rejected_open() {
        let (server, _si, _agent, mut incoming) = pair(MuxConfig::default());
        tokio::spawn(async move {
            let request = incoming.recv().await.unwrap();
            request.reject("connection refused");
        });

        assert_eq!(
            server.open("127.0.0.1:1").await.unwrap_err(),
            OpenError::Rejected("connection refused".into())
        );
    }

    #[tokio::test]
    async fn test_large_transfer_respects_window() {
        let (server, _si, _agent, mut incoming) = pair(MuxConfig::default());
        let payload: Vec<u8> = (0..INITIAL_WINDOW as usize * 4).map(|i| i as u8).collect();
        let expected = payload.clone();

        let reader = tokio::spawn(async move {
            let mut stream = incoming.recv().await.unwrap().accept().unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = server.open("sink").await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (server, _si, _agent, mut incoming) = pair(MuxConfig::default());

        let first_open = tokio::spawn({
            let server = server.clone();
            async move { server.open("a").await.unwrap() }
        });
        // Accepted but never read.
        let _first = incoming.recv().await.unwrap().accept().unwrap();
        let mut stalled = first_open.await.unwrap();

        let second_open = tokio::spawn({
            let server = server.clone();
            async move { server.open("b").await.unwrap() }
        });
        let mut second = incoming.recv().await.unwrap().accept().unwrap();
        let mut opened = second_open.await.unwrap();

        stalled
            .write_all(&vec![0u8; INITIAL_WINDOW as usize])
            .await
            .unwrap();
        opened.write_all(b"still moving").await.unwrap();
        let mut buf = [0u8; 12];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still moving");
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let (server, _si, agent, mut incoming) = pair(MuxConfig::default());

        let accepted = tokio::spawn(async move { incoming.recv().await.unwrap().accept().unwrap() });
        let mut stream = server.open("x").await.unwrap();
        let mut remote = accepted.await.unwrap();

        server.close();
        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).await.is_err());
        tokio::time::timeout(Duration::from_secs(5), agent.closed())
            .await
            .unwrap();
        assert!(remote.read(&mut buf).await.is_err());
        assert_eq!(server.open("y").await.unwrap_err(), OpenError::Closed);
    }

    #[tokio::test]
    async fn test_peer_overrunning_window_is_reset() {
        use warden_proto::framing::{read_frame, write_frame};

        // Raw frames on one end, a real session on the other.
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_agent, mut incoming) = MuxSession::start(a, Side::Agent, MuxConfig::default());
        let (mut peer_rx, mut peer_tx) = tokio::io::split(b);

        let open = MuxFrame::Open {
            stream: 1,
            target: "sink".into(),
        };
        write_frame(&mut peer_tx, &open.encode()).await.unwrap();
        // Accepted but never read, so no window comes back.
        let mut stream = incoming.recv().await.unwrap().accept().unwrap();

        let chunk = Bytes::from(vec![0x5a; MAX_DATA_FRAME]);
        let frames = INITIAL_WINDOW as usize / MAX_DATA_FRAME + 1;
        let writer = tokio::spawn(async move {
            for _ in 0..frames {
                let data = MuxFrame::Data {
                    stream: 1,
                    data: chunk.clone(),
                };
                if write_frame(&mut peer_tx, &data.encode()).await.is_err() {
                    break;
                }
            }
            peer_tx
        });

        let reset = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = read_frame(&mut peer_rx).await.unwrap().unwrap();
                if let MuxFrame::Reset { stream } = MuxFrame::decode(frame).unwrap() {
                    break stream;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reset, 1);
        let _peer_tx = writer.await.unwrap();

        let mut buf = Vec::new();
        let err = stream.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(buf.len(), INITIAL_WINDOW as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (a, _b) = tokio::io::duplex(1024);
        let (session, _incoming) =
            MuxSession::start(a, Side::Server, MuxConfig::with_interval(Duration::from_secs(1)));

        tokio::time::timeout(Duration::from_secs(10), session.closed())
            .await
            .unwrap();
        assert!(session.is_closed());
    }
}
