//! A single multiplexed byte stream.
//!
//! Each direction closes independently: [`Stream::close_write`] sends FIN and
//! keeps the read side open, [`Stream::close`] closes both. The peer's FIN
//! turns reads into end-of-stream once the buffer drains.
//!
//! [`Stream`] also implements Tokio's `AsyncRead` and `AsyncWrite`, with
//! `poll_shutdown` as [`Stream::close_write`], so it plugs into `tokio::io`
//! helpers, codecs and tunnels.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, ReusableBoxFuture};
use tracing::{debug, trace, warn};

use crate::error::{MuxError, Result};
use crate::frame::Frame;
use crate::session::SessionInner;

/// Outcome of a FIN received from the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RemoteClose {
    /// The peer's direction is closed, ours is still open.
    HalfClosed,
    /// Both directions are now closed.
    FullyClosed,
    /// The peer had already sent FIN.
    Duplicate,
}

#[derive(Default)]
struct StreamState {
    inbound: BytesMut,
    remote_capacity: u64,
    accepted: bool,
    remote_closed: bool,
    write_closed: bool,
    read_closed: bool,
}

/// State shared between a stream's handles and the session dispatcher.
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
    accepted: Notify,
    /// Cancelled once the stream is fully closed; child of the session token.
    done: CancellationToken,
    session_closed: CancellationToken,
    write_lock: tokio::sync::Mutex<()>,
    max_frame_payload: usize,
    local_capacity: usize,
}

impl StreamShared {
    pub(crate) fn new(
        id: u32,
        session_closed: &CancellationToken,
        max_frame_payload: usize,
        local_capacity: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(StreamState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            accepted: Notify::new(),
            done: session_closed.child_token(),
            session_closed: session_closed.clone(),
            write_lock: tokio::sync::Mutex::new(()),
            max_frame_payload: max_frame_payload.max(1),
            local_capacity: local_capacity as usize,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Fire the accepted signal with the peer's initial credit.
    ///
    /// Returns `false` if the stream was already accepted.
    pub(crate) fn accept(&self, capacity: u32) -> bool {
        {
            let mut st = self.state.lock();
            if st.accepted {
                return false;
            }
            st.accepted = true;
            st.remote_capacity = u64::from(capacity);
        }
        self.accepted.notify_waiters();
        self.writable.notify_waiters();
        true
    }

    pub(crate) fn is_accepted(&self) -> bool {
        self.state.lock().accepted
    }

    pub(crate) async fn wait_accepted(&self) {
        loop {
            let notified = self.accepted.notified();
            if self.is_accepted() {
                return;
            }
            notified.await;
        }
    }

    /// Apply an ACK: the first accepts the stream, later ones add credit.
    ///
    /// Returns `true` if this ACK accepted the stream.
    pub(crate) fn on_ack(&self, credit: u32) -> bool {
        if self.accept(credit) {
            return true;
        }
        {
            let mut st = self.state.lock();
            st.remote_capacity = st.remote_capacity.saturating_add(u64::from(credit));
        }
        self.writable.notify_waiters();
        false
    }

    /// Append payload received from the peer.
    pub(crate) fn push_inbound(&self, payload: &[u8]) {
        {
            let mut st = self.state.lock();
            if st.read_closed {
                trace!(stream_id = self.id, len = payload.len(), "discarding data for closed stream");
                return;
            }
            if st.remote_closed {
                warn!(stream_id = self.id, len = payload.len(), "received data after fin");
                return;
            }
            st.inbound.extend_from_slice(payload);
            if st.inbound.len() > self.local_capacity {
                warn!(
                    stream_id = self.id,
                    buffered = st.inbound.len(),
                    capacity = self.local_capacity,
                    "peer exceeded granted credit"
                );
            }
        }
        self.readable.notify_waiters();
    }

    /// Record the peer's FIN.
    pub(crate) fn set_remote_closed(&self) -> RemoteClose {
        let outcome = {
            let mut st = self.state.lock();
            if st.remote_closed {
                return RemoteClose::Duplicate;
            }
            st.remote_closed = true;
            if st.write_closed {
                RemoteClose::FullyClosed
            } else {
                RemoteClose::HalfClosed
            }
        };
        self.readable.notify_waiters();
        if outcome == RemoteClose::FullyClosed {
            self.done.cancel();
        }
        outcome
    }

    /// Close the stream because its session is going away.
    pub(crate) fn force_close(&self) {
        self.state.lock().write_closed = true;
        self.done.cancel();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn closed_error(&self) -> MuxError {
        if self.session_closed.is_cancelled() {
            MuxError::SessionClosed
        } else {
            MuxError::StreamClosed { id: self.id }
        }
    }
}

/// Handle to one logical stream within a [`Session`](crate::Session).
///
/// Handles are cheap to clone; all clones refer to the same stream, so one task
/// may read while another writes. Each clone keeps its own `AsyncRead` /
/// `AsyncWrite` state, so give each task its own clone when using those.
///
/// Dropping every handle does not close the stream: it stays registered and
/// the peer may keep writing to it until [`close`](Self::close) is called or
/// the session ends. Streams whose handle the accept queue dropped behave the
/// same way.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Weak<SessionInner>,
    io: IoState,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.shared), Weak::clone(&self.session))
    }
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Weak<SessionInner>) -> Self {
        Self {
            shared,
            session,
            io: IoState::default(),
        }
    }

    /// Stream ID; odd for client-opened streams, even for server-opened ones.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Bytes this side may still send before the peer grants more credit.
    pub fn remote_capacity(&self) -> u64 {
        self.shared.state.lock().remote_capacity
    }

    /// Whether the peer has sent FIN.
    pub fn is_remote_closed(&self) -> bool {
        self.shared.state.lock().remote_closed
    }

    /// Read buffered bytes into `buf`, waiting while none are available.
    ///
    /// Returns `Ok(0)` at end of stream (the peer sent FIN and the buffer is
    /// drained). Every successful read grants the peer the consumed bytes as
    /// new credit.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Take up to `max` buffered bytes; empty at end of stream.
    async fn read_chunk(&self, max: usize) -> Result<Bytes> {
        let (chunk, grant) = loop {
            let notified = self.shared.readable.notified();
            {
                let mut st = self.shared.state.lock();
                if st.read_closed {
                    return Err(self.shared.closed_error());
                }
                if !st.inbound.is_empty() {
                    let n = max.min(st.inbound.len());
                    let remote_closed = st.remote_closed;
                    break (st.inbound.split_to(n).freeze(), !remote_closed);
                }
                if st.remote_closed {
                    return Ok(Bytes::new());
                }
                if self.shared.session_closed.is_cancelled() {
                    return Err(MuxError::SessionClosed);
                }
            }
            tokio::select! {
                () = notified => {}
                () = self.shared.done.cancelled() => {}
            }
        };
        if grant {
            self.grant_credit(chunk.len()).await;
        }
        Ok(chunk)
    }

    /// Read until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write all of `data`, waiting for credit from the peer as needed.
    ///
    /// Data is split into DAT frames no larger than the available credit or the
    /// session's maximum payload. Concurrent writes on one stream do not
    /// interleave.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let _serial = self.shared.write_lock.lock().await;
        let mut sent = 0;
        while sent < data.len() {
            let notified = self.shared.writable.notified();
            let grant = {
                let mut st = self.shared.state.lock();
                if self.shared.session_closed.is_cancelled() {
                    return Err(MuxError::SessionClosed);
                }
                if st.write_closed {
                    return Err(MuxError::StreamClosed { id: self.shared.id });
                }
                let remaining = data.len() - sent;
                let grant = remaining
                    .min(self.shared.max_frame_payload)
                    .min(usize::try_from(st.remote_capacity).unwrap_or(usize::MAX));
                st.remote_capacity -= grant as u64;
                grant
            };
            if grant == 0 {
                trace!(stream_id = self.shared.id, "waiting for credit");
                tokio::select! {
                    () = notified => {}
                    () = self.shared.done.cancelled() => {}
                }
                continue;
            }
            let session = self.session.upgrade().ok_or(MuxError::SessionClosed)?;
            let payload = Bytes::copy_from_slice(&data[sent..sent + grant]);
            session
                .send(&Frame::Dat {
                    id: self.shared.id,
                    payload,
                })
                .await?;
            sent += grant;
        }
        Ok(sent)
    }

    /// Half-close: send FIN and stop writing, keep reading.
    ///
    /// Closing an already closed write side is a no-op.
    pub async fn close_write(&self) -> Result<()> {
        let fully_closed = {
            let mut st = self.shared.state.lock();
            if st.write_closed {
                return Ok(());
            }
            st.write_closed = true;
            st.remote_closed
        };
        self.shared.writable.notify_waiters();
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        self.send_fin(&session).await;
        if fully_closed {
            session.remove_stream(self.shared.id);
            self.shared.done.cancel();
        }
        Ok(())
    }

    /// Close both directions and deregister the stream.
    ///
    /// Buffered input is discarded. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let send_fin = {
            let mut st = self.shared.state.lock();
            if st.read_closed {
                return Ok(());
            }
            st.read_closed = true;
            st.inbound.clear();
            let send_fin = !st.write_closed;
            st.write_closed = true;
            send_fin
        };
        self.shared.done.cancel();
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        if send_fin {
            self.send_fin(&session).await;
        }
        session.remove_stream(self.shared.id);
        debug!(stream_id = self.shared.id, "stream closed");
        Ok(())
    }

    async fn send_fin(&self, session: &SessionInner) {
        // Wait out an in-flight DAT so FIN is the last frame of this direction.
        let _serial = self.shared.write_lock.lock().await;
        if let Err(e) = session.send(&Frame::Fin { id: self.shared.id }).await {
            debug!(stream_id = self.shared.id, error = %e, "failed to send fin");
        }
    }

    async fn grant_credit(&self, n: usize) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let credit = u32::try_from(n).unwrap_or(u32::MAX);
        if let Err(e) = session
            .send(&Frame::Ack {
                id: self.shared.id,
                credit,
            })
            .await
        {
            debug!(stream_id = self.shared.id, error = %e, "failed to send credit update");
        }
    }
}

/// In-flight operations of one handle's `AsyncRead` / `AsyncWrite` impls.
#[derive(Default)]
struct IoState {
    /// Bytes already taken from the stream but not yet handed to a caller.
    unread: Bytes,
    read: Option<ReusableBoxFuture<'static, Result<Bytes>>>,
    reading: bool,
    write: Option<ReusableBoxFuture<'static, Result<usize>>>,
    write_op: WriteOp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum WriteOp {
    #[default]
    Idle,
    Write,
    Shutdown,
}

fn start<T, F>(slot: &mut Option<ReusableBoxFuture<'static, T>>, fut: F)
where
    F: Future<Output = T> + Send + 'static,
{
    match slot {
        Some(op) => op.set(fut),
        None => *slot = Some(ReusableBoxFuture::new(fut)),
    }
}

impl Stream {
    /// Drive the pending write or shutdown; the slot is idle afterwards.
    fn poll_write_op(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize>> {
        let Some(op) = self.io.write.as_mut() else {
            self.io.write_op = WriteOp::Idle;
            return Poll::Ready(Ok(0));
        };
        let result = ready!(op.poll(cx));
        self.io.write_op = WriteOp::Idle;
        Poll::Ready(result)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.io.unread.is_empty() {
            if !this.io.reading {
                let stream = this.clone();
                let max = buf.remaining();
                start(&mut this.io.read, async move { stream.read_chunk(max).await });
                this.io.reading = true;
            }
            let Some(op) = this.io.read.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            let result = ready!(op.poll(cx));
            this.io.reading = false;
            this.io.unread = result?;
        }
        // still empty here means end of stream
        let n = buf.remaining().min(this.io.unread.len());
        buf.put_slice(&this.io.unread.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    /// Sends at most one frame's worth of `buf` per call.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.io.write_op {
                WriteOp::Idle => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let len = buf.len().min(this.shared.max_frame_payload);
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let stream = this.clone();
                    start(&mut this.io.write, async move { stream.write(&data).await });
                    this.io.write_op = WriteOp::Write;
                }
                WriteOp::Write => return this.poll_write_op(cx).map_err(io::Error::from),
                WriteOp::Shutdown => {
                    let _ = ready!(this.poll_write_op(cx))?;
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.io.write_op != WriteOp::Idle {
            let _ = ready!(this.poll_write_op(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.io.write_op {
                WriteOp::Idle => {
                    let stream = this.clone();
                    start(&mut this.io.write, async move {
                        stream.close_write().await.map(|()| 0)
                    });
                    this.io.write_op = WriteOp::Shutdown;
                }
                WriteOp::Write => {
                    let _ = ready!(this.poll_write_op(cx))?;
                }
                WriteOp::Shutdown => {
                    let _ = ready!(this.poll_write_op(cx))?;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
