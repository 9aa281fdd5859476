//! Multiplexing session over one transport connection.
//!
//! A session owns the transport halves. Writers share the sink behind the send
//! lock; the dispatcher task is the only reader of the source and routes each
//! frame to its stream. The dispatcher never takes the send lock, so a writer
//! stuck on a full transport cannot stop inbound frames (and the credit they
//! carry) from being processed.

mod dispatch;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::SessionConfig;
use crate::error::{MuxError, Result};
use crate::frame::Frame;
use crate::stream::{Stream, StreamShared};
use crate::transport::{MessageSink, MessageSource};

/// How long teardown waits for the transport to finish its close handshake.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked after the peer closed the transport.
pub type RemoteCloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Which end of the connection a session is; decides stream ID parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens odd stream IDs starting at 1.
    Client,
    /// Opens even stream IDs starting at 0.
    Server,
}

impl Role {
    /// First stream ID this role opens.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Self::Server => 0,
            Self::Client => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

struct StreamTable {
    streams: HashMap<u32, Arc<StreamShared>>,
    /// `None` once the ID space is used up.
    next_id: Option<u32>,
}

enum Outbound {
    Frame(Bytes),
    Ping,
}

pub(crate) struct SessionInner {
    role: Role,
    config: SessionConfig,
    table: Mutex<StreamTable>,
    /// The send lock.
    sink: tokio::sync::Mutex<Box<dyn MessageSink>>,
    accept_enabled: bool,
    accept_tx: mpsc::Sender<Stream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    /// Peer-opened streams waiting for their ACK.
    pending_acks: mpsc::UnboundedSender<Arc<StreamShared>>,
    closed: CancellationToken,
    /// Cleared when the transport itself reported closure.
    owns_transport: AtomicBool,
    local_addr: Option<SocketAddr>,
    on_remote_close: Option<RemoteCloseCallback>,
}

impl SessionInner {
    fn new_stream(&self, id: u32) -> Arc<StreamShared> {
        StreamShared::new(
            id,
            &self.closed,
            self.config.max_frame_payload,
            self.config.initial_capacity,
        )
    }

    fn lookup(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.table.lock().streams.get(&id).cloned()
    }

    /// Allocate the next local ID and register a stream under it.
    fn register_local(&self) -> Result<Arc<StreamShared>> {
        let mut table = self.table.lock();
        if self.closed.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        let id = table.next_id.ok_or(MuxError::StreamIdsExhausted)?;
        if table.streams.contains_key(&id) {
            return Err(MuxError::DuplicateStream(id));
        }
        table.next_id = id.checked_add(2);
        let shared = self.new_stream(id);
        let _ = table.streams.insert(id, Arc::clone(&shared));
        Ok(shared)
    }

    /// Undo [`register_local`](Self::register_local) after a failed SYN.
    fn rollback_local(&self, id: u32) {
        let mut table = self.table.lock();
        let _ = table.streams.remove(&id);
        if table.next_id == id.checked_add(2) {
            table.next_id = Some(id);
        }
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        if self.table.lock().streams.remove(&id).is_some() {
            debug!(stream_id = id, "stream removed");
        }
    }

    /// Send one frame under the send lock.
    ///
    /// A transport failure tears the session down.
    pub(crate) async fn send(&self, frame: &Frame) -> Result<()> {
        self.transmit(Outbound::Frame(frame.encode())).await?;
        tracing::trace!(stream_id = frame.stream_id(), kind = ?frame.kind(), "sent frame");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.transmit(Outbound::Ping).await
    }

    async fn transmit(&self, outbound: Outbound) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        let result = {
            let mut sink = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(MuxError::SessionClosed),
                sink = self.sink.lock() => sink,
            };
            if self.closed.is_cancelled() {
                return Err(MuxError::SessionClosed);
            }
            // Close aborts a write stuck on a peer that stopped reading.
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(MuxError::SessionClosed),
                result = async {
                    match outbound {
                        Outbound::Frame(bytes) => sink.send_binary(bytes).await,
                        Outbound::Ping => sink.ping().await,
                    }
                } => result,
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "transport write failed, closing session");
            let _ = self.shutdown(true).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Tear the session down exactly once.
    async fn shutdown(&self, close_transport: bool) -> Result<()> {
        let streams = {
            let mut table = self.table.lock();
            if self.closed.is_cancelled() {
                return Err(MuxError::SessionClosed);
            }
            self.closed.cancel();
            std::mem::take(&mut table.streams)
        };
        debug!(role = %self.role, streams = streams.len(), "closing session");

        if close_transport && self.owns_transport.load(Ordering::Acquire) {
            let mut sink = self.sink.lock().await;
            match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "error closing transport"),
                Err(_) => debug!("timed out closing transport"),
            }
        }

        for stream in streams.into_values() {
            stream.force_close();
        }
        Ok(())
    }

    async fn handle_transport_close(&self, code: u16, reason: &str) {
        debug!(code, reason, "transport closed by peer");
        self.owns_transport.store(false, Ordering::Release);
        if self.shutdown(false).await.is_err() {
            return;
        }
        if let Some(callback) = &self.on_remote_close {
            callback();
        }
    }

    fn push_accepted(&self, stream: Stream) {
        if !self.accept_enabled {
            debug!(stream_id = stream.id(), "accept queue disabled, dropping handle");
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(stream)) = self.accept_tx.try_send(stream) {
            debug!(stream_id = stream.id(), "accept queue full, dropping handle");
        }
    }
}

/// Builder for a [`Session`] with optional settings.
pub struct SessionBuilder {
    role: Role,
    config: SessionConfig,
    on_remote_close: Option<RemoteCloseCallback>,
}

impl SessionBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `callback` once the peer has closed the transport and the session
    /// has been torn down.
    #[must_use]
    pub fn on_remote_close(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_remote_close = Some(Arc::new(callback));
        self
    }

    /// Start the session over the given transport halves.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<W, R>(self, sink: W, source: R) -> Session
    where
        W: MessageSink,
        R: MessageSource,
    {
        let config = self.config.normalized();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_size.max(1));
        let (pending_acks, acks_rx) = mpsc::unbounded_channel();
        let local_addr = sink.local_addr();

        let inner = Arc::new(SessionInner {
            role: self.role,
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                next_id: Some(self.role.first_stream_id()),
            }),
            sink: tokio::sync::Mutex::new(Box::new(sink) as Box<dyn MessageSink>),
            accept_enabled: config.accept_queue_size > 0,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            pending_acks,
            closed: CancellationToken::new(),
            owns_transport: AtomicBool::new(true),
            local_addr,
            on_remote_close: self.on_remote_close,
            config,
        });

        let span = info_span!("wsmux_dispatch", role = %self.role);
        drop(tokio::spawn(
            dispatch::run(Arc::clone(&inner), Box::new(source)).instrument(span.clone()),
        ));
        drop(tokio::spawn(
            dispatch::acknowledge(Arc::downgrade(&inner), acks_rx, inner.closed.clone())
                .instrument(span.clone()),
        ));
        if let Some(interval) = inner.config.keep_alive_interval() {
            drop(tokio::spawn(
                dispatch::keep_alive(Arc::downgrade(&inner), interval).instrument(span),
            ));
        }

        debug!(role = %inner.role, ?local_addr, "session started");
        Session { inner }
    }
}

/// A multiplexing session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start configuring a session for `role`.
    pub fn builder(role: Role) -> SessionBuilder {
        SessionBuilder {
            role,
            config: SessionConfig::default(),
            on_remote_close: None,
        }
    }

    /// Start a session with `config` and no remote-close callback.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<W, R>(sink: W, source: R, role: Role, config: SessionConfig) -> Self
    where
        W: MessageSink,
        R: MessageSource,
    {
        Self::builder(role).config(config).spawn(sink, source)
    }

    /// Open a stream and wait for the peer to acknowledge it.
    pub async fn open(&self) -> Result<Stream> {
        let inner = &self.inner;
        let shared = inner.register_local()?;
        let id = shared.id();

        if let Err(e) = inner.send(&Frame::Syn { id }).await {
            inner.rollback_local(id);
            return Err(e);
        }
        debug!(stream_id = id, "sent syn, waiting for ack");

        let deadline = inner.config.stream_accept_deadline();
        tokio::select! {
            biased;
            () = inner.closed.cancelled() => {
                inner.remove_stream(id);
                Err(MuxError::SessionClosed)
            }
            () = shared.wait_accepted() => Ok(Stream::new(shared, Arc::downgrade(inner))),
            () = tokio::time::sleep(deadline) => {
                inner.remove_stream(id);
                debug!(stream_id = id, ?deadline, "stream not accepted in time");
                Err(MuxError::AcceptTimeout(deadline))
            }
        }
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept(&self) -> Result<Stream> {
        let inner = &self.inner;
        let mut rx = tokio::select! {
            biased;
            () = inner.closed.cancelled() => return Err(MuxError::SessionClosed),
            rx = inner.accept_rx.lock() => rx,
        };
        tokio::select! {
            biased;
            () = inner.closed.cancelled() => Err(MuxError::SessionClosed),
            stream = rx.recv() => stream.ok_or(MuxError::SessionClosed),
        }
    }

    /// Close the session, its transport and every stream.
    ///
    /// Returns [`MuxError::SessionClosed`] if already closed.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown(true).await
    }

    /// Resolve once the session is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Whether the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Local address of the transport, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// This session's role.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.inner.table.lock().streams.len()
    }

    /// Whether a stream with `id` is registered.
    pub fn contains_stream(&self, id: u32) -> bool {
        self.inner.table.lock().streams.contains_key(&id)
    }

    #[cfg(test)]
    fn set_next_id(&self, next: Option<u32>) {
        self.inner.table.lock().next_id = next;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
