//! The receive loop, the SYN acknowledger and the keep-alive task.
//!
//! The receive loop never waits on the send lock. Anything it has to send goes
//! through a queue to a task that may block on the transport in its place.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::SessionInner;
use crate::frame::Frame;
use crate::stream::{RemoteClose, Stream, StreamShared};
use crate::transport::{MessageSource, TransportMessage};

/// Read the transport until it ends or the session closes.
pub(super) async fn run(inner: Arc<SessionInner>, mut source: Box<dyn MessageSource>) {
    loop {
        let message = tokio::select! {
            biased;
            () = inner.closed.cancelled() => break,
            message = source.next_message() => message,
        };
        match message {
            Ok(TransportMessage::Binary(bytes)) => inner.handle_message(bytes),
            Ok(TransportMessage::Other) => {}
            Ok(TransportMessage::Closed { code, reason }) => {
                inner.handle_transport_close(code, &reason).await;
                break;
            }
            Err(e) => {
                if !inner.closed.is_cancelled() {
                    debug!(error = %e, "transport read ended, closing session");
                }
                let _ = inner.shutdown(true).await;
                break;
            }
        }
    }
    debug!("dispatcher stopped");
}

/// ACK streams the peer opened, in SYN order, then offer them to `accept`.
pub(super) async fn acknowledge(
    inner: Weak<SessionInner>,
    mut pending: mpsc::UnboundedReceiver<Arc<StreamShared>>,
    closed: CancellationToken,
) {
    loop {
        let shared = tokio::select! {
            biased;
            () = closed.cancelled() => return,
            shared = pending.recv() => match shared {
                Some(shared) => shared,
                None => return,
            },
        };
        let Some(session) = inner.upgrade() else {
            return;
        };
        let id = shared.id();
        let ack = Frame::Ack {
            id,
            credit: session.config.initial_capacity,
        };
        if let Err(e) = session.send(&ack).await {
            // send has already torn the session down on a transport failure
            if !e.is_closed() {
                error!(stream_id = id, error = %e, "failed to acknowledge stream");
            }
            return;
        }
        debug!(stream_id = id, "accepted stream");
        session.push_accepted(Stream::new(shared, Weak::clone(&inner)));
    }
}

/// Ping the transport every `interval` until the session closes.
///
/// Holds only a weak reference so an abandoned session is not kept alive.
pub(super) async fn keep_alive(inner: Weak<SessionInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    let _ = ticker.tick().await;
    loop {
        let _ = ticker.tick().await;
        let Some(session) = inner.upgrade() else {
            return;
        };
        if session.closed.is_cancelled() {
            return;
        }
        trace!("sending keep-alive ping");
        if let Err(e) = session.ping().await {
            if !e.is_closed() {
                debug!(error = %e, "keep-alive ping failed");
            }
            return;
        }
    }
}

impl SessionInner {
    fn handle_message(&self, bytes: Bytes) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        trace!(stream_id = frame.stream_id(), kind = ?frame.kind(), "received frame");

        match frame {
            Frame::Syn { id } => self.handle_syn(id),
            Frame::Dat { id, payload } => match self.lookup(id) {
                Some(stream) => stream.push_inbound(&payload),
                None => warn!(stream_id = id, len = payload.len(), "data for unknown stream"),
            },
            Frame::Ack { id, credit } => match self.lookup(id) {
                Some(stream) => {
                    if stream.on_ack(credit) {
                        debug!(stream_id = id, capacity = credit, "stream accepted by peer");
                    }
                }
                None => warn!(stream_id = id, "ack for unknown stream"),
            },
            Frame::Fin { id } => match self.lookup(id) {
                Some(stream) => match stream.set_remote_closed() {
                    RemoteClose::HalfClosed => debug!(stream_id = id, "peer closed its side"),
                    RemoteClose::FullyClosed => self.remove_stream(id),
                    RemoteClose::Duplicate => warn!(stream_id = id, "duplicate fin"),
                },
                None => warn!(stream_id = id, "fin for unknown stream"),
            },
            Frame::Unknown { id, tag } => {
                debug!(stream_id = id, tag, "ignoring frame with unknown type");
            }
        }
    }

    /// Register and accept a peer-opened stream; the ACK is sent by
    /// [`acknowledge`].
    fn handle_syn(&self, id: u32) {
        let shared = {
            let mut table = self.table.lock();
            if self.closed.is_cancelled() {
                return;
            }
            if table.streams.contains_key(&id) {
                warn!(stream_id = id, "duplicate syn");
                return;
            }
            let shared = self.new_stream(id);
            let _ = shared.accept(self.config.initial_capacity);
            let _ = table.streams.insert(id, Arc::clone(&shared));
            shared
        };
        if self.pending_acks.send(shared).is_err() {
            debug!(stream_id = id, "acknowledger gone, session closing");
        }
    }
}
