//! Message-oriented transport underneath a session.
//!
//! A transport is split into a [`MessageSink`] (shared by every writer behind
//! the session's send lock) and a [`MessageSource`] (owned by the dispatcher,
//! the only reader).

pub mod memory;
pub mod websocket;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// One message read from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportMessage {
    /// A binary message carrying one frame.
    Binary(Bytes),
    /// Text, ping, pong or other control traffic.
    Other,
    /// The peer closed the transport.
    Closed {
        /// Close code reported by the peer.
        code: u16,
        /// Close reason reported by the peer.
        reason: String,
    },
}

/// Write half of a transport.
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Send one binary message.
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Send a transport-level keep-alive ping.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the transport.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Local address of the connection, when known.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Read half of a transport.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Wait for the next message in arrival order.
    ///
    /// Returns [`TransportError::Closed`] once no more messages will arrive.
    async fn next_message(&mut self) -> Result<TransportMessage, TransportError>;
}
