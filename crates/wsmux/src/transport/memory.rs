//! In-process transport built on bounded channels.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{MessageSink, MessageSource, TransportMessage};
use crate::error::TransportError;

/// Close code sent when a memory endpoint is closed.
const NORMAL_CLOSURE: u16 = 1000;

/// Write half of an in-process transport.
pub struct MemorySink {
    tx: Option<mpsc::Sender<TransportMessage>>,
}

/// Read half of an in-process transport.
pub struct MemorySource {
    rx: mpsc::Receiver<TransportMessage>,
}

/// One end of an in-process connection.
pub type Endpoint = (MemorySink, MemorySource);

/// Create two connected endpoints, each buffering up to `capacity` messages.
pub fn pair(capacity: usize) -> (Endpoint, Endpoint) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (MemorySink { tx: Some(a_tx) }, MemorySource { rx: a_rx }),
        (MemorySink { tx: Some(b_tx) }, MemorySource { rx: b_rx }),
    )
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(TransportMessage::Binary(payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // A full queue skips the notice; dropping the sender still ends the peer.
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(TransportMessage::Closed {
                code: NORMAL_CLOSURE,
                reason: String::new(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_message(&mut self) -> Result<TransportMessage, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_in_order() {
        let ((mut a_sink, _a_source), (_b_sink, mut b_source)) = pair(4);
        a_sink.send_binary(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send_binary(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(
            b_source.next_message().await.unwrap(),
            TransportMessage::Binary(Bytes::from_static(b"one"))
        );
        assert_eq!(
            b_source.next_message().await.unwrap(),
            TransportMessage::Binary(Bytes::from_static(b"two"))
        );
    }

    #[tokio::test]
    async fn close_notifies_peer_then_ends() {
        let ((mut a_sink, _a_source), (_b_sink, mut b_source)) = pair(4);
        a_sink.close().await.unwrap();

        assert_eq!(
            b_source.next_message().await.unwrap(),
            TransportMessage::Closed {
                code: 1000,
                reason: String::new()
            }
        );
        assert!(matches!(
            b_source.next_message().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ((mut a_sink, _a_source), _b) = pair(4);
        a_sink.close().await.unwrap();
        let err = a_sink.send_binary(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn dropped_peer_closes_source() {
        let ((_a_sink, mut a_source), b) = pair(4);
        drop(b);
        assert!(matches!(
            a_source.next_message().await,
            Err(TransportError::Closed)
        ));
    }
}
