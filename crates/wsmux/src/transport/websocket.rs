//! WebSocket transport over `tokio-tungstenite`.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{MessageSink, MessageSource, TransportMessage};
use crate::error::TransportError;

/// Write half of a WebSocket transport.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    local_addr: Option<SocketAddr>,
}

/// Read half of a WebSocket transport.
pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split a WebSocket into transport halves.
pub fn split<S>(ws: WebSocketStream<S>, local_addr: Option<SocketAddr>) -> (WsSink<S>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    (
        WsSink {
            inner: sink,
            local_addr,
        },
        WsSource { inner: source },
    )
}

/// Split a server-side WebSocket accepted on a plain TCP socket.
pub fn split_tcp(ws: WebSocketStream<TcpStream>) -> (WsSink<TcpStream>, WsSource<TcpStream>) {
    let local_addr = ws.get_ref().local_addr().ok();
    split(ws, local_addr)
}

/// Split a client-side WebSocket returned by `connect_async`.
pub fn split_client(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> (
    WsSink<MaybeTlsStream<TcpStream>>,
    WsSource<MaybeTlsStream<TcpStream>>,
) {
    let local_addr = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok(),
        _ => None,
    };
    split(ws, local_addr)
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_binary(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.inner.send(Message::Binary(payload)).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.inner.send(Message::Ping(Bytes::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await.map_err(TransportError::from) {
            Ok(()) | Err(TransportError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_message(&mut self) -> Result<TransportMessage, TransportError> {
        let Some(msg) = self.inner.next().await else {
            return Err(TransportError::Closed);
        };
        Ok(match msg? {
            Message::Binary(payload) => TransportMessage::Binary(payload),
            Message::Close(frame) => match frame {
                Some(frame) => TransportMessage::Closed {
                    code: u16::from(frame.code),
                    reason: frame.reason.as_str().to_owned(),
                },
                None => TransportMessage::Closed {
                    code: u16::from(CloseCode::Status),
                    reason: String::new(),
                },
            },
            // tungstenite answers pings on its own
            _ => TransportMessage::Other,
        })
    }
}
