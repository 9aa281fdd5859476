//! # wsmux
//!
//! Multiplexes many ordered byte streams over one message-oriented transport,
//! in practice a WebSocket.
//!
//! - **Session**: owns the transport, opens and accepts streams, tears down once
//! - **Stream**: a bidirectional byte stream with credit-based flow control and
//!   independent half-close of each direction
//! - **Frames**: `id | tag | payload` messages (SYN, ACK, DAT, FIN), see [`frame`]
//! - **Transports**: `tokio-tungstenite` sockets and an in-process pair for tests
//!
//! ```ignore
//! let (sink, source) = wsmux::transport::websocket::split_client(ws);
//! let session = wsmux::Session::new(sink, source, wsmux::Role::Client, Default::default());
//! let stream = session.open().await?;
//! stream.write(b"hello").await?;
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::{SessionConfig, load_config};
pub use error::{FrameError, MuxError, Result, TransportError};
pub use frame::{Frame, FrameKind};
pub use session::{RemoteCloseCallback, Role, Session, SessionBuilder};
pub use stream::Stream;
