//! Error types for sessions, streams, transports and the frame codec.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`Session`](crate::Session) and [`Stream`](crate::Stream) operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session was closed before or during the operation.
    #[error("session closed")]
    SessionClosed,

    /// The peer did not acknowledge an opened stream within the deadline.
    #[error("stream not accepted within {0:?}")]
    AcceptTimeout(Duration),

    /// A locally allocated stream ID is already registered.
    #[error("duplicate stream {0}")]
    DuplicateStream(u32),

    /// The 32-bit stream ID space for this side has been used up.
    #[error("stream IDs exhausted")]
    StreamIdsExhausted,

    /// The stream was closed locally.
    #[error("stream {id} closed")]
    StreamClosed {
        /// The closed stream's ID.
        id: u32,
    },

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl MuxError {
    /// Whether this error reports a closed session or stream rather than a fault.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::StreamClosed { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionClosed => "session_closed",
            Self::AcceptTimeout(_) => "accept_timeout",
            Self::DuplicateStream(_) => "duplicate_stream",
            Self::StreamIdsExhausted => "stream_ids_exhausted",
            Self::StreamClosed { .. } => "stream_closed",
            Self::Transport(_) => "transport",
        }
    }
}

/// Lets [`Stream`](crate::Stream)'s `AsyncRead`/`AsyncWrite` impls report mux
/// errors as I/O errors.
impl From<MuxError> for std::io::Error {
    fn from(err: MuxError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            MuxError::SessionClosed => ErrorKind::ConnectionAborted,
            MuxError::StreamClosed { .. } => ErrorKind::BrokenPipe,
            MuxError::AcceptTimeout(_) => ErrorKind::TimedOut,
            MuxError::Transport(TransportError::Io(io)) => io.kind(),
            MuxError::DuplicateStream(_)
            | MuxError::StreamIdsExhausted
            | MuxError::Transport(_) => ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Errors reported by a [`MessageSink`](crate::transport::MessageSink) or
/// [`MessageSource`](crate::transport::MessageSource).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has no more messages or refuses further writes.
    #[error("transport closed")]
    Closed,

    /// WebSocket protocol or connection error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Socket I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(io) => Self::Io(io),
            other => Self::WebSocket(other.to_string()),
        }
    }
}

/// Errors from decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The message ended before the frame did.
    #[error("truncated frame: need {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes required to decode the frame.
        needed: usize,
        /// Bytes available in the message.
        actual: usize,
    },
}

/// Result type for session and stream operations.
pub type Result<T> = std::result::Result<T, MuxError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_closed_display() {
        assert_eq!(MuxError::SessionClosed.to_string(), "session closed");
    }

    #[test]
    fn accept_timeout_display() {
        let err = MuxError::AcceptTimeout(Duration::from_millis(50));
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn duplicate_stream_display() {
        assert_eq!(MuxError::DuplicateStream(7).to_string(), "duplicate stream 7");
    }

    #[test]
    fn closed_classification() {
        assert!(MuxError::SessionClosed.is_closed());
        assert!(MuxError::StreamClosed { id: 3 }.is_closed());
        assert!(!MuxError::AcceptTimeout(Duration::from_secs(1)).is_closed());
        assert!(!MuxError::Transport(TransportError::Closed).is_closed());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(MuxError::SessionClosed.error_kind(), "session_closed");
        assert_eq!(MuxError::StreamIdsExhausted.error_kind(), "stream_ids_exhausted");
        assert_eq!(
            MuxError::Transport(TransportError::Closed).error_kind(),
            "transport"
        );
    }

    #[test]
    fn transport_error_is_transparent() {
        let err = MuxError::from(TransportError::WebSocket("reset".into()));
        assert_eq!(err.to_string(), "websocket error: reset");
    }

    #[test]
    fn tungstenite_closed_maps_to_closed() {
        let err: TransportError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn io_error_kinds() {
        use std::io::{self, ErrorKind};
        assert_eq!(io::Error::from(MuxError::SessionClosed).kind(), ErrorKind::ConnectionAborted);
        assert_eq!(
            io::Error::from(MuxError::StreamClosed { id: 1 }).kind(),
            ErrorKind::BrokenPipe
        );
        let reset = TransportError::Io(io::Error::from(ErrorKind::ConnectionReset));
        assert_eq!(
            io::Error::from(MuxError::Transport(reset)).kind(),
            ErrorKind::ConnectionReset
        );
        assert!(io::Error::from(MuxError::SessionClosed).to_string().contains("session closed"));
    }

    #[test]
    fn truncated_display() {
        let err = FrameError::Truncated { needed: 5, actual: 2 };
        assert_eq!(err.to_string(), "truncated frame: need 5 bytes, got 2");
    }
}
