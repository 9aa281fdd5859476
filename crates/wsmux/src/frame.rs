//! Frame codec.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! | stream id: u32 LE | tag: u8 | payload ... |
//! ```
//!
//! SYN and FIN carry no payload, ACK carries a `u32` LE credit value, DAT
//! carries the rest of the message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Length of the frame header in bytes.
pub const HEADER_LEN: usize = 5;

/// Length of an ACK frame's credit field.
const ACK_LEN: usize = 4;

/// Wire tag identifying a frame's type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a stream.
    Syn = 0,
    /// Accept a stream or grant credit.
    Ack = 1,
    /// Stream payload.
    Dat = 2,
    /// Half-close a stream.
    Fin = 3,
}

impl FrameKind {
    /// Map a wire tag to a known kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Syn),
            1 => Some(Self::Ack),
            2 => Some(Self::Dat),
            3 => Some(Self::Fin),
            _ => None,
        }
    }

    /// Lowercase name for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syn => "syn",
            Self::Ack => "ack",
            Self::Dat => "dat",
            Self::Fin => "fin",
        }
    }
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Request to open stream `id`.
    Syn {
        /// Stream ID.
        id: u32,
    },
    /// Acceptance of a SYN (first ACK) or a credit update (later ACKs).
    Ack {
        /// Stream ID.
        id: u32,
        /// Bytes the sender of this ACK is willing to receive.
        credit: u32,
    },
    /// Payload for stream `id`.
    Dat {
        /// Stream ID.
        id: u32,
        /// Stream bytes.
        payload: Bytes,
    },
    /// The sender will write no more data on stream `id`.
    Fin {
        /// Stream ID.
        id: u32,
    },
    /// A frame whose tag this side does not understand.
    Unknown {
        /// Stream ID.
        id: u32,
        /// The unrecognised tag.
        tag: u8,
    },
}

impl Frame {
    /// Stream ID the frame is addressed to.
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Syn { id }
            | Self::Ack { id, .. }
            | Self::Dat { id, .. }
            | Self::Fin { id }
            | Self::Unknown { id, .. } => *id,
        }
    }

    /// Known kind of the frame, `None` for [`Frame::Unknown`].
    pub fn kind(&self) -> Option<FrameKind> {
        match self {
            Self::Syn { .. } => Some(FrameKind::Syn),
            Self::Ack { .. } => Some(FrameKind::Ack),
            Self::Dat { .. } => Some(FrameKind::Dat),
            Self::Fin { .. } => Some(FrameKind::Fin),
            Self::Unknown { .. } => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Unknown { tag, .. } => *tag,
            other => other.kind().map_or(u8::MAX, |kind| kind as u8),
        }
    }

    /// Encode into a single transport message.
    pub fn encode(&self) -> Bytes {
        let payload_len = match self {
            Self::Ack { .. } => ACK_LEN,
            Self::Dat { payload, .. } => payload.len(),
            _ => 0,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u32_le(self.stream_id());
        buf.put_u8(self.tag());
        match self {
            Self::Ack { credit, .. } => buf.put_u32_le(*credit),
            Self::Dat { payload, .. } => buf.extend_from_slice(payload),
            _ => {}
        }
        buf.freeze()
    }

    /// Decode one frame from a transport message.
    ///
    /// DAT payloads are zero-copy slices of `message`.
    pub fn decode(mut message: Bytes) -> Result<Self, FrameError> {
        if message.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                actual: message.len(),
            });
        }
        let id = message.get_u32_le();
        let tag = message.get_u8();
        let Some(kind) = FrameKind::from_tag(tag) else {
            return Ok(Self::Unknown { id, tag });
        };
        let frame = match kind {
            FrameKind::Syn => Self::Syn { id },
            FrameKind::Fin => Self::Fin { id },
            FrameKind::Dat => Self::Dat { id, payload: message },
            FrameKind::Ack => {
                if message.remaining() < ACK_LEN {
                    return Err(FrameError::Truncated {
                        needed: HEADER_LEN + ACK_LEN,
                        actual: HEADER_LEN + message.remaining(),
                    });
                }
                Self::Ack {
                    id,
                    credit: message.get_u32_le(),
                }
            }
        };
        Ok(frame)
    }
}
