//! Error taxonomy shared by both transports

use std::io;

use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The peer (region or socket) does not exist yet. Retry later.
    #[error("{0} is not ready yet")]
    NotReady(String),

    #[error("frame {width}x{height} needs {needed} bytes, slot capacity is {capacity}")]
    FrameTooLarge {
        width: u32,
        height: u32,
        needed: u64,
        capacity: u64,
    },

    #[error("destination buffer holds {available} bytes, frame needs {needed}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("pixel payload is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("line exceeded {limit} bytes without a terminator")]
    LineTooLong { limit: usize },

    #[error("channel disconnected")]
    Disconnected,

    #[error("shared frame ring was not created or already destroyed")]
    NotCreated,

    #[error("producer is paused")]
    ProducerPaused,

    #[error("invalid channel id {0:?}")]
    InvalidChannelId(String),

    #[error("incompatible shared region: {0}")]
    IncompatibleRegion(String),

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Transient conditions the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::NotReady(_) | BridgeError::ProducerPaused => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Single frame/message was rejected; the channel itself is still healthy.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            BridgeError::FrameTooLarge { .. }
                | BridgeError::BufferTooSmall { .. }
                | BridgeError::SizeMismatch { .. }
                | BridgeError::InvalidBase64(_)
                | BridgeError::MalformedMessage(_)
                | BridgeError::LineTooLong { .. }
                | BridgeError::Json(_)
        )
    }
}
