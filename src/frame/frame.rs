use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Arrival timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub channel_id: Arc<str>,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
///
/// The discriminant is the numeric tag stored in the shared region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PixelFormat {
    Bgra = 1,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Bgra => 4,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(PixelFormat::Bgra),
            _ => None,
        }
    }

    /// Byte length of a `width`x`height` frame, `None` on overflow.
    pub fn frame_len(self, width: u32, height: u32) -> Option<u64> {
        u64::from(width)
            .checked_mul(u64::from(height))?
            .checked_mul(u64::from(self.bytes_per_pixel()))
    }
}

impl Frame {
    /// Wrap a BGRA payload, rejecting it unless `data.len() == width*height*4`.
    pub fn bgra(
        channel_id: Arc<str>,
        sequence: u64,
        width: u32,
        height: u32,
        data: Bytes,
    ) -> Result<Self> {
        let expected = PixelFormat::Bgra
            .frame_len(width, height)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(BridgeError::SizeMismatch {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(BridgeError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                channel_id,
                sequence,
                width,
                height,
                stride: width * PixelFormat::Bgra.bytes_per_pixel(),
                format: PixelFormat::Bgra,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}
