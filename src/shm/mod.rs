//! Triple-buffered shared memory frame ring (one writer, one reader per channel)

pub mod layout;
pub mod reader;
pub mod region;
pub mod writer;

use std::sync::atomic::Ordering;

pub use reader::{ReadFrame, ShmFrameReader};
pub use region::region_name;
pub use writer::{Published, ShmFrameWriter};

use layout::FrameBufferHeader;

/// Point-in-time copy of the ring's diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub frame_counter: u64,
    pub dropped_frames: u64,
    pub width: u32,
    pub height: u32,
    pub last_write_ns: u64,
    pub producer_paused: bool,
}

impl RingStats {
    pub(crate) fn from_header(header: &FrameBufferHeader) -> Self {
        Self {
            frame_counter: header.frame_counter.load(Ordering::Acquire),
            dropped_frames: header.dropped_frames.load(Ordering::Relaxed),
            width: header.width.load(Ordering::Relaxed),
            height: header.height.load(Ordering::Relaxed),
            last_write_ns: header.last_write_timestamp_ns.load(Ordering::Relaxed),
            producer_paused: header.producer_paused.load(Ordering::Relaxed) != 0,
        }
    }
}
