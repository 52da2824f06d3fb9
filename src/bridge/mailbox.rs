//! Latest-wins frame slot between the channel's receive task and the tick

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Single-slot mailbox optimized for frame hand-off.
///
/// The producer never waits: a newer frame replaces an unread one, which is
/// counted as dropped. The consumer takes whatever is newest.
pub struct FrameMailbox {
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: store `frame`, returns `true` when it replaced an unread one.
    pub fn push(&self, frame: Frame) -> bool {
        let replaced = self.slot.swap(Some(Arc::new(frame))).is_some();
        if replaced {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        replaced
    }

    /// Consumer: take the newest frame, if any.
    pub fn take(&self) -> Option<Arc<Frame>> {
        let frame = self.slot.swap(None)?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn has_frame(&self) -> bool {
        self.slot.load().is_some()
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for FrameMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::bgra(Arc::from("b1"), seq, 1, 1, Bytes::from_static(&[0, 0, 0, 255])).unwrap()
    }

    #[test]
    fn newest_frame_wins() {
        let mailbox = FrameMailbox::new();
        assert!(mailbox.take().is_none());

        assert!(!mailbox.push(frame(1)));
        assert!(mailbox.push(frame(2)));
        assert!(mailbox.has_frame());

        assert_eq!(mailbox.take().unwrap().meta.sequence, 2);
        assert!(mailbox.take().is_none());
        assert_eq!(mailbox.stats(), (2, 1, 1));
    }
}
