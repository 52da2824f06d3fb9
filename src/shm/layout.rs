//! Binary layout of the shared frame ring.
//!
//! ```text
//! offset  field
//! 0       write_index            u64 atomic   slot holding the last completed frame
//! 8       read_index             u64 atomic   slot the reader copied last (advisory)
//! 16      width, height          u32 x2       metadata of the last published frame
//! 24      frame_size, format     u32 x2
//! 32      frame_counter          u64 atomic   total frames ever published
//! 40      dropped_frames         u64 atomic   frames the writer refused
//! 48      last_write_timestamp   u64 atomic   CLOCK_MONOTONIC ns
//! 56      pause_requested        u32 atomic   reader -> writer
//! 60      producer_paused        u32 atomic   writer -> reader
//! 64      magic, version         u32 x2       reserved area: validation words
//! 72      slot_count, capacity   u32 x2
//! 80      ready                  u32          stored last by the writer
//! 96      slots[3]               32 B each    per-slot sequence stamp + metadata
//! 192     frames[3][capacity]                 raw BGRA bytes
//! ```
//!
//! Every field is a fixed-width atomic so both processes can map the same bytes
//! without sharing a language runtime. Readers and writers must agree on
//! `SLOT_COUNT`, the slot capacity and `HEADER_SIZE`; the header carries the
//! capacity so the reader can check it.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Triple buffering.
pub const SLOT_COUNT: usize = 3;

/// `b"BBFR"` as a little-endian `u32`.
pub const REGION_MAGIC: u32 = u32::from_le_bytes(*b"BBFR");

/// Bump on any incompatible layout change.
pub const REGION_VERSION: u32 = 1;

/// Slots start on a cache-line boundary.
pub const SLOT_ALIGN: usize = 64;

pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_MAX_HEIGHT: u32 = 1080;

/// Per-slot seqlock and the metadata of the frame stored in it.
///
/// `seq` is odd while the writer is copying into the slot.
#[repr(C)]
pub struct SlotDescriptor {
    pub seq: AtomicU64,
    pub frame_number: AtomicU64,
    pub width: AtomicU32,
    pub height: AtomicU32,
    pub frame_size: AtomicU32,
    _reserved: u32,
}

#[repr(C, align(64))]
pub struct FrameBufferHeader {
    pub write_index: AtomicU64,
    pub read_index: AtomicU64,
    pub width: AtomicU32,
    pub height: AtomicU32,
    pub frame_size: AtomicU32,
    pub format: AtomicU32,
    pub frame_counter: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub last_write_timestamp_ns: AtomicU64,
    pub pause_requested: AtomicU32,
    pub producer_paused: AtomicU32,

    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub slot_count: AtomicU32,
    pub slot_capacity: AtomicU32,
    pub ready: AtomicU32,
    _pad: [u8; 12],

    pub slots: [SlotDescriptor; SLOT_COUNT],
}

pub const HEADER_SIZE: usize = size_of::<FrameBufferHeader>();

const _: () = assert!(size_of::<SlotDescriptor>() == 32);
const _: () = assert!(HEADER_SIZE == 192);
const _: () = assert!(offset_of!(FrameBufferHeader, frame_counter) == 32);
const _: () = assert!(offset_of!(FrameBufferHeader, pause_requested) == 56);
const _: () = assert!(offset_of!(FrameBufferHeader, magic) == 64);
const _: () = assert!(offset_of!(FrameBufferHeader, slots) == 96);
const _: () = assert!(HEADER_SIZE % SLOT_ALIGN == 0);

/// Slot geometry shared by writer and reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionGeometry {
    slot_capacity: u32,
}

impl RegionGeometry {
    /// Geometry able to hold one `max_width`x`max_height` BGRA frame per slot.
    pub fn for_max_frame(max_width: u32, max_height: u32) -> Option<Self> {
        let bytes = u64::from(max_width)
            .checked_mul(u64::from(max_height))?
            .checked_mul(4)?;
        let aligned = bytes.checked_add(SLOT_ALIGN as u64 - 1)? & !(SLOT_ALIGN as u64 - 1);
        let slot_capacity = u32::try_from(aligned).ok()?;
        (slot_capacity > 0).then_some(Self { slot_capacity })
    }

    pub fn from_capacity(slot_capacity: u32) -> Option<Self> {
        (slot_capacity > 0 && slot_capacity as usize % SLOT_ALIGN == 0)
            .then_some(Self { slot_capacity })
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity as usize
    }

    pub fn slot_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < SLOT_COUNT);
        HEADER_SIZE + slot * self.slot_capacity()
    }

    pub fn total_len(&self) -> usize {
        HEADER_SIZE + SLOT_COUNT * self.slot_capacity()
    }
}

impl Default for RegionGeometry {
    fn default() -> Self {
        Self {
            slot_capacity: DEFAULT_MAX_WIDTH * DEFAULT_MAX_HEIGHT * 4,
        }
    }
}

impl FrameBufferHeader {
    /// Fill in the validation words of a freshly zeroed region, `ready` last.
    pub fn initialize(&self, geometry: RegionGeometry, width: u32, height: u32, format: u32) {
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.format.store(format, Ordering::Relaxed);
        self.magic.store(REGION_MAGIC, Ordering::Relaxed);
        self.version.store(REGION_VERSION, Ordering::Relaxed);
        self.slot_count.store(SLOT_COUNT as u32, Ordering::Relaxed);
        self.slot_capacity
            .store(geometry.slot_capacity, Ordering::Relaxed);
        self.ready.store(1, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Check the validation words against what this build expects and return
    /// the geometry the writer used.
    pub fn validate(&self, mapped_len: usize) -> Result<RegionGeometry, String> {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != REGION_MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != REGION_VERSION {
            return Err(format!("version {version}, expected {REGION_VERSION}"));
        }
        let slots = self.slot_count.load(Ordering::Relaxed);
        if slots as usize != SLOT_COUNT {
            return Err(format!("{slots} slots, expected {SLOT_COUNT}"));
        }
        let capacity = self.slot_capacity.load(Ordering::Relaxed);
        let geometry = RegionGeometry::from_capacity(capacity)
            .ok_or_else(|| format!("invalid slot capacity {capacity}"))?;
        if mapped_len < geometry.total_len() {
            return Err(format!(
                "mapped {mapped_len} bytes, layout needs {}",
                geometry.total_len()
            ));
        }
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_holds_full_hd() {
        let g = RegionGeometry::default();
        assert_eq!(g.slot_capacity(), 1920 * 1080 * 4);
        assert_eq!(g.slot_offset(0), HEADER_SIZE);
        assert_eq!(g.total_len(), 192 + 3 * 8_294_400);
    }

    #[test]
    fn capacity_is_cache_line_aligned() {
        let g = RegionGeometry::for_max_frame(3, 3).unwrap();
        assert_eq!(g.slot_capacity(), 64);
        assert!(RegionGeometry::for_max_frame(0, 10).is_none());
        assert!(RegionGeometry::for_max_frame(u32::MAX, u32::MAX).is_none());
    }

    #[test]
    fn validation_rejects_foreign_layout() {
        // SAFETY: an all-zero header is a valid value, every field is an integer atomic.
        let header: FrameBufferHeader = unsafe { std::mem::zeroed() };
        assert!(!header.is_ready());
        assert!(header.validate(usize::MAX).is_err());

        let g = RegionGeometry::for_max_frame(16, 16).unwrap();
        header.initialize(g, 16, 16, 1);
        assert!(header.is_ready());
        assert_eq!(header.validate(g.total_len()), Ok(g));
        assert!(header.validate(g.total_len() - 1).is_err());
    }
}
