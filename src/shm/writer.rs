//! Producer side of the shared frame ring

use std::ptr;
use std::sync::atomic::{fence, Ordering};

use tracing::{debug, info, instrument, warn};

use super::layout::{RegionGeometry, SLOT_COUNT};
use super::region::{region_name, SharedRegion};
use super::RingStats;
use crate::error::{BridgeError, Result};
use crate::frame::PixelFormat;
use crate::utils::monotonic_ns;
use crate::RingConfig;

/// Where a frame ended up after a successful [`ShmFrameWriter::write_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub frame_number: u64,
    pub slot: usize,
}

/// Owns the named region for one channel and publishes frames into it.
///
/// Never blocks on the reader: a frame is either copied into the next slot or
/// rejected immediately.
pub struct ShmFrameWriter {
    channel_id: String,
    region: Option<SharedRegion>,
    geometry: RegionGeometry,
    shm_name: String,
}

impl ShmFrameWriter {
    /// Create the region for `channel_id`, sized for the configured maximum frame.
    #[instrument(skip(config))]
    pub fn create(channel_id: &str, width: u32, height: u32, config: &RingConfig) -> Result<Self> {
        let shm_name = region_name(&config.name_prefix, channel_id)?;
        let geometry = RegionGeometry::for_max_frame(config.max_width, config.max_height)
            .ok_or_else(|| {
                BridgeError::IncompatibleRegion(format!(
                    "{}x{} does not fit a slot",
                    config.max_width, config.max_height
                ))
            })?;

        let region = SharedRegion::create(&shm_name, geometry.total_len())?;
        region
            .header()
            .initialize(geometry, width, height, PixelFormat::Bgra as u32);

        if PixelFormat::Bgra
            .frame_len(width, height)
            .map_or(true, |n| n > geometry.slot_capacity() as u64)
        {
            warn!(
                "Initial size {}x{} exceeds slot capacity {}; frames at this size will be dropped",
                width,
                height,
                geometry.slot_capacity()
            );
        }

        info!(
            "Created frame ring {} ({} slots x {} bytes)",
            shm_name,
            SLOT_COUNT,
            geometry.slot_capacity()
        );

        Ok(Self {
            channel_id: channel_id.to_owned(),
            region: Some(region),
            geometry,
            shm_name,
        })
    }

    /// Publish one BGRA frame. `pixels` must hold at least `width*height*4` bytes.
    pub fn write_frame(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Published> {
        let region = self.region.as_ref().ok_or(BridgeError::NotCreated)?;
        let header = region.header();

        if header.pause_requested.load(Ordering::Acquire) != 0 {
            if header.producer_paused.swap(1, Ordering::AcqRel) == 0 {
                debug!("Producer paused for {}", self.channel_id);
            }
            return Err(BridgeError::ProducerPaused);
        }
        if header.producer_paused.load(Ordering::Relaxed) != 0 {
            header.producer_paused.store(0, Ordering::Release);
            debug!("Producer resumed for {}", self.channel_id);
        }

        let capacity = self.geometry.slot_capacity() as u64;
        let needed = PixelFormat::Bgra.frame_len(width, height).unwrap_or(u64::MAX);
        if width == 0 || height == 0 || needed > capacity {
            header.dropped_frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bridge_frames_dropped").increment(1);
            return Err(BridgeError::FrameTooLarge {
                width,
                height,
                needed,
                capacity,
            });
        }
        let frame_size = needed as usize;
        if pixels.len() < frame_size {
            header.dropped_frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bridge_frames_dropped").increment(1);
            return Err(BridgeError::SizeMismatch {
                expected: frame_size,
                actual: pixels.len(),
            });
        }

        // The reader only ever copies the slot `write_index` points at, so the
        // next one is free unless the reader stalled for two publishes; the
        // slot sequence stamp catches that case on the reader side.
        let last = header.write_index.load(Ordering::Relaxed);
        let slot = ((last + 1) % SLOT_COUNT as u64) as usize;
        let desc = &header.slots[slot];
        let frame_number = header.frame_counter.load(Ordering::Relaxed) + 1;

        let seq = desc.seq.load(Ordering::Relaxed);
        desc.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: slot_ptr is in bounds for `slot_capacity` bytes and
        // frame_size <= slot_capacity; pixels holds at least frame_size bytes.
        // Concurrent readers detect overlapping copies through `seq`.
        unsafe {
            ptr::copy_nonoverlapping(
                pixels.as_ptr(),
                region.slot_ptr(&self.geometry, slot),
                frame_size,
            );
        }

        desc.frame_number.store(frame_number, Ordering::Relaxed);
        desc.width.store(width, Ordering::Relaxed);
        desc.height.store(height, Ordering::Relaxed);
        desc.frame_size.store(frame_size as u32, Ordering::Relaxed);
        desc.seq.store(seq.wrapping_add(2), Ordering::Release);

        header.width.store(width, Ordering::Relaxed);
        header.height.store(height, Ordering::Relaxed);
        header.frame_size.store(frame_size as u32, Ordering::Relaxed);
        header
            .format
            .store(PixelFormat::Bgra as u32, Ordering::Relaxed);

        header.frame_counter.fetch_add(1, Ordering::Release);
        header.write_index.store(slot as u64, Ordering::Release);
        header
            .last_write_timestamp_ns
            .store(monotonic_ns(), Ordering::Release);

        metrics::counter!("bridge_frames_published").increment(1);
        if frame_number % 300 == 1 {
            debug!(
                "Published frame #{} for {} ({}x{}) into slot {}",
                frame_number, self.channel_id, width, height, slot
            );
        }

        Ok(Published { frame_number, slot })
    }

    /// Unmap and unlink the region. Safe to call more than once.
    pub fn destroy(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };
        drop(region);
        match SharedRegion::unlink(&self.shm_name) {
            Ok(()) => info!("Destroyed frame ring {}", self.shm_name),
            Err(e) => warn!("Failed to unlink frame ring {}: {}", self.shm_name, e),
        }
    }

    pub fn is_created(&self) -> bool {
        self.region.is_some()
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn slot_capacity(&self) -> usize {
        self.geometry.slot_capacity()
    }

    /// Reader's pause request, as last seen in the header.
    pub fn pause_requested(&self) -> bool {
        self.region
            .as_ref()
            .is_some_and(|r| r.header().pause_requested.load(Ordering::Acquire) != 0)
    }

    pub fn stats(&self) -> Option<RingStats> {
        self.region.as_ref().map(|r| RingStats::from_header(r.header()))
    }
}

impl Drop for ShmFrameWriter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ShmFrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmFrameWriter")
            .field("shm_name", &self.shm_name)
            .field("created", &self.region.is_some())
            .finish()
    }
}
