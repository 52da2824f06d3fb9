//! Consumer side of the shared frame ring

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::layout::{RegionGeometry, SLOT_COUNT};
use super::region::{region_name, SharedRegion};
use super::RingStats;
use crate::error::{BridgeError, Result};
use crate::utils::age_of;
use crate::RingConfig;

/// Metadata of a frame copied out by [`ShmFrameReader::read_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes written to the destination buffer.
    pub len: usize,
    pub frame_number: u64,
    pub slot: usize,
}

struct Attached {
    region: SharedRegion,
    geometry: RegionGeometry,
}

/// Attaches to a writer's region and copies out the latest completed frame.
///
/// The reader never creates or unlinks the region. A missing region is the
/// normal "writer not started yet" state and `connect` simply reports `false`.
pub struct ShmFrameReader {
    channel_id: String,
    shm_name: String,
    stale_after: Duration,
    read_attempts: u32,
    attached: Option<Attached>,
    last_frame_counter: u64,
    last_read_index: u64,
    torn_reads: u64,
}

impl ShmFrameReader {
    pub fn new(channel_id: &str, config: &RingConfig) -> Result<Self> {
        Ok(Self {
            channel_id: channel_id.to_owned(),
            shm_name: region_name(&config.name_prefix, channel_id)?,
            stale_after: config.stale_after(),
            read_attempts: config.read_attempts.max(1),
            attached: None,
            last_frame_counter: 0,
            last_read_index: 0,
            torn_reads: 0,
        })
    }

    /// Try to map the writer's region. `Ok(false)` means "not there yet, retry".
    #[instrument(skip(self), fields(shm = %self.shm_name))]
    pub fn connect(&mut self) -> Result<bool> {
        if self.attached.is_some() {
            return Ok(true);
        }

        let Some(region) = SharedRegion::open(&self.shm_name)? else {
            return Ok(false);
        };
        let header = region.header();
        if !header.is_ready() {
            debug!("Region {} exists but is not initialized yet", self.shm_name);
            return Ok(false);
        }
        let geometry = header
            .validate(region.len())
            .map_err(BridgeError::IncompatibleRegion)?;

        // A frame published recently is still worth showing; anything older is
        // treated as already seen so it is not reported as new.
        let counter = header.frame_counter.load(Ordering::Acquire);
        let last_write = header.last_write_timestamp_ns.load(Ordering::Acquire);
        let fresh = age_of(last_write).is_some_and(|age| age <= self.stale_after);
        self.last_frame_counter = if fresh {
            counter.saturating_sub(1)
        } else {
            counter
        };
        self.last_read_index = header.write_index.load(Ordering::Acquire);
        self.torn_reads = 0;

        info!(
            "Connected to frame ring {} ({}x{}, {} frames published)",
            self.shm_name,
            header.width.load(Ordering::Relaxed),
            header.height.load(Ordering::Relaxed),
            counter
        );

        self.attached = Some(Attached { region, geometry });
        Ok(true)
    }

    /// Whether the writer published something this reader has not copied yet.
    pub fn has_new_frame(&self) -> bool {
        self.attached.as_ref().is_some_and(|a| {
            a.region.header().frame_counter.load(Ordering::Acquire) > self.last_frame_counter
        })
    }

    /// Copy the latest completed frame into `dst`.
    ///
    /// `Ok(None)` when there is nothing new (or the slot kept changing under
    /// the copy); `BufferTooSmall` leaves `dst` untouched.
    pub fn read_frame(&mut self, dst: &mut [u8]) -> Result<Option<ReadFrame>> {
        let Some(attached) = self.attached.as_ref() else {
            return Err(BridgeError::NotReady(self.shm_name.clone()));
        };
        let header = attached.region.header();

        for _ in 0..self.read_attempts {
            let write_index = header.write_index.load(Ordering::Acquire);
            let counter = header.frame_counter.load(Ordering::Acquire);
            if counter == self.last_frame_counter {
                return Ok(None);
            }

            let slot = write_index as usize;
            if slot >= SLOT_COUNT {
                return Err(BridgeError::IncompatibleRegion(format!(
                    "write_index {write_index} out of range"
                )));
            }
            let desc = &header.slots[slot];

            let seq_before = desc.seq.load(Ordering::Acquire);
            if seq_before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frame_number = desc.frame_number.load(Ordering::Relaxed);
            let width = desc.width.load(Ordering::Relaxed);
            let height = desc.height.load(Ordering::Relaxed);
            let frame_size = desc.frame_size.load(Ordering::Relaxed) as usize;

            // Counter was bumped but the index not yet published; the slot we
            // see still holds a frame we already have.
            if frame_number <= self.last_frame_counter {
                return Ok(None);
            }

            if frame_size > attached.geometry.slot_capacity() {
                fence(Ordering::Acquire);
                if desc.seq.load(Ordering::Relaxed) == seq_before {
                    return Err(BridgeError::IncompatibleRegion(format!(
                        "frame_size {frame_size} exceeds slot capacity"
                    )));
                }
                continue;
            }
            if frame_size > dst.len() {
                fence(Ordering::Acquire);
                if desc.seq.load(Ordering::Relaxed) == seq_before {
                    warn!(
                        "Buffer too small for {}: {} < {}",
                        self.channel_id,
                        dst.len(),
                        frame_size
                    );
                    return Err(BridgeError::BufferTooSmall {
                        needed: frame_size,
                        available: dst.len(),
                    });
                }
                continue;
            }

            header.read_index.store(slot as u64, Ordering::Release);

            // SAFETY: the slot spans slot_capacity bytes inside the mapping and
            // frame_size <= slot_capacity, frame_size <= dst.len(). A concurrent
            // rewrite of the slot is detected by the sequence check below.
            unsafe {
                ptr::copy_nonoverlapping(
                    attached.region.slot_ptr(&attached.geometry, slot),
                    dst.as_mut_ptr(),
                    frame_size,
                );
            }

            fence(Ordering::Acquire);
            if desc.seq.load(Ordering::Relaxed) != seq_before {
                continue;
            }

            self.last_frame_counter = frame_number;
            self.last_read_index = slot as u64;
            return Ok(Some(ReadFrame {
                width,
                height,
                len: frame_size,
                frame_number,
                slot,
            }));
        }

        self.torn_reads += 1;
        metrics::counter!("bridge_torn_reads").increment(1);
        debug!(
            "Slot kept changing during copy for {} ({} torn reads)",
            self.channel_id, self.torn_reads
        );
        Ok(None)
    }

    /// Unmap the region. The writer owns its deletion.
    pub fn disconnect(&mut self) {
        if self.attached.take().is_some() {
            info!("Disconnected from frame ring {}", self.shm_name);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.attached.is_some()
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn stats(&self) -> Option<RingStats> {
        self.attached
            .as_ref()
            .map(|a| RingStats::from_header(a.region.header()))
    }

    pub fn frame_counter(&self) -> u64 {
        self.stats().map_or(0, |s| s.frame_counter)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.stats().map_or(0, |s| s.dropped_frames)
    }

    pub fn width(&self) -> u32 {
        self.stats().map_or(0, |s| s.width)
    }

    pub fn height(&self) -> u32 {
        self.stats().map_or(0, |s| s.height)
    }

    /// Frame number of the last successful copy.
    pub fn last_frame_number(&self) -> u64 {
        self.last_frame_counter
    }

    pub fn last_read_index(&self) -> u64 {
        self.last_read_index
    }

    pub fn torn_reads(&self) -> u64 {
        self.torn_reads
    }

    /// Time since the writer last published, `None` if never or not connected.
    pub fn last_write_age(&self) -> Option<Duration> {
        self.stats().and_then(|s| age_of(s.last_write_ns))
    }

    /// Ask the writer to stop publishing. Best effort.
    pub fn request_pause(&self) {
        if let Some(a) = &self.attached {
            a.region
                .header()
                .pause_requested
                .store(1, Ordering::Release);
        }
    }

    pub fn resume(&self) {
        if let Some(a) = &self.attached {
            a.region
                .header()
                .pause_requested
                .store(0, Ordering::Release);
        }
    }

    /// Whether the writer acknowledged a pause request.
    pub fn producer_paused(&self) -> bool {
        self.attached.as_ref().is_some_and(|a| {
            a.region.header().producer_paused.load(Ordering::Acquire) != 0
        })
    }
}

impl Drop for ShmFrameReader {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for ShmFrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmFrameReader")
            .field("shm_name", &self.shm_name)
            .field("connected", &self.attached.is_some())
            .field("last_frame_counter", &self.last_frame_counter)
            .finish()
    }
}
