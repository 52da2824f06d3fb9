//! POSIX shared memory object backing one frame ring

use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use super::layout::{FrameBufferHeader, RegionGeometry, HEADER_SIZE, SLOT_COUNT};
use crate::error::{BridgeError, Result};

/// Longest channel id accepted in a region name (NAME_MAX minus prefix headroom).
const MAX_CHANNEL_ID_LEN: usize = 200;

/// Deterministic region name for `channel_id`, e.g. `/browser_bridge_cam1`.
pub fn region_name(prefix: &str, channel_id: &str) -> Result<String> {
    let valid = !channel_id.is_empty()
        && channel_id.len() <= MAX_CHANNEL_ID_LEN
        && channel_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !valid {
        return Err(BridgeError::InvalidChannelId(channel_id.to_owned()));
    }

    if prefix.starts_with('/') {
        Ok(format!("{prefix}{channel_id}"))
    } else {
        Ok(format!("/{prefix}{channel_id}"))
    }
}

/// A mapped shared memory object. Unmapped on drop; never unlinked on drop.
pub struct SharedRegion {
    name: String,
    map: MmapRaw,
}

impl SharedRegion {
    /// Create (or replace a stale) region of at least `len` bytes, zero filled.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        match shm_unlink(name) {
            Ok(()) => warn!("Replaced stale shared region {}", name),
            Err(Errno::ENOENT) => {}
            Err(e) => return Err(e.into()),
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;

        let page = page_size::get();
        let len = len.div_ceil(page) * page;

        let mapped = ftruncate(&fd, len as libc::off_t)
            .map_err(BridgeError::from)
            .and_then(|()| {
                let file = File::from(fd);
                MmapOptions::new()
                    .len(len)
                    .map_raw(&file)
                    .map_err(BridgeError::from)
            });

        match mapped {
            Ok(map) => {
                debug!("Created shared region {} ({} bytes)", name, len);
                Ok(Self {
                    name: name.to_owned(),
                    map,
                })
            }
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Open an existing region. `Ok(None)` when it does not exist (yet).
    pub fn open(name: &str) -> Result<Option<Self>> {
        let fd = match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| BridgeError::IncompatibleRegion(format!("{name} is too large")))?;
        if len < HEADER_SIZE {
            // Writer has opened the object but not sized it yet.
            return Ok(None);
        }

        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Some(Self {
            name: name.to_owned(),
            map,
        }))
    }

    /// Remove the name. Mappings held by other processes stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn header(&self) -> &FrameBufferHeader {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long (checked
        // in `create`/`open`); all header fields are atomics valid for any bit pattern.
        unsafe { &*(self.map.as_ptr() as *const FrameBufferHeader) }
    }

    /// Start of the pixel storage of `slot`.
    ///
    /// Callers must have validated `geometry` against the mapped length.
    pub(crate) fn slot_ptr(&self, geometry: &RegionGeometry, slot: usize) -> *mut u8 {
        assert!(slot < SLOT_COUNT);
        debug_assert!(geometry.total_len() <= self.map.len());
        // SAFETY: offset is within the mapping per the geometry check above.
        unsafe { self.map.as_mut_ptr().add(geometry.slot_offset(slot)) }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        assert_eq!(
            region_name("/browser_bridge_", "cam1").unwrap(),
            "/browser_bridge_cam1"
        );
        assert_eq!(region_name("bb_", "x").unwrap(), "/bb_x");
    }

    #[test]
    fn rejects_ids_that_escape_the_namespace() {
        assert!(region_name("/p_", "").is_err());
        assert!(region_name("/p_", "a/b").is_err());
        assert!(region_name("/p_", "a b").is_err());
        assert!(region_name("/p_", &"x".repeat(201)).is_err());
    }

    #[test]
    fn open_missing_region_is_not_an_error() {
        let name = region_name("/browser_bridge_test_", "missing_region_check").unwrap();
        assert!(SharedRegion::open(&name).unwrap().is_none());
    }
}
