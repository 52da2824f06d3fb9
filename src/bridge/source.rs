//! Per-browser source: picks the transport and keeps the host texture current

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::mailbox::FrameMailbox;
use super::manager::BridgeManager;
use crate::error::{BridgeError, Result};
use crate::shm::ShmFrameReader;
use crate::utils::generate_channel_id;
use crate::{PixelFormat, SourceSettings};

const INIT_RETRY: Duration = Duration::from_secs(2);

/// Where decoded frames end up on the host side (a GPU texture, usually).
///
/// Called from [`BrowserSource::tick`] only, so implementations may require
/// the thread the host ticks on.
pub trait TextureSink: Send {
    /// Drop the current texture (if any) and create one of the given size.
    fn recreate(&mut self, width: u32, height: u32);

    /// Replace the texture contents with tightly packed BGRA rows.
    fn upload(&mut self, bgra: &[u8], width: u32, height: u32);

    fn release(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub shm_frames: u64,
    pub channel_frames: u64,
    pub shm_reconnects: u64,
    pub texture_recreations: u64,
}

/// Which transport supplied the frame uploaded by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    SharedMemory,
    Channel,
}

struct Texture {
    sink: Box<dyn TextureSink>,
    size: Option<(u32, u32)>,
}

impl Texture {
    fn upload(&mut self, bgra: &[u8], width: u32, height: u32, stats: &mut SourceStats) {
        let expected = PixelFormat::Bgra.frame_len(width, height);
        if expected != Some(bgra.len() as u64) {
            warn!(
                "Skipping upload of {} bytes for a {}x{} frame",
                bgra.len(),
                width,
                height
            );
            return;
        }

        if self.size != Some((width, height)) {
            self.sink.recreate(width, height);
            self.size = Some((width, height));
            stats.texture_recreations += 1;
            debug!("Created texture: {}x{}", width, height);
        }
        self.sink.upload(bgra, width, height);
        metrics::histogram!("bridge_texture_upload_bytes").record(bgra.len() as f64);
    }

    fn release(&mut self) {
        if self.size.take().is_some() {
            self.sink.release();
        }
    }
}

/// One browser instance as seen by the host.
///
/// Prefers the shared memory ring and falls back to frames delivered over
/// the channel while the ring is unavailable.
pub struct BrowserSource {
    id: Arc<str>,
    settings: SourceSettings,
    manager: Arc<BridgeManager>,
    mailbox: Arc<FrameMailbox>,
    reader: Option<ShmFrameReader>,
    shm_buf: Vec<u8>,
    shm_retry: Duration,
    shm_stale: Duration,
    next_shm_attempt: Instant,
    last_shm_frame: Option<Instant>,
    texture: Texture,
    visible: bool,
    active: bool,
    initialized: bool,
    pending_init: bool,
    next_init_attempt: Instant,
    was_connected: bool,
    seen_generation: u64,
    stats: SourceStats,
}

impl BrowserSource {
    pub fn new(
        manager: Arc<BridgeManager>,
        settings: SourceSettings,
        sink: Box<dyn TextureSink>,
    ) -> Result<Self> {
        let id: Arc<str> = Arc::from(generate_channel_id());
        let config = manager.config();

        let reader = if config.bridge.use_shm {
            Some(ShmFrameReader::new(&id, &config.ring)?)
        } else {
            None
        };
        let shm_len = PixelFormat::Bgra
            .frame_len(config.ring.max_width, config.ring.max_height)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        let shm_retry = Duration::from_millis(config.bridge.shm_retry_ms);
        let shm_stale = Duration::from_millis(config.bridge.shm_stale_ms);

        let mailbox = manager.register_source(&id);
        let now = Instant::now();
        info!("Created source {} for {}", id, settings.url);

        Ok(Self {
            id,
            settings,
            mailbox,
            reader,
            shm_buf: vec![0; shm_len],
            shm_retry,
            shm_stale,
            next_shm_attempt: now,
            last_shm_frame: None,
            texture: Texture { sink, size: None },
            visible: false,
            active: false,
            initialized: false,
            pending_init: true,
            next_init_attempt: now,
            was_connected: false,
            seen_generation: manager.connection_generation(),
            manager,
            stats: SourceStats::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn init_pending(&self) -> bool {
        self.pending_init
    }

    pub fn texture_size(&self) -> Option<(u32, u32)> {
        self.texture.size
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    pub fn shm_connected(&self) -> bool {
        self.reader.as_ref().is_some_and(ShmFrameReader::is_connected)
    }

    pub fn show(&mut self) {
        self.visible = true;
        if !self.initialized {
            self.pending_init = true;
        }
    }

    pub async fn hide(&mut self) {
        self.visible = false;
        if self.settings.shutdown_on_hidden && self.initialized {
            self.dispose_browser().await;
        }
    }

    pub fn activate(&mut self) {
        self.active = true;
        if self.settings.restart_on_active && !self.initialized {
            self.pending_init = true;
        }
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Store new settings; a running browser is updated in place.
    pub async fn apply_settings(&mut self, settings: SourceSettings) -> Result<()> {
        let url_changed = settings.url != self.settings.url;
        let needs_update = self.initialized
            && (url_changed
                || settings.width != self.settings.width
                || settings.height != self.settings.height
                || settings.css != self.settings.css);
        self.settings = settings;

        if needs_update {
            info!("Settings changed for {}, sending updateBrowser", self.id);
            let s = &self.settings;
            self.manager
                .update_browser(
                    &self.id,
                    url_changed.then_some(s.url.as_str()),
                    s.width,
                    s.height,
                    (!s.css.is_empty()).then_some(s.css.as_str()),
                )
                .await?;
        }
        Ok(())
    }

    /// Per-frame host callback. Never waits on the helper except for a
    /// pending browser init.
    pub async fn tick(&mut self) -> Option<Transport> {
        self.track_connection();

        if self.pending_init && Instant::now() >= self.next_init_attempt {
            self.pending_init = false;
            if let Err(e) = self.init_browser().await {
                if e.is_retryable() {
                    self.pending_init = true;
                    self.next_init_attempt = Instant::now() + INIT_RETRY;
                }
                error!("Failed to initialize browser {}: {}", self.id, e);
            }
        }

        match self.update_from_shm() {
            ShmTick::Uploaded => Some(Transport::SharedMemory),
            ShmTick::Idle => None,
            ShmTick::Unavailable => self.update_from_mailbox().then_some(Transport::Channel),
        }
    }

    /// The helper connection came (back) up: a browser we had is gone with
    /// the old connection, so create it again.
    pub fn on_connection_established(&mut self) {
        if self.initialized {
            info!("Helper reconnected, re-initializing {}", self.id);
            self.initialized = false;
            self.pending_init = true;
        }
    }

    pub fn on_connection_lost(&mut self) {
        if self.initialized {
            warn!("Lost helper connection for {}", self.id);
            self.initialized = false;
            self.pending_init = true;
        }
        if let Some(reader) = self.reader.as_mut() {
            reader.disconnect();
        }
    }

    /// Dispose the browser and stop receiving frames.
    pub async fn close(&mut self) {
        self.dispose_browser().await;
        if let Some(reader) = self.reader.as_mut() {
            reader.disconnect();
        }
        self.manager.unregister_source(&self.id);
        self.texture.release();
    }

    async fn init_browser(&mut self) -> Result<()> {
        if self.initialized {
            debug!("Browser already initialized: {}", self.id);
            return Ok(());
        }

        info!(
            "Initializing browser {} url={} size={}x{} fps={}",
            self.id,
            self.settings.url,
            self.settings.width,
            self.settings.height,
            self.settings.fps
        );
        self.manager.init_browser(&self.id, &self.settings).await?;
        self.initialized = true;
        self.seen_generation = self.manager.connection_generation();
        self.was_connected = true;

        // A new browser instance creates a new region under the same name.
        if let Some(reader) = self.reader.as_mut() {
            reader.disconnect();
        }
        self.next_shm_attempt = Instant::now();
        Ok(())
    }

    async fn dispose_browser(&mut self) {
        if !self.initialized {
            return;
        }
        info!("Disposing browser {}", self.id);
        if let Err(e) = self.manager.dispose_browser(&self.id).await {
            warn!("Failed to dispose browser {}: {}", self.id, e);
        }
        self.initialized = false;
    }

    fn track_connection(&mut self) {
        let connected = self.manager.is_connected();
        let generation = self.manager.connection_generation();

        if generation != self.seen_generation {
            self.seen_generation = generation;
            if connected {
                self.on_connection_established();
            }
        } else if self.was_connected && !connected {
            self.on_connection_lost();
        }
        self.was_connected = connected;
    }

    fn update_from_shm(&mut self) -> ShmTick {
        let now = Instant::now();
        let Some(reader) = self.reader.as_mut() else {
            return ShmTick::Unavailable;
        };

        if !reader.is_connected() {
            if now < self.next_shm_attempt {
                return ShmTick::Unavailable;
            }
            self.next_shm_attempt = now + self.shm_retry;
            match reader.connect() {
                Ok(true) => {
                    info!("Connected to shared memory transport for {}", self.id);
                    self.last_shm_frame = Some(now);
                }
                Ok(false) => return ShmTick::Unavailable,
                Err(e) => {
                    warn!("Shared memory transport unavailable for {}: {}", self.id, e);
                    return ShmTick::Unavailable;
                }
            }
        }

        if !reader.has_new_frame() {
            let quiet = self
                .last_shm_frame
                .is_some_and(|t| now.duration_since(t) > self.shm_stale);
            let writer_idle = reader.last_write_age().map_or(true, |age| age > self.shm_stale);
            if quiet && writer_idle {
                info!(
                    "No shared memory frames for {} in {:?}, reconnecting",
                    self.id, self.shm_stale
                );
                reader.disconnect();
                self.stats.shm_reconnects += 1;
                self.next_shm_attempt = now;
                self.last_shm_frame = None;
                return ShmTick::Unavailable;
            }
            return ShmTick::Idle;
        }

        let frame = match reader.read_frame(&mut self.shm_buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return ShmTick::Idle,
            Err(BridgeError::BufferTooSmall { needed, .. }) => {
                self.shm_buf.resize(needed, 0);
                return ShmTick::Idle;
            }
            Err(e) if e.is_frame_local() => {
                warn!("Skipping shared memory frame for {}: {}", self.id, e);
                return ShmTick::Idle;
            }
            Err(e) => {
                warn!("Shared memory read failed for {}: {}", self.id, e);
                reader.disconnect();
                return ShmTick::Unavailable;
            }
        };

        self.last_shm_frame = Some(now);
        self.stats.shm_frames += 1;
        self.texture.upload(
            &self.shm_buf[..frame.len],
            frame.width,
            frame.height,
            &mut self.stats,
        );
        ShmTick::Uploaded
    }

    fn update_from_mailbox(&mut self) -> bool {
        let Some(frame) = self.mailbox.take() else {
            return false;
        };
        self.stats.channel_frames += 1;
        self.texture
            .upload(&frame.data, frame.width(), frame.height(), &mut self.stats);
        true
    }
}

enum ShmTick {
    Uploaded,
    Idle,
    Unavailable,
}

impl Drop for BrowserSource {
    fn drop(&mut self) {
        self.manager.unregister_source(&self.id);
    }
}

impl std::fmt::Debug for BrowserSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSource")
            .field("id", &self.id)
            .field("visible", &self.visible)
            .field("active", &self.active)
            .field("initialized", &self.initialized)
            .field("stats", &self.stats)
            .finish()
    }
}
