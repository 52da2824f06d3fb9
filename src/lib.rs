//! Frame transport between an off-screen browser helper and a compositing host.
//!
//! Two interchangeable transports deliver BGRA frames for a channel: the
//! triple-buffered shared memory ring in [`shm`] and the newline-delimited JSON
//! channel in [`ipc`]. [`bridge`] picks between them per source.

pub mod bridge;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod shm;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{BridgeError, Result};
pub use frame::{Frame, PixelFormat};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable the host uses to hand over the helper auth token.
pub const TOKEN_ENV: &str = "BROWSER_HELPER_TOKEN";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ring: RingConfig,
    pub channel: ChannelConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Region name prefix, the channel id is appended.
    pub name_prefix: String,
    /// Largest frame a slot can hold.
    pub max_width: u32,
    pub max_height: u32,
    /// A published frame older than this is treated as already seen on connect.
    pub stale_after_ms: u64,
    /// Seqlock retries before a read gives up on a slot being rewritten.
    pub read_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret sent with every command; empty disables it.
    pub token: String,
    pub client_name: String,
    pub connect_timeout_ms: u64,
    /// Shorter timeout used when probing for an already running helper.
    pub probe_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub read_chunk_bytes: usize,
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Helper executable; empty means "only connect to an existing helper".
    pub helper_path: String,
    /// Pause between spawning the helper and the first connect attempt.
    pub launch_grace_ms: u64,
    /// Prefer the shared memory ring when available.
    pub use_shm: bool,
    /// Minimum interval between shared memory connect attempts.
    pub shm_retry_ms: u64,
    /// Reconnect the ring when no frame arrived for this long.
    pub shm_stale_ms: u64,
    pub source: SourceSettings,
}

/// Per-source settings, mirrored into `initBrowser`/`updateBrowser`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub css: String,
    pub shutdown_on_hidden: bool,
    pub restart_on_active: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            name_prefix: "/browser_bridge_".into(),
            max_width: shm::layout::DEFAULT_MAX_WIDTH,
            max_height: shm::layout::DEFAULT_MAX_HEIGHT,
            stale_after_ms: 2000,
            read_attempts: 3,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4777,
            token: String::new(),
            client_name: "browser-bridge".into(),
            connect_timeout_ms: 5000,
            probe_timeout_ms: 2000,
            retry_interval_ms: 200,
            poll_timeout_ms: 100,
            read_chunk_bytes: 256 * 1024,
            max_line_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            helper_path: String::new(),
            launch_grace_ms: 500,
            use_shm: true,
            shm_retry_ms: 500,
            shm_stale_ms: 2000,
            source: SourceSettings::default(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "https://example.com".into(),
            width: 1280,
            height: 720,
            fps: 30,
            css: String::new(),
            shutdown_on_hidden: false,
            restart_on_active: false,
        }
    }
}

impl RingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl ChannelConfig {
    pub fn token(&self) -> Option<&str> {
        (!self.token.is_empty()).then_some(self.token.as_str())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Config {
    /// Defaults, then `path` (or `browser-bridge.toml` when present), then
    /// `BRIDGE__SECTION__KEY` environment variables. The token falls back to
    /// [`TOKEN_ENV`].
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("browser-bridge").required(false),
        };

        let mut cfg: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("BRIDGE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        if cfg.channel.token.is_empty() {
            if let Ok(token) = std::env::var(TOKEN_ENV) {
                cfg.channel.token = token;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_helper_protocol() {
        let cfg = Config::default();
        assert_eq!(cfg.channel.port, 4777);
        assert_eq!(cfg.channel.max_line_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.ring.max_width * cfg.ring.max_height, 1920 * 1080);
        assert!(cfg.channel.token().is_none());
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("bb-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bridge.toml");
        std::fs::write(
            &path,
            "[channel]\nport = 5000\ntoken = \"s3cret\"\n[ring]\nmax_width = 640\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.channel.port, 5000);
        assert_eq!(cfg.channel.token(), Some("s3cret"));
        assert_eq!(cfg.ring.max_width, 640);
        assert_eq!(cfg.ring.max_height, 1080);

        std::fs::remove_dir_all(&dir).ok();
    }
}
