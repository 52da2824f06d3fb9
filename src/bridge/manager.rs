//! Owns the connection to the browser helper and routes its frames to sources

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use super::mailbox::FrameMailbox;
use crate::error::{BridgeError, Result};
use crate::ipc::{ChannelEvent, ChannelStats, Command, FrameCallback, LineChannel};
use crate::{BridgeConfig, ChannelConfig, Config, Frame, SourceSettings, TOKEN_ENV};

/// Starts the helper process. The manager only decides *when*.
pub trait HelperLauncher: Send + Sync {
    fn launch(&self, channel: &ChannelConfig) -> Result<Box<dyn HelperProcess>>;
}

/// A running helper started by a [`HelperLauncher`].
pub trait HelperProcess: Send {
    fn id(&self) -> Option<u32>;
    fn is_running(&mut self) -> bool;
    /// Ask the process to exit. Must not block.
    fn stop(&mut self);
}

/// Launches the helper executable with `--port=<port>` and the token in its
/// environment.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `None` when no helper path is configured.
    pub fn from_config(config: &BridgeConfig) -> Option<Self> {
        (!config.helper_path.is_empty()).then(|| Self::new(&config.helper_path))
    }
}

impl HelperLauncher for CommandLauncher {
    fn launch(&self, channel: &ChannelConfig) -> Result<Box<dyn HelperProcess>> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg(format!("--port={}", channel.port))
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = channel.token() {
            cmd.env(TOKEN_ENV, token);
        }

        let child = cmd.spawn()?;
        info!(
            "Launched helper {} (pid {:?}) on port {}",
            self.program.display(),
            child.id(),
            channel.port
        );
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(tokio::process::Child);

impl HelperProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    fn stop(&mut self) {
        if let Err(e) = self.0.start_kill() {
            debug!("Helper already gone: {}", e);
        }
    }
}

type Routes = HashMap<Arc<str>, Arc<FrameMailbox>>;

/// One per host process (or per test). Connects lazily on the first
/// browser and survives helper restarts by reconnecting on demand.
pub struct BridgeManager {
    config: Config,
    launcher: Option<Arc<dyn HelperLauncher>>,
    channel: ArcSwapOption<LineChannel>,
    /// Serializes connect/shutdown and owns the helper we launched, if any.
    helper: AsyncMutex<Option<Box<dyn HelperProcess>>>,
    routes: Arc<ArcSwap<Routes>>,
    sequence: Arc<AtomicU64>,
    generation: AtomicU64,
}

impl BridgeManager {
    pub fn new(config: Config, launcher: Option<Arc<dyn HelperLauncher>>) -> Self {
        Self {
            config,
            launcher,
            channel: ArcSwapOption::empty(),
            helper: AsyncMutex::new(None),
            routes: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to the helper, launching it first when nothing is listening.
    #[instrument(skip(self), fields(port = self.config.channel.port))]
    pub async fn ensure_initialized(&self) -> Result<()> {
        let mut helper = self.helper.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.channel.swap(None) {
            warn!("Helper connection to {} was lost, reconnecting", stale.peer());
            stale.disconnect().await;
        }

        let cfg = &self.config.channel;
        let probe = Duration::from_millis(cfg.probe_timeout_ms);
        info!("Trying existing helper on port {}", cfg.port);

        let channel = match LineChannel::connect(cfg, probe, self.frame_router()).await {
            Ok(channel) => {
                info!("Connected to existing helper on port {}", cfg.port);
                channel
            }
            Err(probe_err) => {
                let Some(launcher) = &self.launcher else {
                    warn!("No helper on port {} and no launcher configured", cfg.port);
                    return Err(probe_err);
                };
                if let Some(mut old) = helper.take() {
                    old.stop();
                }

                let mut process = launcher.launch(cfg)?;
                tokio::time::sleep(Duration::from_millis(self.config.bridge.launch_grace_ms))
                    .await;

                let timeout = Duration::from_millis(cfg.connect_timeout_ms);
                match LineChannel::connect(cfg, timeout, self.frame_router()).await {
                    Ok(channel) => {
                        *helper = Some(process);
                        channel
                    }
                    Err(e) => {
                        error!("Failed to connect to launched helper on port {}: {}", cfg.port, e);
                        process.stop();
                        return Err(e);
                    }
                }
            }
        };

        if let Some(token) = cfg.token() {
            channel.send_handshake(Some(token)).await?;
        }

        self.channel.store(Some(Arc::new(channel)));
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Route frames for `id` into a fresh mailbox.
    pub fn register_source(&self, id: &str) -> Arc<FrameMailbox> {
        let mailbox = Arc::new(FrameMailbox::new());
        let key: Arc<str> = Arc::from(id);
        self.routes.rcu(|routes| {
            let mut routes = Routes::clone(routes);
            routes.insert(key.clone(), mailbox.clone());
            routes
        });
        debug!("Registered source {}", id);
        mailbox
    }

    pub fn unregister_source(&self, id: &str) {
        self.routes.rcu(|routes| {
            let mut routes = Routes::clone(routes);
            routes.remove(id);
            routes
        });
        debug!("Unregistered source {}", id);
    }

    pub fn registered_sources(&self) -> Vec<Arc<str>> {
        self.routes.load().keys().cloned().collect()
    }

    /// Create a browser in the helper. Connects first if needed.
    pub async fn init_browser(&self, id: &str, settings: &SourceSettings) -> Result<()> {
        self.ensure_initialized().await?;
        let channel = self.connected_channel()?;

        channel
            .send(&Command::InitBrowser {
                id,
                url: &settings.url,
                width: settings.width,
                height: settings.height,
                fps: settings.fps,
                css: (!settings.css.is_empty()).then_some(settings.css.as_str()),
            })
            .await?;

        info!(
            "Sent initBrowser for {} ({}x{} @{}fps) url={}",
            id, settings.width, settings.height, settings.fps, settings.url
        );
        Ok(())
    }

    /// Change url and/or size of a running browser. `url: None` keeps the page.
    pub async fn update_browser(
        &self,
        id: &str,
        url: Option<&str>,
        width: u32,
        height: u32,
        css: Option<&str>,
    ) -> Result<()> {
        let channel = self.connected_channel()?;
        channel
            .send(&Command::UpdateBrowser {
                id,
                url,
                width,
                height,
                css,
            })
            .await?;
        info!("Sent updateBrowser for {} ({}x{})", id, width, height);
        Ok(())
    }

    /// Best effort; a missing connection means the browser is already gone.
    pub async fn dispose_browser(&self, id: &str) -> Result<()> {
        let Ok(channel) = self.connected_channel() else {
            debug!("Not connected, nothing to dispose for {}", id);
            return Ok(());
        };
        channel.send(&Command::DisposeBrowser { id }).await?;
        info!("Disposed browser {}", id);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.connected_channel()?.send(&Command::Ping).await
    }

    /// Dispose every registered browser, disconnect and stop a helper we
    /// launched. The manager can be initialized again afterwards; routes stay
    /// until their sources unregister.
    pub async fn shutdown(&self) {
        let mut helper = self.helper.lock().await;
        let channel = self.channel.swap(None);
        if channel.is_none() && helper.is_none() {
            return;
        }

        info!("Shutting down");

        if let Some(channel) = channel {
            if channel.is_connected() {
                for id in self.registered_sources() {
                    if let Err(e) = channel.send(&Command::DisposeBrowser { id: &id }).await {
                        warn!("Failed to dispose {}: {}", id, e);
                        break;
                    }
                }
                if helper.is_some() {
                    let _ = channel.send(&Command::Shutdown).await;
                }
            }
            channel.disconnect().await;
        }

        if let Some(mut process) = helper.take() {
            process.stop();
        }

        info!("Shutdown complete");
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .load_full()
            .is_some_and(|channel| channel.is_connected())
    }

    /// Bumped on every successful (re)connect.
    pub fn connection_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn channel_stats(&self) -> Option<ChannelStats> {
        self.channel.load_full().map(|channel| channel.stats())
    }

    pub fn events(&self) -> Option<flume::Receiver<ChannelEvent>> {
        self.channel.load_full().map(|channel| channel.events())
    }

    fn connected_channel(&self) -> Result<Arc<LineChannel>> {
        self.channel
            .load_full()
            .filter(|channel| channel.is_connected())
            .ok_or(BridgeError::Disconnected)
    }

    fn frame_router(&self) -> FrameCallback {
        let routes = self.routes.clone();
        let sequence = self.sequence.clone();

        Arc::new(move |id: &str, pixels: Vec<u8>, width: u32, height: u32| {
            let routes = routes.load();
            let Some((key, mailbox)) = routes.get_key_value(id) else {
                debug!("No source registered for browser {}", id);
                return;
            };
            let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
            match Frame::bgra(key.clone(), seq, width, height, Bytes::from(pixels)) {
                Ok(frame) => {
                    mailbox.push(frame);
                }
                Err(e) => warn!("Dropping frame for {}: {}", id, e),
            }
        })
    }
}

impl std::fmt::Debug for BridgeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeManager")
            .field("connected", &self.is_connected())
            .field("generation", &self.connection_generation())
            .field("sources", &self.routes.load().len())
            .finish()
    }
}
