//! Browser bridge host: drives one browser source and reports frame delivery

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use browser_bridge::bridge::{
    BridgeManager, BrowserSource, CommandLauncher, HelperLauncher, TextureSink,
};
use browser_bridge::Config;
use color_eyre::Result;
use flume::{bounded, Sender};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Uploaded frame summary handed to the compositor task.
#[derive(Debug, Clone, Copy)]
struct Uploaded {
    width: u32,
    height: u32,
    bytes: usize,
}

/// Stands in for a GPU texture: forwards what would be uploaded.
struct ForwardingSink {
    tx: Sender<Uploaded>,
}

impl TextureSink for ForwardingSink {
    fn recreate(&mut self, width: u32, height: u32) {
        info!("Texture resized to {}x{}", width, height);
    }

    fn upload(&mut self, bgra: &[u8], width: u32, height: u32) {
        // Compositor lagging behind only costs a dropped summary.
        let _ = self.tx.try_send(Uploaded {
            width,
            height,
            bytes: bgra.len(),
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("browser_bridge=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Browser bridge launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    browser_bridge::CONFIG.store(Arc::new(config.clone()));

    let launcher = CommandLauncher::from_config(&config.bridge)
        .map(|l| Arc::new(l) as Arc<dyn HelperLauncher>);
    if launcher.is_none() {
        info!("No helper_path configured, only connecting to a running helper");
    }
    let manager = Arc::new(BridgeManager::new(config.clone(), launcher));

    // Set up tx/rx
    let (tx, rx) = bounded::<Uploaded>(config.bridge.source.fps.max(1) as usize);

    // Spawn compositor task
    let compositor = tokio::spawn(async move {
        let mut frames = 0u64;
        let mut bytes = 0u64;
        let mut last = None;
        while let Ok(up) = rx.recv_async().await {
            frames += 1;
            bytes += up.bytes as u64;
            if last != Some((up.width, up.height)) {
                info!("Compositing {}x{} frames", up.width, up.height);
                last = Some((up.width, up.height));
            }
        }
        info!("Compositor saw {} frames ({} bytes)", frames, bytes);
    });

    let settings = config.bridge.source.clone();
    let fps = settings.fps.max(1);
    let mut source =
        BrowserSource::new(manager.clone(), settings, Box::new(ForwardingSink { tx }))?;
    source.show();
    source.activate();

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(fps)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                source.tick().await;
            }
            _ = report.tick() => {
                let stats = source.stats();
                info!(
                    "{}: shm={} channel={} reconnects={} shm_connected={} helper_connected={}",
                    source.id(),
                    stats.shm_frames,
                    stats.channel_frames,
                    stats.shm_reconnects,
                    source.shm_connected(),
                    manager.is_connected()
                );
                if let Some(channel) = manager.channel_stats() {
                    info!("Channel: {:?}", channel);
                }
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    info!("Browser bridge shutting down");
    source.close().await;
    drop(source);
    manager.shutdown().await;
    let _ = compositor.await;
    Ok(())
}
