use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use browser_bridge::bridge::{
    BridgeManager, BrowserSource, HelperLauncher, HelperProcess, TextureSink, Transport,
};
use browser_bridge::ipc::encode_frame_message;
use browser_bridge::shm::ShmFrameWriter;
use browser_bridge::{ChannelConfig, Config, Result, SourceSettings};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct SinkLog {
    recreated: Vec<(u32, u32)>,
    uploads: Vec<(u32, u32, Vec<u8>)>,
    released: bool,
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<SinkLog>>);

impl TextureSink for RecordingSink {
    fn recreate(&mut self, width: u32, height: u32) {
        self.0.lock().unwrap().recreated.push((width, height));
    }

    fn upload(&mut self, bgra: &[u8], width: u32, height: u32) {
        self.0
            .lock()
            .unwrap()
            .uploads
            .push((width, height, bgra.to_vec()));
    }

    fn release(&mut self) {
        self.0.lock().unwrap().released = true;
    }
}

struct FakeHelper {
    lines: flume::Receiver<Value>,
    writer: OwnedWriteHalf,
}

impl FakeHelper {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, writer) = stream.into_split();
        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(serde_json::from_str::<Value>(&line).unwrap());
            }
        });
        Self { lines: rx, writer }
    }

    async fn next(&self) -> Value {
        timeout(Duration::from_secs(2), self.lines.recv_async())
            .await
            .expect("no message from bridge")
            .unwrap()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }
}

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn test_config(port: u16, prefix: &str) -> Config {
    let mut config = Config::default();
    config.channel.port = port;
    config.channel.probe_timeout_ms = 300;
    config.channel.connect_timeout_ms = 1000;
    config.channel.retry_interval_ms = 20;
    config.ring.name_prefix = prefix.into();
    config.ring.max_width = 16;
    config.ring.max_height = 16;
    config.bridge.launch_grace_ms = 10;
    config.bridge.shm_retry_ms = 0;
    config
}

fn settings() -> SourceSettings {
    SourceSettings {
        url: "https://example.com/overlay".into(),
        width: 4,
        height: 4,
        ..SourceSettings::default()
    }
}

async fn tick_until(source: &mut BrowserSource, want: Transport) {
    timeout(Duration::from_secs(2), async {
        while source.tick().await != Some(want) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transport never delivered a frame");
}

/// Starts the source and returns the helper side once `initBrowser` arrived.
async fn start(
    manager: &Arc<BridgeManager>,
    listener: TcpListener,
    sink: RecordingSink,
) -> (BrowserSource, FakeHelper) {
    let mut source = BrowserSource::new(manager.clone(), settings(), Box::new(sink)).unwrap();
    source.show();
    let (_, helper) = tokio::join!(source.tick(), FakeHelper::accept(listener));
    assert!(source.is_initialized());
    (source, helper)
}

#[tokio::test]
async fn channel_frames_reach_the_texture() {
    let (listener, port) = listen().await;
    let mut config = test_config(port, "/bb_it_bridge_ch_");
    config.channel.token = "tok".into();
    let manager = Arc::new(BridgeManager::new(config, None));
    let sink = RecordingSink::default();

    let (mut source, mut helper) = start(&manager, listener, sink.clone()).await;

    let handshake = helper.next().await;
    assert_eq!(handshake["type"], "handshake");
    assert_eq!(handshake["client"], "browser-bridge");
    assert_eq!(handshake["token"], "tok");

    let init = helper.next().await;
    assert_eq!(init["type"], "initBrowser");
    assert_eq!(init["id"], source.id());
    assert_eq!(init["url"], "https://example.com/overlay");
    assert_eq!(init["token"], "tok");

    let px: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
    helper
        .send(&encode_frame_message(source.id(), 4, 4, &px, true).unwrap())
        .await;
    // Frames for browsers nobody registered are ignored.
    helper
        .send(&encode_frame_message("browser_unknown", 1, 1, &[0; 4], false).unwrap())
        .await;

    tick_until(&mut source, Transport::Channel).await;

    let log = sink.0.lock().unwrap();
    assert_eq!(log.recreated, vec![(4, 4)]);
    assert_eq!(log.uploads, vec![(4, 4, px)]);
    assert_eq!(source.stats().channel_frames, 1);
}

#[tokio::test]
async fn shared_memory_is_preferred_once_available() {
    let (listener, port) = listen().await;
    let config = test_config(port, "/bb_it_bridge_shm_");
    let ring = config.ring.clone();
    let manager = Arc::new(BridgeManager::new(config, None));
    let sink = RecordingSink::default();

    let (mut source, mut helper) = start(&manager, listener, sink.clone()).await;
    assert_eq!(helper.next().await["type"], "initBrowser");

    let mut writer = ShmFrameWriter::create(source.id(), 8, 8, &ring).unwrap();
    writer.write_frame(&[0xAB; 8 * 8 * 4], 8, 8).unwrap();
    helper
        .send(&encode_frame_message(source.id(), 1, 1, &[1; 4], false).unwrap())
        .await;

    tick_until(&mut source, Transport::SharedMemory).await;
    assert!(source.shm_connected());
    assert_eq!(source.texture_size(), Some((8, 8)));

    writer.write_frame(&[0xCD; 4 * 4 * 4], 4, 4).unwrap();
    tick_until(&mut source, Transport::SharedMemory).await;

    let log = sink.0.lock().unwrap();
    assert_eq!(log.recreated, vec![(8, 8), (4, 4)]);
    assert_eq!(log.uploads.len(), 2);
    assert!(log.uploads[1].2.iter().all(|&b| b == 0xCD));
    assert_eq!(source.stats().shm_frames, 2);
}

#[tokio::test]
async fn stale_ring_is_reconnected() {
    let (listener, port) = listen().await;
    let mut config = test_config(port, "/bb_it_bridge_stale_");
    config.bridge.shm_stale_ms = 50;
    let ring = config.ring.clone();
    let manager = Arc::new(BridgeManager::new(config, None));

    let (mut source, _helper) = start(&manager, listener, RecordingSink::default()).await;

    let mut first = ShmFrameWriter::create(source.id(), 2, 2, &ring).unwrap();
    first.write_frame(&[1; 16], 2, 2).unwrap();
    tick_until(&mut source, Transport::SharedMemory).await;

    // The helper restarts the browser: a new region replaces the old one.
    first.destroy();
    let mut second = ShmFrameWriter::create(source.id(), 2, 2, &ring).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(source.tick().await, None);
    assert_eq!(source.stats().shm_reconnects, 1);

    second.write_frame(&[2; 16], 2, 2).unwrap();
    tick_until(&mut source, Transport::SharedMemory).await;
    assert_eq!(source.stats().shm_frames, 2);
}

#[tokio::test]
async fn settings_changes_update_the_running_browser() {
    let (listener, port) = listen().await;
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_upd_"),
        None,
    ));
    let (mut source, helper) = start(&manager, listener, RecordingSink::default()).await;
    assert_eq!(helper.next().await["type"], "initBrowser");

    let mut next = settings();
    next.url = "https://example.com/other".into();
    source.apply_settings(next.clone()).await.unwrap();
    let update = helper.next().await;
    assert_eq!(update["type"], "updateBrowser");
    assert_eq!(update["id"], source.id());
    assert_eq!(update["url"], "https://example.com/other");

    next.width = 8;
    source.apply_settings(next.clone()).await.unwrap();
    let update = helper.next().await;
    assert!(update.get("url").is_none());
    assert_eq!(update["width"], 8);

    // Unchanged settings send nothing; the next message is the dispose.
    source.apply_settings(next).await.unwrap();
    source.close().await;
    assert_eq!(helper.next().await["type"], "disposeBrowser");
}

#[tokio::test]
async fn hidden_source_disposes_when_configured() {
    let (listener, port) = listen().await;
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_hide_"),
        None,
    ));
    let mut source = BrowserSource::new(
        manager.clone(),
        SourceSettings {
            shutdown_on_hidden: true,
            ..settings()
        },
        Box::new(RecordingSink::default()),
    )
    .unwrap();
    source.show();
    let (_, helper) = tokio::join!(source.tick(), FakeHelper::accept(listener));
    assert_eq!(helper.next().await["type"], "initBrowser");

    source.hide().await;
    assert!(!source.is_initialized());
    let dispose = helper.next().await;
    assert_eq!(dispose["type"], "disposeBrowser");
    assert_eq!(dispose["id"], source.id());

    source.show();
    assert!(source.init_pending());
}

#[tokio::test]
async fn missing_helper_keeps_init_pending() {
    let (listener, port) = listen().await;
    drop(listener);
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_none_"),
        None,
    ));

    let err = manager.ensure_initialized().await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    let mut source =
        BrowserSource::new(manager.clone(), settings(), Box::new(RecordingSink::default()))
            .unwrap();
    source.show();
    assert_eq!(source.tick().await, None);
    assert!(!source.is_initialized());
    assert!(source.init_pending());
}

struct FakeProcess {
    stopped: Arc<AtomicBool>,
}

impl HelperProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Starts listening on the configured port when launched, like the real helper.
struct ListenOnLaunch {
    launches: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
    helpers: flume::Sender<FakeHelper>,
}

impl HelperLauncher for ListenOnLaunch {
    fn launch(&self, channel: &ChannelConfig) -> Result<Box<dyn HelperProcess>> {
        let listener = std::net::TcpListener::bind((channel.host.as_str(), channel.port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let helpers = self.helpers.clone();
        tokio::spawn(async move {
            let _ = helpers.send(FakeHelper::accept(listener).await);
        });
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            stopped: self.stopped.clone(),
        }))
    }
}

#[tokio::test]
async fn launches_helper_when_none_is_running() {
    let (listener, port) = listen().await;
    drop(listener);

    let launches = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicBool::new(false));
    let (helpers_tx, helpers_rx) = flume::unbounded();
    let launcher = ListenOnLaunch {
        launches: launches.clone(),
        stopped: stopped.clone(),
        helpers: helpers_tx,
    };
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_launch_"),
        Some(Arc::new(launcher)),
    ));

    manager.ensure_initialized().await.unwrap();
    assert!(manager.is_connected());
    assert_eq!(manager.connection_generation(), 1);
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    // Already connected: no second launch.
    manager.ensure_initialized().await.unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    let helper = timeout(Duration::from_secs(2), helpers_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    manager.shutdown().await;
    assert_eq!(helper.next().await["type"], "shutdown");
    assert!(stopped.load(Ordering::SeqCst));
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn shutdown_disposes_every_registered_browser() {
    let (listener, port) = listen().await;
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_down_"),
        None,
    ));
    let a = BrowserSource::new(manager.clone(), settings(), Box::new(RecordingSink::default()))
        .unwrap();
    let b = BrowserSource::new(manager.clone(), settings(), Box::new(RecordingSink::default()))
        .unwrap();

    let (connected, helper) =
        tokio::join!(manager.ensure_initialized(), FakeHelper::accept(listener));
    connected.unwrap();

    manager.shutdown().await;
    let mut disposed = HashSet::new();
    for _ in 0..2 {
        let msg = helper.next().await;
        assert_eq!(msg["type"], "disposeBrowser");
        disposed.insert(msg["id"].as_str().unwrap().to_owned());
    }
    assert_eq!(
        disposed,
        HashSet::from([a.id().to_owned(), b.id().to_owned()])
    );

    // Live sources keep their routes; they go away with the sources.
    assert_eq!(manager.registered_sources().len(), 2);
    drop(a);
    drop(b);
    assert!(manager.registered_sources().is_empty());
}

#[tokio::test]
async fn source_receives_frames_after_manager_restart() {
    let (listener, port) = listen().await;
    let manager = Arc::new(BridgeManager::new(
        test_config(port, "/bb_it_bridge_restart_"),
        None,
    ));
    let sink = RecordingSink::default();
    let (mut source, helper) = start(&manager, listener, sink.clone()).await;
    assert_eq!(helper.next().await["type"], "initBrowser");

    manager.shutdown().await;
    assert_eq!(helper.next().await["type"], "disposeBrowser");
    assert!(!manager.is_connected());

    // The helper comes back on the same port; the next tick re-creates the browser.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (_, mut helper) = tokio::join!(source.tick(), FakeHelper::accept(listener));
    assert!(source.is_initialized());
    assert!(manager.is_connected());
    let init = helper.next().await;
    assert_eq!(init["type"], "initBrowser");
    assert_eq!(init["id"], source.id());

    let px = vec![0x5A; 4 * 4 * 4];
    helper
        .send(&encode_frame_message(source.id(), 4, 4, &px, false).unwrap())
        .await;
    tick_until(&mut source, Transport::Channel).await;

    let log = sink.0.lock().unwrap();
    assert_eq!(log.uploads, vec![(4, 4, px)]);
}
