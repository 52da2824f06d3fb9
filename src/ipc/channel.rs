//! TCP transport for the line protocol
//!
//! One background task per connection owns the read half and the receive
//! buffer. Writers share the write half behind an async mutex so concurrent
//! senders never interleave partial lines.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use crossbeam::utils::CachePadded;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::protocol::{encode_command, parse_inbound, Command, FrameReady, Inbound};
use crate::error::{BridgeError, Result};
use crate::ChannelConfig;

/// Invoked on the receive task with (id, BGRA bytes, width, height). The
/// decoded buffer is handed over by value.
///
/// Runs inline with the socket reads, so it should hand the frame off and
/// return.
pub type FrameCallback = Arc<dyn Fn(&str, Vec<u8>, u32, u32) + Send + Sync>;

const EVENT_QUEUE: usize = 64;

/// Non-frame messages from the helper, plus `Closed` when the receive task ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    HelperError(String),
    HandshakeAck,
    Authenticated { status: String },
    HelperReady,
    BrowserReady(String),
    BrowserCreated(String),
    Pong,
    Closed,
}

/// Snapshot of the receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub lines: u64,
    pub frames_delivered: u64,
    pub frames_rejected: u64,
    pub malformed: u64,
    pub overflows: u64,
}

#[derive(Default)]
struct Counters {
    lines: AtomicU64,
    frames_delivered: AtomicU64,
    frames_rejected: AtomicU64,
    malformed: AtomicU64,
    overflows: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            lines: self.lines.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Connected line channel to the helper.
pub struct LineChannel {
    peer: String,
    client_name: String,
    token: Option<String>,
    writer: AsyncMutex<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<CachePadded<Counters>>,
    events: flume::Receiver<ChannelEvent>,
    join_timeout: Duration,
}

impl LineChannel {
    /// Connect to `config.host:config.port`, retrying every
    /// `retry_interval_ms` until `connect_timeout` runs out, then start the
    /// receive task.
    #[instrument(skip(config, on_frame), fields(host = %config.host, port = config.port))]
    pub async fn connect(
        config: &ChannelConfig,
        connect_timeout: Duration,
        on_frame: FrameCallback,
    ) -> Result<Self> {
        let peer = format!("{}:{}", config.host, config.port);
        let deadline = Instant::now() + connect_timeout;
        let retry = config.retry_interval();

        let mut attempts = 0u32;
        let stream = loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let err = match timeout(remaining, TcpStream::connect(peer.as_str())).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {peer} timed out"),
                ),
            };
            if Instant::now() + retry >= deadline {
                debug!("Giving up on {} after {} attempts: {}", peer, attempts, err);
                return Err(err.into());
            }
            sleep(retry).await;
        };

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CachePadded::new(Counters::default()));
        let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ReceiveContext {
            on_frame,
            events: events_tx,
            counters: counters.clone(),
            connected: connected.clone(),
            max_line_bytes: config.max_line_bytes,
            read_chunk_bytes: config.read_chunk_bytes.max(1),
        };
        let task = tokio::spawn(receive_loop(reader, ctx, shutdown_rx));

        info!("Connected to helper at {} ({} attempts)", peer, attempts);

        Ok(Self {
            peer,
            client_name: config.client_name.clone(),
            token: config.token().map(str::to_owned),
            writer: AsyncMutex::new(writer),
            connected,
            shutdown: shutdown_tx,
            receive_task: Mutex::new(Some(task)),
            counters,
            events: events_rx,
            join_timeout: config.poll_timeout(),
        })
    }

    /// Write one complete line. A write error marks the channel disconnected.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        if line.contains('\n') {
            return Err(BridgeError::MalformedMessage(
                "outbound line contains a newline".into(),
            ));
        }

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&data).await {
            self.connected.store(false, Ordering::Release);
            error!("Send to {} failed: {}", self.peer, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a command with the configured token attached.
    pub async fn send(&self, command: &Command<'_>) -> Result<()> {
        let line = encode_command(command, self.token.as_deref())?;
        debug!("Sending {}", command.name());
        self.send_line(&line).await
    }

    /// Authenticate with the helper. Does not wait for the acknowledgement.
    pub async fn send_handshake(&self, token: Option<&str>) -> Result<()> {
        info!(
            "Sending handshake with token={}",
            if token.is_some() { "(provided)" } else { "(none)" }
        );
        let line = encode_command(
            &Command::Handshake {
                client: &self.client_name,
            },
            token,
        )?;
        self.send_line(&line).await
    }

    /// Stop the receive task and close the socket. Waits at most the poll
    /// timeout for the task before aborting it.
    pub async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.shutdown.send_replace(true);

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if timeout(self.join_timeout, &mut task).await.is_err() {
                warn!("Receive task for {} did not stop in time, aborting", self.peer);
                task.abort();
            }
        }

        if was_connected {
            info!("Disconnected from helper at {}", self.peer);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    /// Status messages from the helper. Events are dropped when nobody drains
    /// the queue.
    pub fn events(&self) -> flume::Receiver<ChannelEvent> {
        self.events.clone()
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self
            .receive_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("stats", &self.stats())
            .finish()
    }
}

struct ReceiveContext {
    on_frame: FrameCallback,
    events: flume::Sender<ChannelEvent>,
    counters: Arc<CachePadded<Counters>>,
    connected: Arc<AtomicBool>,
    max_line_bytes: usize,
    read_chunk_bytes: usize,
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    ctx: ReceiveContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(ctx.read_chunk_bytes);
    // Bytes already searched for a terminator.
    let mut scanned = 0usize;
    // Dropping the tail of an oversized line.
    let mut discarding = false;

    loop {
        buf.reserve(ctx.read_chunk_bytes);
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            r = reader.read_buf(&mut buf) => r,
        };
        match read {
            Ok(0) => {
                info!("Helper closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        }

        if discarding {
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.advance(pos + 1);
                    discarding = false;
                    scanned = 0;
                }
                None => {
                    buf.clear();
                    continue;
                }
            }
        }

        while let Some(pos) = buf[scanned..].iter().position(|&b| b == b'\n') {
            let line = buf.split_to(scanned + pos + 1);
            scanned = 0;
            ctx.handle_line(&line[..line.len() - 1]);
        }
        scanned = buf.len();

        if buf.len() > ctx.max_line_bytes {
            ctx.counters.overflows.fetch_add(1, Ordering::Relaxed);
            let err = BridgeError::LineTooLong {
                limit: ctx.max_line_bytes,
            };
            warn!("Discarding {} buffered bytes: {}", buf.len(), err);
            buf.clear();
            scanned = 0;
            discarding = true;
        }
    }

    ctx.connected.store(false, Ordering::Release);
    let _ = ctx.events.try_send(ChannelEvent::Closed);
    debug!("Receive task finished");
}

impl ReceiveContext {
    fn handle_line(&self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        self.counters.lines.fetch_add(1, Ordering::Relaxed);

        let Ok(text) = std::str::from_utf8(line) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping non UTF-8 line ({} bytes)", line.len());
            return;
        };

        match parse_inbound(text) {
            Ok(Inbound::FrameReady(frame)) => self.deliver(frame),
            Ok(other) => self.dispatch(other),
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed message: {}", e);
            }
        }
    }

    fn deliver(&self, frame: FrameReady<'_>) {
        match frame.decode() {
            Ok(pixels) => {
                let n = self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("bridge_frames_received").increment(1);
                if n % 300 == 1 {
                    debug!(
                        "Received frame #{} for {} ({}x{})",
                        n, frame.id, frame.width, frame.height
                    );
                }
                (self.on_frame)(&*frame.id, pixels, frame.width, frame.height);
            }
            Err(e) => {
                self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("bridge_frames_rejected").increment(1);
                warn!(
                    "Rejected frame for {} ({}x{}, {} base64 bytes): {}",
                    frame.id,
                    frame.width,
                    frame.height,
                    frame.data.len(),
                    e
                );
            }
        }
    }

    fn dispatch(&self, msg: Inbound<'_>) {
        let event = match msg {
            Inbound::Error { message } => {
                warn!("Helper error: {}", message);
                ChannelEvent::HelperError(message)
            }
            Inbound::HandshakeAck => ChannelEvent::HandshakeAck,
            Inbound::Authenticated { status } => {
                info!("Helper authenticated the connection: {}", status);
                ChannelEvent::Authenticated { status }
            }
            Inbound::HelperReady => {
                info!("Helper ready");
                ChannelEvent::HelperReady
            }
            Inbound::BrowserReady { id } => {
                info!("Browser ready: {}", id);
                ChannelEvent::BrowserReady(id)
            }
            Inbound::BrowserCreated { id } => {
                debug!("Browser created: {}", id);
                ChannelEvent::BrowserCreated(id)
            }
            Inbound::Pong => ChannelEvent::Pong,
            Inbound::Unknown(kind) => {
                debug!("Ignoring message of unknown type {:?}", kind);
                return;
            }
            Inbound::FrameReady(_) => return,
        };
        let _ = self.events.try_send(event);
    }
}
