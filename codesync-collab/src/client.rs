//! WebSocket transport client for the relay.
//!
//! Provides:
//! - Connection lifecycle (start, explicit disconnect, reconnect with backoff)
//! - Fire-and-forget frame sending that never blocks the caller
//! - Offline queue for operations produced while disconnected
//! - Heartbeat pings
//!
//! The client knows nothing about documents. It moves [`Frame`]s and
//! reports [`TransportEvent`]s; the session layer decides what they mean.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{ChannelKey, Envelope, Frame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running, either never started or explicitly disconnected.
    Disconnected,
    Connecting,
    Connected,
    /// Lost the connection, waiting out a backoff delay.
    Reconnecting,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Frame(Frame),
}

// ───────────────────────────────────────────────────────────────────
// Backoff
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 2,
            max: Duration::from_secs(10),
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial;
        Self { config, next }
    }

    /// Delay before the next attempt. Grows until `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .saturating_mul(self.config.multiplier.max(1))
            .min(self.config.max);
        delay
    }

    /// Back to `initial` after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.config.initial;
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Operation frames produced while disconnected, replayed per channel
/// after that channel has resynchronized.
pub struct OfflineQueue {
    queue: VecDeque<Frame>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a frame for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Remove and return the frames of one channel, oldest first.
    pub fn drain_channel(&mut self, key: &ChannelKey) -> Vec<Frame> {
        let (taken, kept): (Vec<Frame>, Vec<Frame>) =
            self.queue.drain(..).partition(|f| &f.channel == key);
        self.queue = kept.into();
        taken
    }

    /// Drain everything.
    pub fn drain(&mut self) -> Vec<Frame> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub offline_queue_capacity: usize,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            ping_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            offline_queue_capacity: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}

/// The live writer, tagged with the supervisor run that owns it.
struct Link {
    /// Bumped by every `start` and `disconnect`; a supervisor whose
    /// generation is no longer current must not touch shared state.
    generation: u64,
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

/// State shared between the handle and the supervisor task.
struct Shared {
    link: Mutex<Link>,
    offline: Mutex<OfflineQueue>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn offline(&self) -> MutexGuard<'_, OfflineQueue> {
        self.offline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an undeliverable frame. Only operations survive.
    fn park(&self, frame: Frame) {
        if !frame.is_op() {
            log::trace!("Dropping {} on {} while offline", frame.message.kind(), frame.channel);
            return;
        }
        if !self.offline().enqueue(frame) {
            // The document still holds the op; resync sends it later.
            log::warn!("Offline queue full, op will be recovered on resync");
        }
    }

    fn send(&self, frame: Frame) {
        let undelivered = {
            let link = self.link();
            match link.tx.as_ref() {
                Some(tx) => tx.send(frame).err().map(|mpsc::error::SendError(f)| f),
                None => Some(frame),
            }
        };
        if let Some(frame) = undelivered {
            self.park(frame);
        }
    }

    /// Set the state if `generation` is still current.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let link = self.link();
        if link.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Install a fresh writer and announce the connection.
    fn attach(&self, generation: u64, tx: mpsc::UnboundedSender<Frame>) -> bool {
        let mut link = self.link();
        if link.generation != generation {
            return false;
        }
        link.tx = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
        let _ = self.events.send(TransportEvent::Connected);
        true
    }

    /// Drop the writer and move whatever it had not written yet into the
    /// offline queue.
    fn detach(&self, generation: u64, pending: &mut mpsc::UnboundedReceiver<Frame>) {
        {
            let mut link = self.link();
            if link.generation == generation {
                link.tx = None;
                self.state.send_replace(ConnectionState::Reconnecting);
                let _ = self.events.send(TransportEvent::Disconnected);
            }
        }
        pending.close();
        while let Ok(frame) = pending.try_recv() {
            self.park(frame);
        }
    }
}

/// The transport client.
pub struct RelayClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            link: Mutex::new(Link {
                generation: 0,
                tx: None,
            }),
            offline: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
            state,
            events,
        });
        Self {
            config,
            shared,
            event_rx: Some(event_rx),
            stop_tx: None,
        }
    }

    /// A client attached to an in-process link instead of a socket.
    ///
    /// Frames passed to [`RelayClient::send`] come out of the returned
    /// receiver. The state reads `Connected` until `disconnect`.
    pub fn with_link(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let client = Self::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        client.shared.link().tx = Some(tx);
        client.shared.state.send_replace(ConnectionState::Connected);
        (client, rx)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. No-op when already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.stop_tx.is_some() {
            return;
        }
        let generation = {
            let mut link = self.shared.link();
            link.generation += 1;
            self.shared.state.send_replace(ConnectionState::Connecting);
            link.generation
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        tokio::spawn(supervise(
            self.config.clone(),
            self.shared.clone(),
            generation,
            stop_rx,
        ));
        log::info!("Transport started for {}", self.config.url);
    }

    /// Go offline until the next `start`. Subsequent operations queue.
    pub fn disconnect(&mut self) {
        {
            let mut link = self.shared.link();
            link.generation += 1;
            let was_linked = link.tx.take().is_some();
            self.shared.state.send_replace(ConnectionState::Disconnected);
            if was_linked {
                let _ = self.shared.events.send(TransportEvent::Disconnected);
            }
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        log::info!("Transport disconnected by request");
    }

    /// Hand a frame to the transport. Never blocks.
    ///
    /// While offline, operation frames go to the offline queue and all
    /// other frames are dropped.
    pub fn send(&self, frame: Frame) {
        self.shared.send(frame);
    }

    /// Queue an operation frame without trying the link.
    pub fn queue_offline(&self, frame: Frame) -> bool {
        self.shared.offline().enqueue(frame)
    }

    /// A cloneable handle that sends through this client.
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            shared: self.shared.clone(),
        }
    }

    /// Remove queued frames of `key` for replay.
    pub fn drain_offline(&self, key: &ChannelKey) -> Vec<Frame> {
        self.shared.offline().drain_channel(key)
    }

    pub fn offline_len(&self) -> usize {
        self.shared.offline().len()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
    }
}

/// Cloneable sending half of a [`RelayClient`].
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Same as [`RelayClient::send`].
    pub fn send(&self, frame: Frame) {
        self.shared.send(frame);
    }

    /// Same as [`RelayClient::queue_offline`].
    pub fn queue_offline(&self, frame: Frame) -> bool {
        self.shared.offline().enqueue(frame)
    }
}

/// Connect, pump, and reconnect until stopped.
async fn supervise(
    config: ClientConfig,
    shared: Arc<Shared>,
    generation: u64,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.backoff.clone());

    loop {
        if !shared.set_state(generation, ConnectionState::Connecting) {
            break;
        }
        let attempt = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(config.url.as_str()),
        );

        let connected = tokio::select! {
            result = attempt => result,
            _ = stop.changed() => break,
        };

        match connected {
            Ok(Ok((ws_stream, _))) => {
                backoff.reset();
                let (tx, mut rx) = mpsc::unbounded_channel();
                if !shared.attach(generation, tx) {
                    break;
                }
                log::info!("Connected to {}", config.url);

                let stopped = pump(ws_stream, &mut rx, &shared.events, &mut stop, config.ping_interval).await;

                shared.detach(generation, &mut rx);
                if stopped {
                    break;
                }
                log::warn!("Lost connection to {}", config.url);
            }
            Ok(Err(e)) => log::warn!("Connect to {} failed: {e}", config.url),
            Err(_) => log::warn!("Connect to {} timed out", config.url),
        }

        if !shared.set_state(generation, ConnectionState::Reconnecting) {
            break;
        }
        let delay = backoff.next_delay();
        log::debug!("Reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }

    log::debug!("Transport supervisor {generation} exited");
}

/// Move frames both ways until the socket fails or `stop` fires.
/// Returns `true` when stopped on request.
async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    outgoing: &mut mpsc::UnboundedReceiver<Frame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    stop: &mut watch::Receiver<bool>,
    ping_interval: Duration,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws_stream.split();
    let mut ping = tokio::time::interval(ping_interval);
    // The first tick completes immediately
    ping.tick().await;
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                let _ = writer.send(WsMessage::Close(None)).await;
                return true;
            }

            Some(frame) = outgoing.recv() => {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode {}: {e}", frame.message.kind());
                        continue;
                    }
                };
                if let Err(e) = writer.send(WsMessage::Binary(bytes.into())).await {
                    log::warn!("Write failed: {e}");
                    return false;
                }
            }

            msg = reader.next() => {
                last_heard = Instant::now();
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => match Envelope::decode(&data) {
                        Ok(Envelope::Frame(frame)) => {
                            let _ = events.send(TransportEvent::Frame(frame));
                        }
                        Ok(Envelope::Ping) => {
                            if let Ok(pong) = Envelope::Pong.encode() {
                                if writer.send(WsMessage::Binary(pong.into())).await.is_err() {
                                    return false;
                                }
                            }
                        }
                        Ok(Envelope::Pong) => {}
                        Err(e) => log::warn!("Dropping malformed frame: {e}"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return false,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return false;
                    }
                    Some(Ok(_)) => {}
                }
            }

            _ = ping.tick() => {
                if last_heard.elapsed() > ping_interval * 3 {
                    log::warn!("Relay silent for {:?}, dropping connection", last_heard.elapsed());
                    return false;
                }
                if let Ok(bytes) = Envelope::Ping.encode() {
                    if writer.send(WsMessage::Binary(bytes.into())).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
