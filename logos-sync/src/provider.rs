//! Client synchronization session for one room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect with
//!   capped exponential backoff)
//! - Sync handshake with a one-shot `synced` signal
//! - Document and presence broadcast over the network and the cross-tab bus
//! - Liveness watchdog and optional periodic resync
//!
//! ```text
//!   Doc / Awareness observers ──┐
//!   connect() / disconnect() ───┤                 ┌──► link task ◄──► server
//!   link events (epoch tagged) ─┼─► driver task ──┤
//!   cross-tab bus ──────────────┤  (one at a time)└──► CrossTabBus
//!   watchdog / resync timers ───┘
//! ```
//!
//! Everything that mutates session state runs on the driver task, one input
//! at a time, so handlers never re-enter each other.

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;
use yrs::{Doc, Origin, StateVector};

use crate::awareness::{Awareness, AwarenessSubscription, ClientId};
use crate::crosstab::{CrossTabBus, CrossTabMessage};
use crate::dispatch::{self, Outcome};
use crate::lock;
use crate::sync::SyncStep;
use crate::transport::{Connector, Duplex, WebSocketConnector};

/// Connection status reported through [`ProviderEvent::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// The handshake with the server completed (or was reset)
    Synced(bool),
    /// Same transition as `Synced`
    Sync(bool),
    /// The server refused access
    PermissionDenied { reason: String },
    /// A connection (or connection attempt) ended
    ConnectionClose,
    ConnectionError(String),
}

/// Provider configuration.
#[derive(Clone)]
pub struct ProviderOptions {
    /// Connect immediately on construction
    pub connect: bool,
    /// Presence registry to use (a fresh one is created when `None`)
    pub awareness: Option<Arc<Awareness>>,
    /// Query parameters appended to the connection URL
    pub params: BTreeMap<String, String>,
    /// Re-send sync step 1 on this interval while connected
    pub resync_interval: Option<Duration>,
    /// Reconnect delay ceiling
    pub max_backoff_time: Duration,
    /// First reconnect delay; doubles per unsuccessful attempt
    pub backoff_base: Duration,
    /// Close the connection if nothing arrived for this long
    pub message_reconnect_timeout: Duration,
    /// Same-process bus shared with other providers
    pub cross_tab: Option<Arc<CrossTabBus>>,
    /// Connection backend
    pub connector: Arc<dyn Connector>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            connect: true,
            awareness: None,
            params: BTreeMap::new(),
            resync_interval: None,
            max_backoff_time: Duration::from_millis(2500),
            backoff_base: Duration::from_millis(100),
            message_reconnect_timeout: Duration::from_secs(30),
            cross_tab: None,
            connector: Arc::new(WebSocketConnector),
        }
    }
}

/// Delay before the next connection attempt after `attempts` failures:
/// `min(base * 2^attempts, max)`.
pub fn backoff_delay(base: Duration, attempts: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempts)).min(max)
}

/// Build the connection URL and the cross-tab channel name for a room.
///
/// Trailing slashes on `server_url` are ignored. The channel name is the URL
/// without its query string.
pub fn room_url(
    server_url: &str,
    room_name: &str,
    params: &BTreeMap<String, String>,
) -> (String, String) {
    let channel = format!("{}/{}", server_url.trim_end_matches('/'), room_name);
    if params.is_empty() {
        return (channel.clone(), channel);
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    (format!("{channel}?{query}"), channel)
}

/// Local updates produced before the server has seen our state.
struct PendingUpdates {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl PendingUpdates {
    fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_size,
        }
    }

    fn enqueue(&mut self, update: Vec<u8>) {
        if self.queue.len() >= self.max_size {
            self.queue.pop_front();
        }
        self.queue.push_back(update);
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// State readable from the application while the driver owns the session.
struct Shared {
    should_connect: AtomicBool,
    connected: AtomicBool,
    connecting: AtomicBool,
    synced: AtomicBool,
    unsuccessful_reconnects: AtomicU32,
    pending: Mutex<PendingUpdates>,
    events: broadcast::Sender<ProviderEvent>,
}

impl Shared {
    fn emit(&self, event: ProviderEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

enum Input {
    Connect,
    Disconnect,
    Destroy,
    LocalUpdate(Vec<u8>),
    AwarenessChanged(Vec<ClientId>),
    Opened { epoch: u64 },
    Frame { epoch: u64, data: Vec<u8> },
    Closed { epoch: u64, error: Option<String> },
    Reconnect,
}

/// Keeps one room of a Yrs document in sync with a server and with other
/// providers on the same [`CrossTabBus`].
///
/// Must be created inside a tokio runtime. Dropping the provider destroys it.
pub struct WebsocketProvider {
    id: Uuid,
    origin: Origin,
    url: String,
    channel: String,
    room_name: String,
    doc: Doc,
    awareness: Arc<Awareness>,
    shared: Arc<Shared>,
    inputs: mpsc::UnboundedSender<Input>,
    destroyed: AtomicBool,
    doc_subscription: Mutex<Option<yrs::Subscription>>,
    awareness_subscription: Mutex<Option<AwarenessSubscription>>,
}

impl WebsocketProvider {
    pub fn new(server_url: &str, room_name: &str, doc: Doc, options: ProviderOptions) -> Self {
        let id = Uuid::new_v4();
        let origin = Origin::from(format!("provider-{id}").as_str());
        let (url, channel) = room_url(server_url, room_name, &options.params);
        let awareness = options
            .awareness
            .clone()
            .unwrap_or_else(|| Arc::new(Awareness::new()));
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            should_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            unsuccessful_reconnects: AtomicU32::new(0),
            pending: Mutex::new(PendingUpdates::new(10_000)),
            events,
        });
        let (inputs, input_rx) = mpsc::unbounded_channel();

        let doc_subscription = {
            let origin = origin.clone();
            let inputs = inputs.clone();
            let subscription = doc.observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&origin) {
                    return;
                }
                let _ = inputs.send(Input::LocalUpdate(event.update.clone()));
            });
            match subscription {
                Ok(subscription) => Some(subscription),
                Err(_) => {
                    log::error!("Could not observe document updates for {url}");
                    None
                }
            }
        };

        let awareness_subscription = {
            let origin = origin.clone();
            let inputs = inputs.clone();
            awareness.on_update(move |_, changes, change_origin| {
                if change_origin == Some(&origin) {
                    return;
                }
                let _ = inputs.send(Input::AwarenessChanged(changes.all()));
            })
        };

        let driver = Driver {
            id,
            origin: origin.clone(),
            url: url.clone(),
            channel: channel.clone(),
            doc: doc.clone(),
            awareness: awareness.clone(),
            shared: shared.clone(),
            inputs: inputs.clone(),
            connector: options.connector.clone(),
            cross_tab: options.cross_tab.clone(),
            backoff_base: options.backoff_base,
            max_backoff_time: options.max_backoff_time,
            message_reconnect_timeout: options.message_reconnect_timeout,
            epoch: 0,
            link: None,
            last_message: Instant::now(),
            bus: None,
            reconnect: None,
        };
        tokio::spawn(driver.run(input_rx, options.resync_interval));

        let provider = Self {
            id,
            origin,
            url,
            channel,
            room_name: room_name.to_string(),
            doc,
            awareness,
            shared,
            inputs,
            destroyed: AtomicBool::new(false),
            doc_subscription: Mutex::new(doc_subscription),
            awareness_subscription: Mutex::new(Some(awareness_subscription)),
        };
        if options.connect {
            provider.connect();
        }
        provider
    }

    /// Start (or keep) connecting. No-op while connected or connecting.
    pub fn connect(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.shared.should_connect.store(true, Ordering::SeqCst);
        let _ = self.inputs.send(Input::Connect);
    }

    /// Stop connecting and close the connection. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.shared.should_connect.store(false, Ordering::SeqCst);
        let _ = self.inputs.send(Input::Disconnect);
    }

    /// Disconnect, stop all timers and unregister from the document and the
    /// presence registry. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.should_connect.store(false, Ordering::SeqCst);
        lock(&self.doc_subscription).take();
        lock(&self.awareness_subscription).take();
        let _ = self.inputs.send(Input::Destroy);
    }

    /// Subscribe to provider events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events.subscribe()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cross-tab channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// Origin attached to every change this provider applies.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Publisher id used on the cross-tab bus.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn should_connect(&self) -> bool {
        self.shared.should_connect.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::SeqCst)
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    pub fn unsuccessful_reconnects(&self) -> u32 {
        self.shared.unsuccessful_reconnects.load(Ordering::SeqCst)
    }

    /// Local updates the server has not been offered yet.
    pub fn unsynced_changes(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}

impl Drop for WebsocketProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Link {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

struct Driver {
    id: Uuid,
    origin: Origin,
    url: String,
    channel: String,
    doc: Doc,
    awareness: Arc<Awareness>,
    shared: Arc<Shared>,
    inputs: mpsc::UnboundedSender<Input>,
    connector: Arc<dyn Connector>,
    cross_tab: Option<Arc<CrossTabBus>>,
    backoff_base: Duration,
    max_backoff_time: Duration,
    message_reconnect_timeout: Duration,
    /// Bumped whenever the current link is replaced or dropped; events from
    /// older links are ignored.
    epoch: u64,
    link: Option<Link>,
    last_message: Instant,
    bus: Option<broadcast::Receiver<CrossTabMessage>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>, resync: Option<Duration>) {
        let check_period = (self.message_reconnect_timeout / 10).max(Duration::from_millis(10));
        let mut watchdog = tokio::time::interval(check_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut resync = resync
            .filter(|period| !period.is_zero())
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Destroy) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(input) => self.handle(input),
                },
                message = recv_bus(&mut self.bus) => self.on_bus_message(message),
                _ = watchdog.tick() => self.check_liveness(),
                _ = tick(&mut resync) => self.resync(),
            }
        }
        log::debug!("Provider for {} stopped", self.url);
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Connect => self.connect(),
            Input::Disconnect => self.disconnect(),
            Input::LocalUpdate(update) => self.on_local_update(update),
            Input::AwarenessChanged(ids) => {
                let frame = dispatch::awareness_frame(&self.awareness.encode_update(&ids));
                self.broadcast(frame);
            }
            Input::Opened { epoch } if epoch == self.epoch => self.on_opened(),
            Input::Frame { epoch, data } if epoch == self.epoch => {
                self.last_message = Instant::now();
                self.on_network_frame(&data);
            }
            Input::Closed { epoch, error } if epoch == self.epoch => {
                self.link = None;
                self.on_closed(error);
            }
            Input::Reconnect => {
                self.reconnect = None;
                if self.should_connect() && self.link.is_none() {
                    self.open_link();
                }
            }
            Input::Opened { .. } | Input::Frame { .. } | Input::Closed { .. } => {}
            Input::Destroy => {}
        }
    }

    fn should_connect(&self) -> bool {
        self.shared.should_connect.load(Ordering::SeqCst)
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    fn connect(&mut self) {
        if !self.should_connect() {
            return;
        }
        if self.link.is_none() {
            self.open_link();
        }
        self.connect_bus();
    }

    fn open_link(&mut self) {
        self.cancel_reconnect();
        self.epoch += 1;
        let epoch = self.epoch;
        self.shared.connecting.store(true, Ordering::SeqCst);
        self.shared.emit(ProviderEvent::Status(ConnectionStatus::Connecting));
        log::debug!("Connecting to {} (attempt epoch {epoch})", self.url);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            self.connector.clone(),
            self.url.clone(),
            epoch,
            outbound_rx,
            self.inputs.clone(),
        ));
        self.link = Some(Link { outbound, task });
    }

    fn on_opened(&mut self) {
        self.last_message = Instant::now();
        self.shared.connecting.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.unsuccessful_reconnects.store(0, Ordering::SeqCst);
        log::info!("Connected to {}", self.url);
        self.shared.emit(ProviderEvent::Status(ConnectionStatus::Connected));

        self.send_network(dispatch::sync_step1_frame(&self.doc));
        if self.awareness.local_state().is_some() {
            let update = self.awareness.encode_update(&[self.awareness.client_id()]);
            self.send_network(dispatch::awareness_frame(&update));
        }
    }

    fn on_closed(&mut self, error: Option<String>) {
        if let Some(error) = &error {
            log::debug!("Connection to {} failed: {error}", self.url);
            self.shared.emit(ProviderEvent::ConnectionError(error.clone()));
        }
        self.shared.connecting.store(false, Ordering::SeqCst);
        self.shared.emit(ProviderEvent::ConnectionClose);

        if self.shared.connected.swap(false, Ordering::SeqCst) {
            self.set_synced(false);
            self.awareness.remove_remote_states(Some(&self.origin));
            log::info!("Disconnected from {}", self.url);
            self.shared.emit(ProviderEvent::Status(ConnectionStatus::Disconnected));
        } else {
            self.shared.unsuccessful_reconnects.fetch_add(1, Ordering::SeqCst);
        }

        if self.should_connect() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();
        let attempts = self.shared.unsuccessful_reconnects.load(Ordering::SeqCst);
        let delay = backoff_delay(self.backoff_base, attempts, self.max_backoff_time);
        log::debug!("Reconnecting to {} in {delay:?}", self.url);
        let inputs = self.inputs.clone();
        self.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::Reconnect);
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
    }

    /// Drop the current link and run the close path now.
    fn close_link(&mut self, error: Option<String>, abort: bool) {
        let Some(link) = self.link.take() else {
            return;
        };
        if abort {
            link.task.abort();
        }
        // dropping the sender lets the link task close the socket
        drop(link.outbound);
        self.epoch += 1;
        self.on_closed(error);
    }

    fn disconnect(&mut self) {
        self.cancel_reconnect();
        let removal = self
            .awareness
            .encode_removal(&[self.awareness.client_id()]);
        self.broadcast(dispatch::awareness_frame(&removal));
        self.disconnect_bus();
        self.close_link(None, false);
    }

    fn shutdown(&mut self) {
        self.shared.should_connect.store(false, Ordering::SeqCst);
        self.disconnect();
        self.cancel_reconnect();
    }

    // ─── Timers ───────────────────────────────────────────────────────

    fn check_liveness(&mut self) {
        if self.connected() && self.last_message.elapsed() > self.message_reconnect_timeout {
            log::warn!(
                "No message from {} for {:?}, closing connection",
                self.url,
                self.message_reconnect_timeout
            );
            self.close_link(None, true);
        }
        self.awareness.check_outdated();
    }

    fn resync(&mut self) {
        if self.connected() {
            self.send_network(dispatch::sync_step1_frame(&self.doc));
        }
    }

    // ─── Messages ─────────────────────────────────────────────────────

    fn on_local_update(&mut self, update: Vec<u8>) {
        let frame = dispatch::update_frame(&update);
        if !self.shared.synced.load(Ordering::SeqCst) {
            lock(&self.shared.pending).enqueue(update);
        }
        self.broadcast(frame);
    }

    fn dispatch(&self, frame: &[u8]) -> Option<Outcome> {
        match dispatch::dispatch(frame, &self.doc, &self.awareness, &self.origin) {
            Ok(outcome) => {
                if let Some(reason) = &outcome.permission_denied {
                    log::warn!("Permission denied for {}: {reason}", self.url);
                    self.shared.emit(ProviderEvent::PermissionDenied {
                        reason: reason.clone(),
                    });
                }
                Some(outcome)
            }
            Err(e) => {
                log::warn!("Dropping malformed frame for {}: {e}", self.url);
                None
            }
        }
    }

    fn on_network_frame(&mut self, frame: &[u8]) {
        let Some(outcome) = self.dispatch(frame) else {
            return;
        };
        match outcome.sync_step {
            Some(SyncStep::Step2) => {
                lock(&self.shared.pending).clear();
                self.set_synced(true);
            }
            Some(SyncStep::Step1) => lock(&self.shared.pending).clear(),
            _ => {}
        }
        self.reassert_local_presence(&outcome);
        if let Some(reply) = outcome.reply {
            self.send_network(reply);
        }
    }

    fn on_bus_message(&mut self, message: Result<CrossTabMessage, RecvError>) {
        let message = match message {
            Ok(message) => message,
            Err(RecvError::Lagged(n)) => {
                log::warn!(
                    "Cross-tab channel {} lagged by {n} messages, resyncing",
                    self.channel
                );
                self.announce_on_bus();
                return;
            }
            Err(RecvError::Closed) => {
                self.bus = None;
                return;
            }
        };
        if message.sender == self.id {
            return;
        }
        // cross-tab traffic never flips `synced`
        let Some(outcome) = self.dispatch(&message.data) else {
            return;
        };
        self.reassert_local_presence(&outcome);
        if let Some(reply) = outcome.reply {
            self.publish_bus(reply);
        }
    }

    /// A peer announced our own client as gone; the registry kept our state
    /// with a newer clock, so tell everyone.
    fn reassert_local_presence(&mut self, outcome: &Outcome) {
        let local = self.awareness.client_id();
        let reasserted = outcome
            .awareness_changes
            .as_ref()
            .is_some_and(|changes| changes.updated.contains(&local));
        if reasserted {
            let update = self.awareness.encode_update(&[local]);
            self.broadcast(dispatch::awareness_frame(&update));
        }
    }

    fn set_synced(&self, synced: bool) {
        if self.shared.synced.swap(synced, Ordering::SeqCst) != synced {
            self.shared.emit(ProviderEvent::Synced(synced));
            self.shared.emit(ProviderEvent::Sync(synced));
        }
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Send to the server if connected and to the cross-tab bus if
    /// subscribed, independently.
    fn broadcast(&mut self, frame: Vec<u8>) {
        if self.bus.is_some() {
            self.publish_bus(frame.clone());
        }
        self.send_network(frame);
    }

    fn send_network(&mut self, frame: Vec<u8>) {
        if !self.connected() {
            return;
        }
        let failed = match &self.link {
            Some(link) => link.outbound.send(frame).is_err(),
            None => false,
        };
        if failed {
            self.close_link(Some("link task ended".to_string()), false);
        }
    }

    fn publish_bus(&self, frame: Vec<u8>) {
        if let Some(bus) = &self.cross_tab {
            bus.publish(&self.channel, self.id, frame);
        }
    }

    fn connect_bus(&mut self) {
        let Some(bus) = self.cross_tab.clone() else {
            return;
        };
        if self.bus.is_some() {
            return;
        }
        self.bus = Some(bus.subscribe(&self.channel));
        self.announce_on_bus();
    }

    /// Exchange full state and presence with every tab on the channel.
    fn announce_on_bus(&self) {
        self.publish_bus(dispatch::sync_step1_frame(&self.doc));
        self.publish_bus(dispatch::sync_step2_frame(&self.doc, &StateVector::default()));
        self.publish_bus(dispatch::query_awareness_frame());
        let update = self.awareness.encode_update(&[self.awareness.client_id()]);
        self.publish_bus(dispatch::awareness_frame(&update));
    }

    fn disconnect_bus(&mut self) {
        self.bus = None;
    }
}

async fn recv_bus(
    bus: &mut Option<broadcast::Receiver<CrossTabMessage>>,
) -> Result<CrossTabMessage, RecvError> {
    match bus {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owns one connection: forwards outbound frames to it and reports its
/// events back to the driver, tagged with `epoch`.
async fn run_link(
    connector: Arc<dyn Connector>,
    url: String,
    epoch: u64,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let Duplex {
        mut sink,
        mut stream,
    } = match connector.connect(&url).await {
        Ok(duplex) => duplex,
        Err(e) => {
            let _ = inputs.send(Input::Closed {
                epoch,
                error: Some(e.to_string()),
            });
            return;
        }
    };
    if inputs.send(Input::Opened { epoch }).is_err() {
        return;
    }

    let error = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break Some(e.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
            message = stream.next() => match message {
                Some(Ok(data)) => {
                    if inputs.send(Input::Frame { epoch, data }).is_err() {
                        break None;
                    }
                }
                Some(Err(e)) => break Some(e.to_string()),
                None => break None,
            },
        }
    };
    let _ = inputs.send(Input::Closed { epoch, error });
}
