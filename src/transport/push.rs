//! Push channel: a STOMP subscription over WebSocket with bounded reconnect.
//!
//! One background task owns the socket. Callers talk to it through
//! [`PushChannel`] and receive data through [`Subscription`] handles, which
//! unsubscribe themselves when dropped. Connection changes are broadcast as
//! [`ChannelEvent`]s.

use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::stomp::{self, Command as StompCommand, Frame, Heartbeat, Incoming};
use crate::error::DashboardError;
use crate::session::SessionStore;

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8080/ws-monitoring`.
    pub url: String,
    /// Automatic reconnects after a drop before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Heartbeat offered in both directions. Zero disables it.
    pub heartbeat: Duration,
    /// Bound on the socket handshake plus the STOMP CONNECTED reply.
    pub connect_timeout: Duration,
    /// Per-subscription queue depth.
    pub queue_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws-monitoring".into(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(3000),
            heartbeat: Duration::from_millis(4000),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

impl PushConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Default::default() }
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, max: u32, delay: Duration },
    /// Automatic reconnects are exhausted. Only `connect()` resumes.
    Failed { error: DashboardError },
    /// The broker sent an ERROR frame.
    ServerError { message: String },
}

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub body: String,
    /// Local receipt time, epoch ms.
    pub received_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Command {
    Subscribe(u64),
    Unsubscribe(u64),
    Disconnect,
}

struct Route {
    topic: String,
    tx: mpsc::Sender<Delivery>,
}

struct TaskHandle {
    commands: mpsc::UnboundedSender<Command>,
    join: JoinHandle<()>,
}

/// Channel state plus the generation of the task allowed to change it.
struct Link {
    generation: u64,
    state: ChannelState,
}

struct Shared {
    link: Mutex<Link>,
    events: broadcast::Sender<ChannelEvent>,
    routes: Mutex<HashMap<u64, Route>>,
    next_id: AtomicU64,
    task: Mutex<Option<TaskHandle>>,
}

impl Shared {
    /// Retire whatever task owns the link and hand it to a new generation.
    fn claim(&self, state: ChannelState) -> u64 {
        let mut link = self.link.lock();
        link.generation += 1;
        link.state = state;
        link.generation
    }

    /// Update the state on behalf of task `generation`. False if that task
    /// has been retired, in which case nothing changes.
    fn set_state(&self, generation: u64, state: ChannelState) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        link.state = state;
        true
    }

    /// Publish an event on behalf of task `generation`; dropped if retired.
    fn emit(&self, generation: u64, event: ChannelEvent) {
        let link = self.link.lock();
        if link.generation == generation {
            // No listeners is fine
            let _ = self.events.send(event);
        }
    }

    /// Like `set_state` followed by `emit`, under one lock.
    fn transition(&self, generation: u64, state: ChannelState, event: ChannelEvent) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        link.state = state;
        let _ = self.events.send(event);
        true
    }

    fn send_command(&self, cmd: Command) {
        if let Some(task) = self.task.lock().as_ref() {
            let _ = task.commands.send(cmd);
        }
    }

    fn unsubscribe(&self, id: u64) {
        if self.routes.lock().remove(&id).is_some() {
            self.send_command(Command::Unsubscribe(id));
        }
    }

    fn deliver(&self, id: u64, body: String) {
        let routes = self.routes.lock();
        let Some(route) = routes.get(&id) else {
            debug!(subscription = id, "message for unknown subscription");
            return;
        };
        let delivery = Delivery {
            topic: route.topic.clone(),
            body,
            received_at: Utc::now().timestamp_millis(),
        };
        match route.tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscription = id, topic = %route.topic, "subscriber is lagging, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscription = id, "subscriber gone");
            }
        }
    }

    fn topics(&self) -> Vec<(u64, String)> {
        self.routes.lock().iter().map(|(id, r)| (*id, r.topic.clone())).collect()
    }
}

/// Handle to a topic subscription.
///
/// Dropping it unsubscribes. It survives reconnects: the channel re-issues
/// SUBSCRIBE for every live handle once the broker is back.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<Delivery>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        SubscriptionId(self.id)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivery, or `None` once the subscription or channel is torn down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("topic", &self.topic).finish()
    }
}

/// The push side of the transport.
pub struct PushChannel {
    config: PushConfig,
    store: SessionStore,
    shared: Arc<Shared>,
}

impl PushChannel {
    pub fn new(config: PushConfig, store: SessionStore) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            store,
            shared: Arc::new(Shared {
                link: Mutex::new(Link { generation: 0, state: ChannelState::Disconnected }),
                events,
                routes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.shared.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Start connecting in the background. Progress arrives as events.
    ///
    /// A no-op while a connection task is already running. Must be called
    /// from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), DashboardError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| DashboardError::Transport("no async runtime available".into()))?;

        let mut slot = self.shared.task.lock();
        if slot.as_ref().is_some_and(|t| !t.join.is_finished()) {
            debug!("push channel already active");
            return Ok(());
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let generation = self.shared.claim(ChannelState::Connecting);
        let join = runtime.spawn(run(
            Arc::clone(&self.shared),
            generation,
            self.config.clone(),
            self.store.clone(),
            rx,
        ));
        *slot = Some(TaskHandle { commands, join });
        Ok(())
    }

    /// Subscribe to a topic. Fails with `NotConnected` unless connected.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, DashboardError> {
        if !self.is_connected() {
            return Err(DashboardError::NotConnected);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        self.shared.routes.lock().insert(id, Route { topic: topic.to_string(), tx });
        self.shared.send_command(Command::Subscribe(id));
        debug!(subscription = id, topic, "subscribed");
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            rx,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.unsubscribe(id.0);
    }

    /// Drop every subscription, then the connection. Safe in any state.
    ///
    /// The old connection task winds down in the background but can no
    /// longer touch the channel state or its events, so `connect()` may be
    /// called again right away.
    pub fn disconnect(&self) {
        let ids: Vec<u64> = self.shared.routes.lock().keys().copied().collect();
        for id in ids {
            self.shared.unsubscribe(id);
        }
        let task = self.shared.task.lock().take();
        let generation = self.shared.claim(ChannelState::Disconnected);
        if let Some(task) = task {
            let _ = task.commands.send(Command::Disconnect);
            if !task.join.is_finished() {
                self.shared.emit(generation, ChannelEvent::Disconnected { reason: "closed by client".into() });
            }
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish()
    }
}

// ─── CONNECTION TASK ────────────────────────────────────────────

enum SessionEnd {
    /// The caller asked to disconnect.
    Requested,
    /// The connection failed or was lost.
    Dropped { reason: String, was_connected: bool },
}

async fn run(
    shared: Arc<Shared>,
    generation: u64,
    config: PushConfig,
    store: SessionStore,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut attempt: u32 = 0;
    loop {
        if !shared.set_state(generation, ChannelState::Connecting) {
            return;
        }
        info!(url = %config.url, attempt, "connecting push channel");

        let (reason, was_connected) = match run_session(&shared, generation, &config, &store, &mut commands).await {
            SessionEnd::Requested => {
                shared.transition(
                    generation,
                    ChannelState::Disconnected,
                    ChannelEvent::Disconnected { reason: "closed by client".into() },
                );
                info!("push channel closed");
                return;
            }
            SessionEnd::Dropped { reason, was_connected } => (reason, was_connected),
        };

        if !shared.transition(
            generation,
            ChannelState::Disconnected,
            ChannelEvent::Disconnected { reason: reason.clone() },
        ) {
            debug!(%reason, "retired push task stopping");
            return;
        }
        if was_connected {
            attempt = 0;
            warn!(%reason, "push channel dropped");
        } else {
            warn!(%reason, attempt, "push channel connect failed");
        }

        if attempt >= config.max_reconnect_attempts {
            error!(attempts = attempt, "push channel giving up, reconnect attempts exhausted");
            shared.emit(generation, ChannelEvent::Failed {
                error: DashboardError::Transport(format!(
                    "gave up after {attempt} reconnect attempts: {reason}"
                )),
            });
            return;
        }

        attempt += 1;
        info!(
            attempt,
            max = config.max_reconnect_attempts,
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "reconnecting push channel"
        );
        shared.emit(generation, ChannelEvent::Reconnecting {
            attempt,
            max: config.max_reconnect_attempts,
            delay: config.reconnect_delay,
        });

        if wait_or_disconnect(config.reconnect_delay, &mut commands).await {
            shared.transition(
                generation,
                ChannelState::Disconnected,
                ChannelEvent::Disconnected { reason: "closed by client".into() },
            );
            return;
        }
    }
}

/// Sleep out the reconnect delay. Returns true if a disconnect arrived meanwhile.
async fn wait_or_disconnect(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let timer = sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return false,
            cmd = commands.recv() => match cmd {
                Some(Command::Disconnect) | None => return true,
                // Routes are replayed from the shared table on the next connect
                Some(Command::Subscribe(_)) | Some(Command::Unsubscribe(_)) => {}
            },
        }
    }
}

async fn run_session(
    shared: &Shared,
    generation: u64,
    config: &PushConfig,
    store: &SessionStore,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let dropped = |reason: String, was_connected: bool| SessionEnd::Dropped { reason, was_connected };

    let ws = match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => return dropped(e.to_string(), false),
        Err(_) => return dropped("connection timed out".into(), false),
    };
    let (mut sink, mut stream) = ws.split();

    let offered = config.heartbeat.as_millis() as u64;
    let token = store.access_token();
    let hello = Frame::connect(&config.host(), (offered, offered), token.as_deref());
    if let Err(e) = sink.send(Message::Text(hello.encode())).await {
        return dropped(e.to_string(), false);
    }

    let mut connected = false;
    let mut active: HashSet<u64> = HashSet::new();
    let mut heartbeat = Heartbeat::default();
    let mut ticker: Option<Interval> = None;
    let mut last_seen = Instant::now();
    let handshake_deadline = Instant::now() + config.connect_timeout;

    loop {
        let watchdog = if connected {
            heartbeat.incoming.map(|d| last_seen + d * 2)
        } else {
            Some(handshake_deadline)
        };

        tokio::select! {
            msg = stream.next() => {
                last_seen = Instant::now();
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".into());
                        return dropped(reason, connected);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return dropped(e.to_string(), connected),
                    None => return dropped("connection closed".into(), connected),
                };

                let items = match stomp::decode(&text) {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(error = %e, "undecodable STOMP frame");
                        continue;
                    }
                };
                for item in items {
                    let Incoming::Frame(frame) = item else { continue };
                    match frame.command {
                        StompCommand::Connected if !connected => {
                            connected = true;
                            heartbeat = stomp::negotiate(
                                (offered, offered),
                                frame.get("heart-beat").and_then(stomp::parse_heartbeat),
                            );
                            ticker = heartbeat.outgoing.map(|period| {
                                let mut t = interval_at(Instant::now() + period, period);
                                t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                t
                            });
                            if !shared.transition(generation, ChannelState::Connected, ChannelEvent::Connected) {
                                let _ = sink.close().await;
                                return SessionEnd::Requested;
                            }
                            info!(?heartbeat, "push channel connected");

                            for (id, topic) in shared.topics() {
                                if active.insert(id) {
                                    if let Err(e) = sink.send(Message::Text(Frame::subscribe(id, &topic).encode())).await {
                                        return dropped(e.to_string(), true);
                                    }
                                }
                            }
                        }
                        StompCommand::Message => {
                            match frame.get("subscription").and_then(|s| s.parse::<u64>().ok()) {
                                Some(id) => shared.deliver(id, frame.body),
                                None => debug!("MESSAGE without subscription header"),
                            }
                        }
                        StompCommand::Error => {
                            let message = frame.error_message();
                            warn!(%message, "broker error");
                            shared.emit(generation, ChannelEvent::ServerError { message: message.clone() });
                            return dropped(message, connected);
                        }
                        other => debug!(command = %other, "ignoring frame"),
                    }
                }
            }

            cmd = commands.recv() => match cmd {
                Some(Command::Subscribe(id)) => {
                    // Before CONNECTED the route is picked up from the shared table
                    if !connected {
                        continue;
                    }
                    let topic = shared.routes.lock().get(&id).map(|r| r.topic.clone());
                    if let Some(topic) = topic {
                        if active.insert(id) {
                            if let Err(e) = sink.send(Message::Text(Frame::subscribe(id, &topic).encode())).await {
                                return dropped(e.to_string(), true);
                            }
                        }
                    }
                }
                Some(Command::Unsubscribe(id)) => {
                    if active.remove(&id) {
                        if let Err(e) = sink.send(Message::Text(Frame::unsubscribe(id).encode())).await {
                            return dropped(e.to_string(), connected);
                        }
                    }
                }
                Some(Command::Disconnect) | None => {
                    if connected {
                        let _ = sink.send(Message::Text(Frame::disconnect().encode())).await;
                    }
                    let _ = sink.close().await;
                    return SessionEnd::Requested;
                }
            },

            _ = next_tick(&mut ticker) => {
                if let Err(e) = sink.send(Message::Text("\n".into())).await {
                    return dropped(e.to_string(), connected);
                }
            }

            _ = deadline(watchdog) => {
                if connected {
                    warn!(silent_for = ?last_seen.elapsed(), "heartbeat timeout");
                    return dropped("heartbeat timeout".into(), true);
                }
                return dropped("no CONNECTED reply from broker".into(), false);
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
