//! Connection manager and per-namespace connection driver
//!
//! Each namespace gets its own Socket.IO client. The client owns the
//! transport and, once a session has been established, reconnects with its
//! own backoff. The driver task turns the client's callbacks into router
//! dispatches and lifecycle signals, tries the configured transports in
//! order on the first connect, and runs the application heartbeat.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

use crate::config::{ConnectOptions, HeartbeatConfig, Transport};
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::events::names;
use crate::protocol::Namespace;
use crate::router::EventRouter;
use crate::token::TokenProvider;

/// Transport state of a namespace connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// The driver stopped after a failure; connect again through the manager
    Error(ConnectionError),
}

/// Why a live session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called locally
    ClientDisconnect,
    /// The server closed the namespace
    ServerDisconnect,
    /// The transport dropped; the client reconnects on its own
    TransportClose,
    /// The manager is reconnecting the namespace with new credentials
    Restart,
}

impl DisconnectReason {
    /// Losses after which the namespace comes back with the same rooms
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportClose | DisconnectReason::Restart
        )
    }

    fn from_close(text: Option<&str>) -> Self {
        match text {
            Some("io server disconnect") => DisconnectReason::ServerDisconnect,
            Some("io client disconnect") => DisconnectReason::ClientDisconnect,
            _ => DisconnectReason::TransportClose,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientDisconnect => f.write_str("client disconnect"),
            DisconnectReason::ServerDisconnect => f.write_str("server disconnect"),
            DisconnectReason::TransportClose => f.write_str("transport close"),
            DisconnectReason::Restart => f.write_str("restart"),
        }
    }
}

/// Result of the application heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// No pong within the configured window. The connection stays open.
    Unresponsive,
}

/// Signals published to lifecycle handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Namespace handshake accepted. `recovered` is set when the handle had
    /// a session before this one.
    Connected { recovered: bool },
    Disconnected(DisconnectReason),
    ConnectionError(ConnectionError),
    Health(Health),
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Event { name: String, data: Value },
}

/// Owns one connection per namespace
pub struct ConnectionManager {
    server_url: String,
    connections: Mutex<HashMap<Namespace, ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Open a namespace connection and start connecting immediately
    pub async fn connect(
        &self,
        namespace: Namespace,
        tokens: Arc<dyn TokenProvider>,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let handle = self.prepare(namespace, tokens, options).await?;
        handle.start();
        Ok(handle)
    }

    /// Set up the connection without starting it, so clients can attach
    /// their handlers before the first event arrives. Call
    /// [`ConnectionHandle::start`] afterwards.
    ///
    /// If the namespace already has a handle, that handle is restarted in
    /// place with the new token provider and options: clients attached to
    /// it keep their subscriptions and re-request their rooms once the new
    /// session is up.
    pub async fn prepare(
        &self,
        namespace: Namespace,
        tokens: Arc<dyn TokenProvider>,
        options: ConnectOptions,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let endpoint = endpoint_url(&self.server_url)?;

        let existing = self.connections.lock().get(&namespace).cloned();
        let handle = match existing {
            Some(handle) => {
                tracing::info!(%namespace, "Restarting connection with new credentials");
                handle.stop(DisconnectReason::Restart).await;
                handle
            }
            None => {
                let handle = ConnectionHandle::new(namespace);
                self.connections.lock().insert(namespace, handle.clone());
                handle
            }
        };

        handle.spawn_driver(endpoint, tokens, options);
        Ok(handle)
    }

    /// Close a connection. Pending acknowledgements on it are cancelled;
    /// other namespaces are untouched.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        {
            let mut connections = self.connections.lock();
            if connections
                .get(&handle.namespace())
                .is_some_and(|current| current.same_as(handle))
            {
                connections.remove(&handle.namespace());
            }
        }
        handle.stop(DisconnectReason::ClientDisconnect).await;
    }

    /// Close every connection (logout)
    pub async fn shutdown(&self) {
        let handles: Vec<ConnectionHandle> =
            self.connections.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop(DisconnectReason::ClientDisconnect).await;
        }
    }

    pub fn handle(&self, namespace: Namespace) -> Option<ConnectionHandle> {
        self.connections.lock().get(&namespace).cloned()
    }
}

/// Cheap, cloneable reference to a namespace connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    shared: Arc<Shared>,
    driver: Mutex<Option<DriverSlot>>,
}

/// State that outlives individual drivers of a handle
struct Shared {
    namespace: Namespace,
    router: Arc<EventRouter>,
    state: watch::Sender<ConnectionState>,
    outbound: AsyncMutex<mpsc::UnboundedReceiver<Outbound>>,
    retries: AtomicU32,
    /// A driver exists and has not finished
    running: AtomicBool,
    ever_connected: AtomicBool,
}

struct DriverSlot {
    start: Option<oneshot::Sender<()>>,
    stop: watch::Sender<Option<DisconnectReason>>,
    /// Resolves to whether the driver reported the stop itself
    task: JoinHandle<bool>,
}

impl ConnectionHandle {
    fn new(namespace: Namespace) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let router = Arc::new(EventRouter::new(namespace, out_tx, state_rx));

        Self {
            inner: Arc::new(HandleInner {
                shared: Arc::new(Shared {
                    namespace,
                    router,
                    state: state_tx,
                    outbound: AsyncMutex::new(out_rx),
                    retries: AtomicU32::new(0),
                    running: AtomicBool::new(false),
                    ever_connected: AtomicBool::new(false),
                }),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.shared.namespace
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.shared.router
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Transport losses since the last successful handshake
    pub fn retry_count(&self) -> u32 {
        self.inner.shared.retries.load(Ordering::Relaxed)
    }

    /// Let a prepared connection begin connecting. No-op once started.
    pub fn start(&self) {
        let start = self
            .inner
            .driver
            .lock()
            .as_mut()
            .and_then(|slot| slot.start.take());
        if let Some(start) = start {
            let _ = start.send(());
        }
    }

    /// Wait until connected, or until the driver stops without connecting
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let mut state = self.watch_state();
        loop {
            {
                let current = state.borrow_and_update();
                match &*current {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Error(err) => return Err(err.clone()),
                    _ if !self.inner.shared.running.load(Ordering::SeqCst) => {
                        return Err(ConnectionError::Transport("connection closed".to_string()))
                    }
                    _ => {}
                }
            }
            if state.changed().await.is_err() {
                return Err(ConnectionError::Transport("connection closed".to_string()));
            }
        }
    }

    /// Whether both refer to the same namespace connection
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn spawn_driver(&self, endpoint: Url, tokens: Arc<dyn TokenProvider>, options: ConnectOptions) {
        let (start_tx, start_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = watch::channel(None);

        let shared = Arc::clone(&self.inner.shared);
        shared.running.store(true, Ordering::SeqCst);
        let driver = Driver {
            shared,
            endpoint,
            tokens,
            options,
        };
        let task = tokio::spawn(driver.run(start_rx, stop_rx));

        *self.inner.driver.lock() = Some(DriverSlot {
            start: Some(start_tx),
            stop: stop_tx,
            task,
        });
    }

    /// Stop the current driver, if any. Lifecycle handlers see exactly one
    /// `Disconnected(reason)`.
    async fn stop(&self, reason: DisconnectReason) {
        let slot = self.inner.driver.lock().take();
        let shared = &self.inner.shared;

        let reported = match slot {
            Some(slot) => {
                // An unstarted driver exits as soon as its start signal is dropped
                drop(slot.start);
                let _ = slot.stop.send(Some(reason.clone()));
                match slot.task.await {
                    Ok(reported) => reported,
                    Err(e) => {
                        tracing::error!(namespace = %shared.namespace, "Connection driver failed: {}", e);
                        false
                    }
                }
            }
            None => false,
        };

        if !reported {
            shared.finish(ConnectionState::Disconnected);
            shared
                .router
                .dispatch_lifecycle(&Lifecycle::Disconnected(reason));
        }
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Final state of a driver. `running` drops first so waiters woken by
    /// the state change see it.
    fn finish(&self, state: ConnectionState) {
        self.running.store(false, Ordering::SeqCst);
        self.state.send_replace(state);
    }

    fn fail(&self, err: ConnectionError) {
        tracing::error!(namespace = %self.namespace, "Connection failed: {}", err);
        self.router
            .dispatch_lifecycle(&Lifecycle::ConnectionError(err.clone()));
        self.finish(ConnectionState::Error(err));
    }

    fn report_health(&self, health: Health) {
        match health {
            Health::Healthy => tracing::info!(namespace = %self.namespace, "Heartbeat recovered"),
            Health::Unresponsive => {
                tracing::warn!(namespace = %self.namespace, "No pong within heartbeat window")
            }
        }
        self.router.dispatch_lifecycle(&Lifecycle::Health(health));
    }
}

/// What the Socket.IO client reported, in arrival order
#[derive(Debug)]
enum Inbound {
    Connected,
    Closed(DisconnectReason),
    /// CONNECT_ERROR from the server
    Rejected(String),
    /// Failure inside the client; informational
    ClientError(String),
    Event { name: String, data: Value },
}

enum End {
    Stopped(DisconnectReason),
    Closed,
    Failed(ConnectionError),
}

struct Driver {
    shared: Arc<Shared>,
    endpoint: Url,
    tokens: Arc<dyn TokenProvider>,
    options: ConnectOptions,
}

impl Driver {
    async fn run(
        self,
        start: oneshot::Receiver<()>,
        mut stop: watch::Receiver<Option<DisconnectReason>>,
    ) -> bool {
        let shared = Arc::clone(&self.shared);

        tokio::select! {
            started = start => {
                if started.is_err() {
                    return false;
                }
            }
            _ = stop.changed() => return false,
        }

        let mut outbound = shared.outbound.lock().await;
        shared.state.send_replace(ConnectionState::Connecting);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let opened = tokio::select! {
            reason = stop_requested(&mut stop) => {
                shared.finish(ConnectionState::Disconnected);
                shared.router.dispatch_lifecycle(&Lifecycle::Disconnected(reason));
                return true;
            }
            opened = self.open(&events_tx) => opened,
        };
        drop(events_tx);

        let client = match opened {
            Ok(client) => client,
            Err(err) => {
                shared.fail(err);
                return false;
            }
        };

        let end = self
            .run_session(&client, &mut events, &mut outbound, &mut stop)
            .await;

        if let Err(e) = client.disconnect().await {
            tracing::debug!(namespace = %shared.namespace, "Client already closed: {}", e);
        }

        match end {
            End::Stopped(reason) => {
                tracing::info!(namespace = %shared.namespace, "Disconnected: {}", reason);
                shared.finish(ConnectionState::Disconnected);
                shared
                    .router
                    .dispatch_lifecycle(&Lifecycle::Disconnected(reason));
                true
            }
            End::Closed => {
                shared.finish(ConnectionState::Disconnected);
                false
            }
            End::Failed(err) => {
                shared.fail(err);
                false
            }
        }
    }

    /// Open the Socket.IO client, trying each transport in preference order.
    /// Authentication failures stop the fallback.
    async fn open(&self, events: &mpsc::UnboundedSender<Inbound>) -> Result<Client, ConnectionError> {
        let token = self.tokens.token().ok_or(ConnectionError::MissingToken)?;
        let mut auth = self.options.auth.clone();
        auth.insert(
            "token".to_string(),
            Value::String(token.expose().to_string()),
        );
        let auth = Value::Object(auth);

        let namespace = self.shared.namespace;
        let timeout = self.options.timeout;
        let mut last = ConnectionError::Handshake("no transports configured".to_string());

        for &transport in &self.options.transports {
            tracing::info!(%namespace, endpoint = %self.endpoint, %transport, "Connecting");
            let builder = self.client_builder(transport, auth.clone(), events);

            let err = match tokio::time::timeout(timeout, builder.connect()).await {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) => classify_client_error(&e),
                Err(_) => ConnectionError::Timeout(timeout),
            };
            tracing::warn!(%namespace, %transport, "Transport failed: {}", err);
            if err.is_terminal() {
                return Err(err);
            }
            last = err;
        }

        Err(last)
    }

    fn client_builder(
        &self,
        transport: Transport,
        auth: Value,
        events: &mpsc::UnboundedSender<Inbound>,
    ) -> ClientBuilder {
        let reconnect = &self.options.reconnect;
        let (min_delay, max_delay) = reconnect.delay_bounds_ms();

        let mut builder = ClientBuilder::new(self.endpoint.as_str())
            .namespace(self.shared.namespace.path())
            .auth(auth)
            .transport_type(transport.into())
            .reconnect(reconnect.enabled)
            .reconnect_on_disconnect(false)
            .reconnect_delay(min_delay, max_delay)
            .on(Event::Connect, forward(events, |_| Inbound::Connected))
            .on(
                Event::Close,
                forward(events, |payload| {
                    let text = payload_value(payload).ok();
                    Inbound::Closed(DisconnectReason::from_close(
                        text.as_ref().and_then(Value::as_str),
                    ))
                }),
            )
            .on(Event::Error, forward(events, inbound_error))
            .on_any({
                let events = events.clone();
                move |event: Event, payload: Payload, _: Client| {
                    let name = match event {
                        Event::Custom(name) => name,
                        Event::Message => "message".to_string(),
                        _ => return async {}.boxed(),
                    };
                    match payload_value(payload) {
                        Ok(data) => {
                            let _ = events.send(Inbound::Event { name, data });
                        }
                        Err(e) => tracing::warn!(event = %name, "Dropping event: {}", e),
                    }
                    async {}.boxed()
                }
            });

        if let Some(attempts) = reconnect.max_attempts {
            builder = builder.max_reconnect_attempts(attempts);
        }
        builder
    }

    async fn run_session(
        &self,
        client: &Client,
        events: &mut mpsc::UnboundedReceiver<Inbound>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        stop: &mut watch::Receiver<Option<DisconnectReason>>,
    ) -> End {
        let shared = &self.shared;
        let namespace = shared.namespace;

        let timeout = self.options.timeout;
        let handshake = tokio::time::sleep(timeout);
        tokio::pin!(handshake);
        let mut greeted = false;

        let mut heartbeat = self
            .options
            .heartbeat
            .clone()
            .map(|config| Heartbeat::new(config, Instant::now()));
        let mut ticker = heartbeat.as_ref().map(|hb| {
            let mut ticker = tokio::time::interval(hb.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                reason = stop_requested(stop) => return End::Stopped(reason),
                _ = &mut handshake, if !greeted => {
                    return End::Failed(ConnectionError::Timeout(timeout));
                }
                Some(event) = events.recv() => match event {
                    Inbound::Connected => {
                        greeted = true;
                        if let Some(hb) = heartbeat.as_mut() {
                            hb.reset(Instant::now());
                        }
                        self.connected(outbound);
                    }
                    Inbound::Closed(reason) => {
                        let reconnecting = reason == DisconnectReason::TransportClose
                            && self.options.reconnect.enabled;
                        shared.state.send_replace(ConnectionState::Disconnected);
                        tracing::warn!(%namespace, reconnecting, "Disconnected: {}", reason);
                        shared
                            .router
                            .dispatch_lifecycle(&Lifecycle::Disconnected(reason));
                        if !reconnecting {
                            return End::Closed;
                        }
                        shared.retries.fetch_add(1, Ordering::Relaxed);
                    }
                    Inbound::Rejected(message) => {
                        return End::Failed(ConnectionError::Rejected(message));
                    }
                    Inbound::ClientError(message) => {
                        tracing::warn!(%namespace, "Socket.IO client error: {}", message);
                    }
                    Inbound::Event { name, data } => {
                        if let Some(hb) = heartbeat.as_mut() {
                            if name == hb.config.pong_event {
                                if let Some(health) = hb.pong(Instant::now()) {
                                    shared.report_health(health);
                                }
                            }
                        }
                        tracing::debug!(%namespace, event = %name, "Dispatching event");
                        shared.router.dispatch(&name, &data);
                    }
                },
                Some(Outbound::Event { name, data }) = outbound.recv() => {
                    self.send(client, name, data).await;
                }
                _ = next_tick(&mut ticker) => {
                    if let Some(hb) = heartbeat.as_mut() {
                        if shared.is_connected() {
                            if let Some(health) = hb.check(Instant::now()) {
                                shared.report_health(health);
                            }
                            let ping = hb.config.ping_event.clone();
                            self.send(client, ping, Value::Null).await;
                        }
                    }
                }
            }
        }
    }

    fn connected(&self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
        let shared = &self.shared;

        let mut discarded = 0usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(namespace = %shared.namespace, discarded, "Discarded events queued before this session");
        }

        let recovered = shared.ever_connected.swap(true, Ordering::SeqCst);
        shared.retries.store(0, Ordering::Relaxed);
        shared.state.send_replace(ConnectionState::Connected);
        tracing::info!(namespace = %shared.namespace, recovered, "Connected");
        shared
            .router
            .dispatch_lifecycle(&Lifecycle::Connected { recovered });
    }

    async fn send(&self, client: &Client, name: String, data: Value) {
        let payload = if data.is_null() {
            Payload::Text(Vec::new())
        } else {
            Payload::Text(vec![data])
        };
        if let Err(e) = client.emit(Event::Custom(name.clone()), payload).await {
            tracing::warn!(namespace = %self.shared.namespace, event = %name, "Emit failed: {}", e);
        }
    }
}

/// Pong bookkeeping for the application heartbeat
struct Heartbeat {
    config: HeartbeatConfig,
    last_pong: Instant,
    unresponsive: bool,
}

impl Heartbeat {
    fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_pong: now,
            unresponsive: false,
        }
    }

    /// A new session starts healthy
    fn reset(&mut self, now: Instant) {
        self.last_pong = now;
        self.unresponsive = false;
    }

    /// Called on each tick; reports the transition to unresponsive once
    fn check(&mut self, now: Instant) -> Option<Health> {
        if !self.unresponsive && now.duration_since(self.last_pong) > self.config.window {
            self.unresponsive = true;
            return Some(Health::Unresponsive);
        }
        None
    }

    /// Reports the transition back to healthy once
    fn pong(&mut self, now: Instant) -> Option<Health> {
        self.last_pong = now;
        if self.unresponsive {
            self.unresponsive = false;
            return Some(Health::Healthy);
        }
        None
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Resolves when a stop is requested or every handle is gone
async fn stop_requested(stop: &mut watch::Receiver<Option<DisconnectReason>>) -> DisconnectReason {
    let _ = stop.changed().await;
    let reason = stop.borrow().clone();
    reason.unwrap_or(DisconnectReason::ClientDisconnect)
}

/// Client callback that converts its payload and queues it for the driver
fn forward<F>(
    events: &mpsc::UnboundedSender<Inbound>,
    convert: F,
) -> impl FnMut(Payload, Client) -> BoxFuture<'static, ()> + Send + Sync + 'static
where
    F: Fn(Payload) -> Inbound + Send + Sync + 'static,
{
    let events = events.clone();
    move |payload, _| {
        let _ = events.send(convert(payload));
        async {}.boxed()
    }
}

/// First argument of an event. Events without data carry `null`.
#[allow(deprecated)]
fn payload_value(payload: Payload) -> Result<Value, ProtocolError> {
    match payload {
        Payload::Text(values) => Ok(values.into_iter().next().unwrap_or(Value::Null)),
        Payload::String(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        Payload::Binary(_) => Err(ProtocolError::Binary),
    }
}

/// The `error` name carries both the server's chat errors (an object) and
/// the client's own failures (a string)
fn inbound_error(payload: Payload) -> Inbound {
    match payload_value(payload) {
        Ok(Value::String(text)) if text.contains("ConnectError") => {
            Inbound::Rejected(connect_error_message(&text))
        }
        Ok(Value::String(text)) => Inbound::ClientError(text),
        Ok(data) => Inbound::Event {
            name: names::ERROR.to_string(),
            data,
        },
        Err(e) => Inbound::ClientError(e.to_string()),
    }
}

/// `message` of the CONNECT_ERROR data embedded in the client's error text
fn connect_error_message(text: &str) -> String {
    text.find('{')
        .and_then(|start| serde_json::from_str::<Value>(&text[start..]).ok())
        .and_then(|data| data.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.to_string())
}

/// The client library carries HTTP statuses only in its error text. Match
/// the status with its reason phrase so port numbers cannot collide.
fn classify_client_error(err: &rust_socketio::Error) -> ConnectionError {
    let message = err.to_string();
    if message.contains("401 Unauthorized") || message.contains("403 Forbidden") {
        ConnectionError::Unauthorized(message)
    } else {
        ConnectionError::Transport(message)
    }
}

/// Socket.IO endpoint for a server base URL. Credentials never go here.
pub(crate) fn endpoint_url(server: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(server).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// Test double: a handle with no driver, whose traffic the test controls
#[cfg(test)]
pub(crate) struct Loopback {
    shared: Arc<Shared>,
}

#[cfg(test)]
impl Loopback {
    pub fn new(namespace: Namespace) -> (ConnectionHandle, Loopback) {
        let handle = ConnectionHandle::new(namespace);
        let loopback = Loopback {
            shared: Arc::clone(&handle.inner.shared),
        };
        (handle, loopback)
    }

    pub fn connect(&self, recovered: bool) {
        self.shared.state.send_replace(ConnectionState::Connected);
        self.shared
            .router
            .dispatch_lifecycle(&Lifecycle::Connected { recovered });
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.shared.state.send_replace(ConnectionState::Disconnected);
        self.shared
            .router
            .dispatch_lifecycle(&Lifecycle::Disconnected(reason));
    }

    pub fn deliver(&self, event: &str, payload: Value) {
        self.shared.router.dispatch(event, &payload);
    }

    /// Drain everything emitted so far
    pub fn sent(&mut self) -> Vec<(String, Value)> {
        let mut sent = Vec::new();
        if let Ok(mut outbound) = self.shared.outbound.try_lock() {
            while let Ok(Outbound::Event { name, data }) = outbound.try_recv() {
                sent.push((name, data));
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticToken;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_endpoint_appends_socket_io_path() {
        let url = endpoint_url("http://localhost:3000").unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/socket.io/");
    }

    #[test]
    fn test_endpoint_keeps_path_prefix_and_tls() {
        let url = endpoint_url("wss://api.example.com/realtime/").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/realtime/socket.io/");
    }

    #[test]
    fn test_endpoint_drops_existing_query() {
        let url = endpoint_url("http://localhost:3000/?token=leaked").unwrap();
        assert!(!url.as_str().contains("token"));
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        assert!(matches!(
            endpoint_url("ftp://example.com"),
            Err(ConnectionError::InvalidUrl(_))
        ));
        assert!(matches!(
            endpoint_url("not a url"),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_recoverable_reasons() {
        assert!(DisconnectReason::TransportClose.is_recoverable());
        assert!(DisconnectReason::Restart.is_recoverable());
        assert!(!DisconnectReason::ClientDisconnect.is_recoverable());
        assert!(!DisconnectReason::ServerDisconnect.is_recoverable());
    }

    #[test]
    fn test_close_reasons_from_client() {
        assert_eq!(
            DisconnectReason::from_close(Some("io server disconnect")),
            DisconnectReason::ServerDisconnect
        );
        assert_eq!(
            DisconnectReason::from_close(Some("io client disconnect")),
            DisconnectReason::ClientDisconnect
        );
        assert_eq!(
            DisconnectReason::from_close(Some("transport close")),
            DisconnectReason::TransportClose
        );
        assert_eq!(
            DisconnectReason::from_close(None),
            DisconnectReason::TransportClose
        );
    }

    #[test]
    fn test_payload_first_argument() {
        let payload = Payload::Text(vec![json!({ "id": "m1" }), json!("extra")]);
        assert_eq!(payload_value(payload).unwrap(), json!({ "id": "m1" }));
        assert_eq!(payload_value(Payload::Text(Vec::new())).unwrap(), Value::Null);
        assert!(matches!(
            payload_value(Payload::Binary(vec![1u8, 2].into())),
            Err(ProtocolError::Binary)
        ));
    }

    #[test]
    fn test_error_payloads_are_told_apart() {
        let rejected = inbound_error(Payload::Text(vec![json!(
            "Received an ConnectError frame: {\"message\":\"Authentication error\"}"
        )]));
        assert!(matches!(rejected, Inbound::Rejected(m) if m == "Authentication error"));

        let server = inbound_error(Payload::Text(vec![json!({ "message": "Access denied" })]));
        assert!(matches!(
            server,
            Inbound::Event { name, data } if name == "error" && data["message"] == "Access denied"
        ));

        let internal = inbound_error(Payload::Text(vec![json!("Websocket error")]));
        assert!(matches!(internal, Inbound::ClientError(_)));
    }

    #[test]
    fn test_connect_error_without_json_keeps_text() {
        assert_eq!(
            connect_error_message("Received an ConnectError frame: nope"),
            "Received an ConnectError frame: nope"
        );
    }

    fn heartbeat(window_ms: u64) -> (Heartbeat, Instant) {
        let config = HeartbeatConfig {
            interval: Duration::from_millis(10),
            window: Duration::from_millis(window_ms),
            ..HeartbeatConfig::default()
        };
        let start = Instant::now();
        (Heartbeat::new(config, start), start)
    }

    #[test]
    fn test_heartbeat_reports_unresponsive_once() {
        let (mut hb, start) = heartbeat(100);
        assert_eq!(hb.check(start + Duration::from_millis(50)), None);
        assert_eq!(
            hb.check(start + Duration::from_millis(150)),
            Some(Health::Unresponsive)
        );
        assert_eq!(hb.check(start + Duration::from_millis(300)), None);
    }

    #[test]
    fn test_heartbeat_recovers_on_pong() {
        let (mut hb, start) = heartbeat(100);
        hb.check(start + Duration::from_millis(150));
        assert_eq!(
            hb.pong(start + Duration::from_millis(160)),
            Some(Health::Healthy)
        );
        assert_eq!(hb.pong(start + Duration::from_millis(170)), None);
        assert_eq!(hb.check(start + Duration::from_millis(200)), None);
    }

    #[test]
    fn test_heartbeat_reset_on_new_session() {
        let (mut hb, start) = heartbeat(100);
        hb.check(start + Duration::from_millis(150));
        hb.reset(start + Duration::from_millis(200));
        assert_eq!(hb.check(start + Duration::from_millis(250)), None);
    }

    #[tokio::test]
    async fn test_loopback_emit_requires_connect() {
        let (handle, mut loopback) = Loopback::new(Namespace::Chat);
        assert!(handle.router().emit("ping", &()).is_err());

        loopback.connect(false);
        assert!(handle.is_connected());
        handle.router().emit("ping", &()).unwrap();
        assert_eq!(loopback.sent(), vec![("ping".to_string(), Value::Null)]);
    }

    #[tokio::test]
    async fn test_unstarted_connection_closes_cleanly() {
        let manager = ConnectionManager::new("http://127.0.0.1:9");
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("t"));
        let handle = manager
            .prepare(Namespace::Chat, tokens, ConnectOptions::default())
            .await
            .unwrap();

        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        let _ = handle
            .router()
            .on_lifecycle(move |signal| sink.lock().push(signal.clone()));

        assert!(manager.handle(Namespace::Chat).is_some());
        manager.disconnect(&handle).await;
        assert!(manager.handle(Namespace::Chat).is_none());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(
            *signals.lock(),
            vec![Lifecycle::Disconnected(DisconnectReason::ClientDisconnect)]
        );
        assert!(handle.wait_connected().await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_again_reuses_the_handle() {
        let manager = ConnectionManager::new("http://127.0.0.1:9");
        let first = manager
            .prepare(
                Namespace::Notifications,
                Arc::new(StaticToken::new("old")),
                ConnectOptions::default(),
            )
            .await
            .unwrap();
        let second = manager
            .prepare(
                Namespace::Notifications,
                Arc::new(StaticToken::new("new")),
                ConnectOptions::default(),
            )
            .await
            .unwrap();

        assert!(first.same_as(&second));
        assert!(manager
            .handle(Namespace::Notifications)
            .is_some_and(|current| current.same_as(&first)));
        manager.shutdown().await;
    }
}
