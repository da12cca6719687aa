//! In-process Socket.IO server for integration tests
//!
//! Speaks just enough Engine.IO v4 / Socket.IO v5 over axum, on both the
//! websocket and the long-polling transport, to play the notification and
//! chat backends.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use medrt::{AuthToken, ReconnectPolicy, StaticToken, TokenProvider};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

pub const VALID_TOKEN: &str = "valid-token";

/// How long a polling GET waits before answering with a noop
const POLL_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
enum Control {
    DropAll,
    Emit {
        namespace: String,
        event: String,
        data: Value,
    },
    Disconnect {
        namespace: String,
    },
}

struct PollingSession {
    inbound: mpsc::UnboundedSender<String>,
    outbound: AsyncMutex<mpsc::UnboundedReceiver<String>>,
}

pub struct ServerState {
    /// Engine.IO sessions opened, on any transport
    pub sessions: AtomicUsize,
    /// Namespace connects accepted
    pub connects: AtomicUsize,
    /// Answer every handshake with 401
    pub reject_upgrade: AtomicBool,
    /// Answer websocket handshakes with 400; polling still works
    pub reject_websocket: AtomicBool,
    /// Stop answering application pings
    pub mute_pong: AtomicBool,
    /// Users reported in `onlineUsers` after a join
    pub presence: Mutex<Vec<String>>,
    valid_token: Mutex<String>,
    transports: Mutex<Vec<String>>,
    polling: Mutex<HashMap<String, Arc<PollingSession>>>,
    received: Mutex<Vec<(String, String, Value)>>,
    next_id: AtomicU64,
    control: broadcast::Sender<Control>,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let (control, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            sessions: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            reject_upgrade: AtomicBool::new(false),
            reject_websocket: AtomicBool::new(false),
            mute_pong: AtomicBool::new(false),
            presence: Mutex::new(vec!["me".to_string()]),
            valid_token: Mutex::new(VALID_TOKEN.to_string()),
            transports: Mutex::new(Vec::new()),
            polling: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            control,
        });

        let app = Router::new()
            .route("/socket.io/", get(handshake_or_poll).post(polling_post))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Transport of every handshake attempt, in arrival order
    pub fn transports_tried(&self) -> Vec<String> {
        self.state.transports.lock().clone()
    }

    /// Accept only `token` from now on
    pub fn rotate_token(&self, token: &str) {
        *self.state.valid_token.lock() = token.to_string();
    }

    /// Payloads of every `event` received on `namespace`
    pub fn received(&self, namespace: &str, event: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|(ns, name, _)| ns == namespace && name == event)
            .map(|(_, _, data)| data.clone())
            .collect()
    }

    pub fn emit(&self, namespace: &str, event: &str, data: Value) {
        let _ = self.state.control.send(Control::Emit {
            namespace: namespace.to_string(),
            event: event.to_string(),
            data,
        });
    }

    /// Kill every session without a goodbye
    pub fn drop_connections(&self) {
        let _ = self.state.control.send(Control::DropAll);
    }

    /// Server-side namespace disconnect
    pub fn disconnect(&self, namespace: &str) {
        let _ = self.state.control.send(Control::Disconnect {
            namespace: namespace.to_string(),
        });
    }
}

pub fn token(value: &str) -> Arc<dyn TokenProvider> {
    Arc::new(StaticToken::new(value))
}

pub fn valid_token() -> Arc<dyn TokenProvider> {
    token(VALID_TOKEN)
}

pub fn no_token() -> Arc<dyn TokenProvider> {
    Arc::new(|| None::<AuthToken>)
}

/// Reconnect within a tenth of a second
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
        ..ReconnectPolicy::default()
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn handshake_or_poll(
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if query.get("EIO").map(String::as_str) != Some("4") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if let Some(sid) = query.get("sid") {
        return long_poll(&state, sid).await;
    }

    let transport = query.get("transport").cloned().unwrap_or_default();
    state.transports.lock().push(transport.clone());
    if state.reject_upgrade.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match (transport.as_str(), ws) {
        ("websocket", Some(ws)) if !state.reject_websocket.load(Ordering::SeqCst) => {
            ws.on_upgrade(move |socket| websocket_session(socket, state))
        }
        ("polling", _) => {
            let (sid, inbound, mut outbound) = open_session(&state);
            let open = outbound.try_recv().unwrap();
            state.polling.lock().insert(
                sid,
                Arc::new(PollingSession {
                    inbound,
                    outbound: AsyncMutex::new(outbound),
                }),
            );
            open.into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn long_poll(state: &ServerState, sid: &str) -> Response {
    let session = state.polling.lock().get(sid).cloned();
    let Some(session) = session else {
        return (StatusCode::BAD_REQUEST, "Session ID unknown").into_response();
    };

    let mut outbound = session.outbound.lock().await;
    let first = match tokio::time::timeout(POLL_WINDOW, outbound.recv()).await {
        Ok(Some(packet)) => packet,
        Ok(None) => {
            state.polling.lock().remove(sid);
            return StatusCode::BAD_REQUEST.into_response();
        }
        Err(_) => return "6".into_response(),
    };

    let mut packets = vec![first];
    while let Ok(packet) = outbound.try_recv() {
        packets.push(packet);
    }
    packets.join("\u{1e}").into_response()
}

async fn polling_post(
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
    body: String,
) -> Response {
    let session = query
        .get("sid")
        .and_then(|sid| state.polling.lock().get(sid).cloned());
    let Some(session) = session else {
        return (StatusCode::BAD_REQUEST, "Session ID unknown").into_response();
    };
    for packet in body.split('\u{1e}') {
        if session.inbound.send(packet.to_string()).is_err() {
            return StatusCode::BAD_REQUEST.into_response();
        }
    }
    "ok".into_response()
}

async fn websocket_session(socket: WebSocket, state: Arc<ServerState>) {
    let (_, inbound, mut outbound) = open_session(&state);
    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if tx.send(Message::Text(packet)).await.is_err() {
                        return;
                    }
                }
                // Session killed: drop the socket without a close frame
                None => return,
            },
        }
    }
}

/// Start an Engine.IO session. The open packet is the first thing queued
/// on the returned outbound channel.
fn open_session(
    state: &Arc<ServerState>,
) -> (
    String,
    mpsc::UnboundedSender<String>,
    mpsc::UnboundedReceiver<String>,
) {
    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    let sid = format!("sid-{}", session);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let open = json!({
        "sid": sid,
        "upgrades": [],
        "pingInterval": 25000,
        "pingTimeout": 20000,
        "maxPayload": 1_000_000,
    });
    let _ = outbound_tx.send(format!("0{}", open));

    let control = state.control.subscribe();
    tokio::spawn(engine_session(
        Arc::clone(state),
        sid.clone(),
        inbound_rx,
        outbound_tx,
        control,
    ));
    (sid, inbound_tx, outbound_rx)
}

async fn engine_session(
    state: Arc<ServerState>,
    sid: String,
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    mut control: broadcast::Receiver<Control>,
) {
    let mut namespaces: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            packet = inbound.recv() => {
                let Some(packet) = packet else { return };
                if packet == "1" {
                    return;
                }
                if packet == "2" {
                    let _ = outbound.send("3".to_string());
                    continue;
                }
                let Some(socket_packet) = packet.strip_prefix('4') else { continue };
                for reply in handle(&state, &sid, &mut namespaces, socket_packet) {
                    if outbound.send(reply).is_err() {
                        return;
                    }
                }
            }
            command = control.recv() => match command {
                Ok(Control::DropAll) | Err(_) => return,
                Ok(Control::Emit { namespace, event: name, data }) => {
                    if namespaces.contains(&namespace)
                        && outbound.send(event(&namespace, &name, data)).is_err()
                    {
                        return;
                    }
                }
                Ok(Control::Disconnect { namespace }) => {
                    if namespaces.remove(&namespace)
                        && outbound.send(socket_frame('1', &namespace, None)).is_err()
                    {
                        return;
                    }
                }
            },
        }
    }
}

/// Split a Socket.IO packet into its type, namespace and data
fn parse_socket(text: &str) -> Option<(char, String, Option<Value>)> {
    let mut chars = text.chars();
    let kind = chars.next()?;
    let rest = chars.as_str();

    let (namespace, rest) = if rest.starts_with('/') {
        match rest.find(',') {
            Some(i) => (rest[..i].to_string(), &rest[i + 1..]),
            None => (rest.to_string(), ""),
        }
    } else {
        ("/".to_string(), rest)
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let data = if rest.is_empty() {
        None
    } else {
        serde_json::from_str(rest).ok()
    };
    Some((kind, namespace, data))
}

fn socket_frame(kind: char, namespace: &str, data: Option<&Value>) -> String {
    let mut frame = format!("4{}", kind);
    if namespace != "/" {
        frame.push_str(namespace);
        frame.push(',');
    }
    if let Some(data) = data {
        frame.push_str(&data.to_string());
    }
    frame
}

fn event(namespace: &str, name: &str, data: Value) -> String {
    let args = if data.is_null() {
        json!([name])
    } else {
        json!([name, data])
    };
    socket_frame('2', namespace, Some(&args))
}

fn handle(
    state: &ServerState,
    sid: &str,
    namespaces: &mut HashSet<String>,
    packet: &str,
) -> Vec<String> {
    let Some((kind, ns, data)) = parse_socket(packet) else {
        return Vec::new();
    };
    match kind {
        '0' => {
            let token = data
                .as_ref()
                .and_then(|auth| auth.get("token"))
                .and_then(Value::as_str);
            if token != Some(state.valid_token.lock().as_str()) {
                let refusal = json!({ "message": "Authentication error" });
                return vec![socket_frame('4', &ns, Some(&refusal))];
            }

            namespaces.insert(ns.clone());
            state.connects.fetch_add(1, Ordering::SeqCst);
            let mut replies = vec![socket_frame('0', &ns, Some(&json!({ "sid": sid })))];
            if ns == "/chat" {
                replies.push(event(&ns, "connected", Value::Null));
            }
            replies
        }
        '1' => {
            namespaces.remove(&ns);
            Vec::new()
        }
        '2' => {
            let Some(Value::Array(mut args)) = data else {
                return Vec::new();
            };
            if args.is_empty() {
                return Vec::new();
            }
            let Value::String(name) = args.remove(0) else {
                return Vec::new();
            };
            let payload = args.into_iter().next().unwrap_or(Value::Null);
            state
                .received
                .lock()
                .push((ns.clone(), name.clone(), payload.clone()));
            respond(state, &ns, &name, &payload)
        }
        _ => Vec::new(),
    }
}

fn respond(state: &ServerState, ns: &str, name: &str, data: &Value) -> Vec<String> {
    match name {
        "joinImageRoom" => {
            let image = data["imageID"].clone();
            if image == "forbidden" {
                return vec![event(ns, "error", json!({ "message": "Access denied" }))];
            }
            let users = state.presence.lock().clone();
            vec![
                event(ns, "joinedImageRoom", json!({ "imageID": image })),
                event(ns, "onlineUsers", json!({ "imageID": image, "users": users })),
            ]
        }
        "sendMessage" => {
            if data["content"] == "fail" {
                return vec![event(ns, "error", json!({ "message": "Message rejected" }))];
            }
            let id = format!("m{}", state.next_id.fetch_add(1, Ordering::SeqCst));
            vec![
                event(ns, "messageSent", json!({ "id": id })),
                event(
                    ns,
                    "newMessage",
                    json!({
                        "id": id,
                        "imageID": data["imageID"],
                        "sender": "me",
                        "content": data["content"],
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }),
                ),
            ]
        }
        "ping" if !state.mute_pong.load(Ordering::SeqCst) => vec![event(ns, "pong", Value::Null)],
        _ => Vec::new(),
    }
}
