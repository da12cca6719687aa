//! Chat session client for the `/chat` namespace
//!
//! Rooms are keyed by image id. Membership follows [`RoomTracker`]; sent
//! messages are matched to `messageSent` acknowledgements in FIFO order.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

use crate::connection::{ConnectionHandle, DisconnectReason, Health, Lifecycle};
use crate::error::ActionError;
use crate::observer::{Subscribers, Subscription};
use crate::protocol::events::names;
use crate::protocol::{
    ChatMessage, Id, MessageSent, OnlineUsers, OutgoingMessage, RoomRef, SenderRef, ServerError,
    UserTyping,
};
use crate::rooms::{RoomState, RoomTracker};
use crate::router::Empty;

/// Messages per room in server-delivery order, unique by id
#[derive(Debug, Default)]
pub struct MessageLog {
    rooms: HashMap<Id, Vec<ChatMessage>>,
    seen: HashSet<Id>,
}

impl MessageLog {
    /// Returns false for a message already in the log
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.rooms
            .entry(message.image_id.clone())
            .or_default()
            .push(message);
        true
    }

    pub fn messages(&self, room: &Id) -> &[ChatMessage] {
        self.rooms.get(room).map_or(&[], Vec::as_slice)
    }

    /// Drop a room's messages. Their ids may be delivered again later.
    pub fn clear_room(&mut self, room: &Id) {
        if let Some(messages) = self.rooms.remove(room) {
            for message in messages {
                self.seen.remove(&message.id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

type SendReply = oneshot::Sender<Result<Id, ActionError>>;

/// Acknowledgement of a sent message. Await it for the server-assigned
/// message id, or drop it to fire and forget.
#[must_use = "dropping a PendingSend ignores the acknowledgement"]
pub struct PendingSend {
    reply: oneshot::Receiver<Result<Id, ActionError>>,
}

impl Future for PendingSend {
    type Output = Result<Id, ActionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(ActionError::Cancelled)))
    }
}

struct Session {
    rooms: RoomTracker,
    log: MessageLog,
    pending: VecDeque<(Id, SendReply)>,
    health: Health,
}

struct Inner {
    connection: ConnectionHandle,
    session: Mutex<Session>,
    messages: Subscribers<ChatMessage>,
    typing: Subscribers<UserTyping>,
    presence: Subscribers<OnlineUsers>,
    errors: Subscribers<ServerError>,
    health: Subscribers<Health>,
    /// Bumped whenever a room's membership state changes
    membership: watch::Sender<u64>,
    registrations: Mutex<Vec<Subscription>>,
}

/// Chat state bound to a `/chat` connection
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    /// Attach to a connection. Rooms joined before a drop are requested
    /// again once it reconnects.
    pub fn attach(connection: &ConnectionHandle) -> Self {
        let inner = Arc::new(Inner {
            connection: connection.clone(),
            session: Mutex::new(Session {
                rooms: RoomTracker::new(),
                log: MessageLog::default(),
                pending: VecDeque::new(),
                health: Health::Healthy,
            }),
            messages: Subscribers::new(),
            typing: Subscribers::new(),
            presence: Subscribers::new(),
            errors: Subscribers::new(),
            health: Subscribers::new(),
            membership: watch::channel(0).0,
            registrations: Mutex::new(Vec::new()),
        });

        let registrations = vec![
            route(&inner, names::CONNECTED, |_, _: Empty| {
                tracing::debug!("Chat server greeted")
            }),
            route(&inner, names::JOINED_IMAGE_ROOM, Inner::on_joined),
            route(&inner, names::NEW_MESSAGE, Inner::on_new_message),
            route(&inner, names::MESSAGE_SENT, Inner::on_message_sent),
            route(&inner, names::USER_TYPING, |inner: &Inner, typing: UserTyping| {
                inner.typing.notify(&typing)
            }),
            route(&inner, names::ONLINE_USERS, Inner::on_online_users),
            route(&inner, names::ERROR, Inner::on_error),
            connection.router().on_lifecycle({
                let weak = Arc::downgrade(&inner);
                move |signal: &Lifecycle| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_lifecycle(signal);
                    }
                }
            }),
        ];
        *inner.registrations.lock() = registrations;

        Self { inner }
    }

    /// Request to join an image room. Completes locally; the room becomes
    /// `Joined` when the server confirms.
    pub fn join(&self, room: impl Into<Id>) -> Result<(), ActionError> {
        let room = room.into();
        let mut session = self.inner.session.lock();
        if !session.rooms.begin_join(&room) {
            return Ok(());
        }

        let request = RoomRef {
            image_id: room.clone(),
        };
        if let Err(err) = self.inner.emit(names::JOIN_IMAGE_ROOM, &request) {
            session.rooms.fail_join(&room);
            return Err(err);
        }
        drop(session);
        self.inner.membership_changed();
        tracing::info!(room = %room, "Joining room");
        Ok(())
    }

    /// Wait for a requested room to be confirmed. Fails once the room is
    /// no longer being joined: the server rejected it, it was left, or the
    /// connection dropped first.
    pub async fn wait_joined(&self, room: &Id) -> Result<(), ActionError> {
        let mut changes = self.inner.membership.subscribe();
        loop {
            match self.room_state(room) {
                RoomState::Joined => return Ok(()),
                RoomState::Joining => {}
                RoomState::NotJoined => return Err(ActionError::NotJoined(room.to_string())),
            }
            if changes.changed().await.is_err() {
                return Err(ActionError::Cancelled);
            }
        }
    }

    /// Leave a room. It will not be rejoined after a reconnect.
    pub fn leave(&self, room: impl Into<Id>) -> Result<(), ActionError> {
        let room = room.into();
        {
            let mut session = self.inner.session.lock();
            session.log.clear_room(&room);
            if session.rooms.leave(&room) == RoomState::NotJoined {
                return Ok(());
            }
        }
        self.inner.membership_changed();

        tracing::info!(room = %room, "Leaving room");
        match self
            .inner
            .emit(names::LEAVE_IMAGE_ROOM, &RoomRef { image_id: room })
        {
            // The server drops memberships of a closed socket anyway
            Ok(()) | Err(ActionError::NotConnected) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Send a message to a joined room
    pub fn send(
        &self,
        room: impl Into<Id>,
        content: impl Into<String>,
    ) -> Result<PendingSend, ActionError> {
        let room = room.into();
        let mut session = self.inner.session.lock();
        if session.rooms.state(&room) != RoomState::Joined {
            return Err(ActionError::NotJoined(room.to_string()));
        }

        let message = OutgoingMessage {
            image_id: room.clone(),
            content: content.into(),
        };
        self.inner.emit(names::SEND_MESSAGE, &message)?;

        let (reply, pending) = oneshot::channel();
        session.pending.push_back((room, reply));
        Ok(PendingSend { reply: pending })
    }

    /// Tell the room this user is typing
    pub fn typing(&self, room: impl Into<Id>) -> Result<(), ActionError> {
        let room = room.into();
        if self.room_state(&room) != RoomState::Joined {
            return Err(ActionError::NotJoined(room.to_string()));
        }
        self.inner
            .emit(names::TYPING, &RoomRef { image_id: room })
    }

    /// Application-level ping; the reply is tracked by the heartbeat
    pub fn ping(&self) -> Result<(), ActionError> {
        self.inner.emit(names::PING, &Empty)
    }

    pub fn messages(&self, room: &Id) -> Vec<ChatMessage> {
        self.inner.session.lock().log.messages(room).to_vec()
    }

    pub fn online_users(&self, room: &Id) -> Vec<SenderRef> {
        self.inner.session.lock().rooms.online_users(room)
    }

    pub fn room_state(&self, room: &Id) -> RoomState {
        self.inner.session.lock().rooms.state(room)
    }

    pub fn joined_rooms(&self) -> Vec<Id> {
        self.inner.session.lock().rooms.joined()
    }

    pub fn health(&self) -> Health {
        self.inner.session.lock().health
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.inner.connection
    }

    /// New messages, each delivered once
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(callback)
    }

    pub fn on_typing<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UserTyping) + Send + Sync + 'static,
    {
        self.inner.typing.subscribe(callback)
    }

    pub fn on_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OnlineUsers) + Send + Sync + 'static,
    {
        self.inner.presence.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ServerError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    pub fn on_health<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Health) + Send + Sync + 'static,
    {
        self.inner.health.subscribe(callback)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let inner = &self.inner;
        inner.messages.unsubscribe(subscription)
            || inner.typing.unsubscribe(subscription)
            || inner.presence.unsubscribe(subscription)
            || inner.errors.unsubscribe(subscription)
            || inner.health.unsubscribe(subscription)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let router = self.inner.connection.router();
        for registration in self.inner.registrations.lock().drain(..) {
            router.off(registration);
        }
    }
}

fn route<T, F>(inner: &Arc<Inner>, event: &str, handler: F) -> Subscription
where
    T: DeserializeOwned + 'static,
    F: Fn(&Inner, T) + Send + Sync + 'static,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    inner.connection.router().on(event, move |payload: T| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, payload);
        }
    })
}

impl Inner {
    fn emit<T: serde::Serialize>(&self, event: &str, payload: &T) -> Result<(), ActionError> {
        self.connection.router().emit(event, payload)
    }

    fn membership_changed(&self) {
        self.membership.send_modify(|version| *version += 1);
    }

    fn on_joined(&self, room: RoomRef) {
        let confirmed = self.session.lock().rooms.confirm_join(&room.image_id);
        if confirmed {
            tracing::info!(room = %room.image_id, "Joined room");
            self.membership_changed();
        } else {
            tracing::debug!(room = %room.image_id, "Ignoring unsolicited join confirmation");
        }
    }

    fn on_new_message(&self, message: ChatMessage) {
        {
            let mut session = self.session.lock();
            if session.rooms.state(&message.image_id) == RoomState::NotJoined {
                tracing::debug!(room = %message.image_id, message = %message.id, "Ignoring message for a room we are not in");
                return;
            }
            if !session.log.append(message.clone()) {
                tracing::debug!(message = %message.id, "Ignoring duplicate message");
                return;
            }
        }
        self.messages.notify(&message);
    }

    fn on_message_sent(&self, ack: MessageSent) {
        let pending = self.session.lock().pending.pop_front();
        match pending {
            Some((room, reply)) => {
                tracing::debug!(room = %room, message = %ack.id, "Message acknowledged");
                let _ = reply.send(Ok(ack.id));
            }
            None => tracing::debug!(message = %ack.id, "Acknowledgement with no pending send"),
        }
    }

    fn on_online_users(&self, online: OnlineUsers) {
        let accepted = self
            .session
            .lock()
            .rooms
            .replace_presence(&online.image_id, online.users.clone());
        if accepted {
            self.presence.notify(&online);
        } else {
            tracing::debug!(room = %online.image_id, "Ignoring presence for a room we are not in");
        }
    }

    /// The server reports failures without saying which request failed:
    /// blame the oldest pending send, then the oldest join.
    fn on_error(&self, error: ServerError) {
        tracing::warn!("Chat server error: {}", error.message);
        let rejected_join = {
            let mut session = self.session.lock();
            if let Some((room, reply)) = session.pending.pop_front() {
                tracing::debug!(room = %room, "Failing pending send");
                let _ = reply.send(Err(ActionError::Rejected(error.message.clone())));
                None
            } else {
                session.rooms.fail_oldest_joining()
            }
        };
        if let Some(room) = rejected_join {
            tracing::info!(room = %room, "Join rejected");
            self.membership_changed();
        }
        self.errors.notify(&error);
    }

    fn on_lifecycle(&self, signal: &Lifecycle) {
        match signal {
            Lifecycle::Connected { .. } => self.rejoin(),
            Lifecycle::Disconnected(reason) => self.connection_lost(reason),
            Lifecycle::Health(health) => {
                self.session.lock().health = *health;
                self.health.notify(health);
            }
            Lifecycle::ConnectionError(_) => {}
        }
    }

    fn rejoin(&self) {
        let mut session = self.session.lock();
        session.health = Health::Healthy;
        let rooms = session.rooms.take_rejoins();
        if rooms.is_empty() {
            return;
        }
        for room in rooms {
            let request = RoomRef {
                image_id: room.clone(),
            };
            match self.emit(names::JOIN_IMAGE_ROOM, &request) {
                Ok(()) => tracing::info!(room = %room, "Rejoining room"),
                Err(err) => {
                    tracing::warn!(room = %room, "Rejoin failed: {}", err);
                    session.rooms.fail_join(&room);
                }
            }
        }
        drop(session);
        self.membership_changed();
    }

    fn connection_lost(&self, reason: &DisconnectReason) {
        let mut session = self.session.lock();

        let error = if *reason == DisconnectReason::ClientDisconnect {
            ActionError::Cancelled
        } else {
            ActionError::ConnectionLost
        };
        for (_, reply) in session.pending.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }

        // Rooms that come back keep their history
        if reason.is_recoverable() {
            session.rooms.connection_lost();
        } else {
            session.rooms.reset();
            session.log.clear();
        }
        drop(session);
        self.membership_changed();
    }
}
