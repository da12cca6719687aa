//! Namespaces and the typed event payloads exchanged on them

pub mod events;

pub use events::{
    ChatMessage, Id, MessageSent, Notification, NotificationRead, OnlineUsers, OutgoingMessage,
    RoomRef, SenderRef, ServerError, UserTyping,
};

use std::fmt;

/// Logical channel multiplexed over the server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Default namespace carrying notification events
    Notifications,
    /// `/chat` namespace carrying room, message and presence events
    Chat,
}

impl Namespace {
    pub fn path(&self) -> &'static str {
        match self {
            Namespace::Notifications => "/",
            Namespace::Chat => "/chat",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
