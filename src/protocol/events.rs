//! Event payloads for the notification and chat namespaces
//!
//! Field names follow the backend's JSON (camelCase, `imageID`, `userID`).
//! Identifiers arrive as strings or integers depending on the collection,
//! so they are normalized into [`Id`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Event names used on the wire
pub mod names {
    // Default namespace
    pub const NOTIFICATION: &str = "notification";
    pub const NOTIFICATION_READ: &str = "notification_read";
    pub const ERROR: &str = "error";

    // Chat namespace, client to server
    pub const JOIN_IMAGE_ROOM: &str = "joinImageRoom";
    pub const LEAVE_IMAGE_ROOM: &str = "leaveImageRoom";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const TYPING: &str = "typing";
    pub const PING: &str = "ping";

    // Chat namespace, server to client
    pub const CONNECTED: &str = "connected";
    pub const JOINED_IMAGE_ROOM: &str = "joinedImageRoom";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const MESSAGE_SENT: &str = "messageSent";
    pub const USER_TYPING: &str = "userTyping";
    pub const ONLINE_USERS: &str = "onlineUsers";
    pub const PONG: &str = "pong";
}

/// Server-assigned identifier (notification, message, user, image)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Id {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Ok(Id(text)),
            Raw::Number(number) => Ok(Id(number.to_string())),
        }
    }
}

/// Who sent a notification or message: a bare id or an embedded user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderRef {
    Id(Id),
    Profile {
        #[serde(alias = "_id")]
        id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl SenderRef {
    pub fn id(&self) -> &Id {
        match self {
            SenderRef::Id(id) => id,
            SenderRef::Profile { id, .. } => id,
        }
    }
}

/// A notification as pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "_id")]
    pub id: Id,
    pub title: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderRef>,
}

/// Server confirmation that a notification was read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRead {
    #[serde(alias = "_id")]
    pub id: Id,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// `error` event payload on either namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
}

/// A chat message in an image room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(alias = "_id")]
    pub id: Id,
    #[serde(rename = "imageID")]
    pub image_id: Id,
    #[serde(alias = "senderID")]
    pub sender: SenderRef,
    pub content: String,
    #[serde(alias = "createdAt")]
    pub timestamp: DateTime<Utc>,
}

/// Payload naming a room: join, leave, join confirmation, typing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    #[serde(rename = "imageID")]
    pub image_id: Id,
}

/// `sendMessage` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(rename = "imageID")]
    pub image_id: Id,
    pub content: String,
}

/// `messageSent` acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSent {
    #[serde(alias = "_id")]
    pub id: Id,
}

/// `userTyping` indicator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTyping {
    #[serde(rename = "userID")]
    pub user_id: Id,
    #[serde(rename = "imageID")]
    pub image_id: Id,
}

/// `onlineUsers` presence snapshot for one room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUsers {
    #[serde(rename = "imageID")]
    pub image_id: Id,
    pub users: Vec<SenderRef>,
}
