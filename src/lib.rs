//! medrt - real-time notification and chat client core
//!
//! One [`ConnectionManager`] owns a Socket.IO connection per namespace.
//! [`NotificationClient`] and [`ChatSession`] attach to those connections
//! and keep the local state (notifications, rooms, messages, presence) the
//! UI reads.

pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod notifications;
pub mod observer;
pub mod protocol;
pub mod rooms;
pub mod router;
pub mod token;

pub use chat::{ChatSession, MessageLog, PendingSend};
pub use config::{ConnectOptions, HeartbeatConfig, ReconnectPolicy, Transport};
pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, DisconnectReason, Health, Lifecycle,
};
pub use error::{ActionError, ConnectionError, Error, ProtocolError, Result};
pub use notifications::{
    HttpNotificationApi, NotificationApi, NotificationClient, NotificationStore,
    NotificationUpdate, ReadOutcome,
};
pub use observer::Subscription;
pub use protocol::{Id, Namespace};
pub use rooms::{RoomState, RoomTracker};
pub use router::EventRouter;
pub use token::{AuthToken, StaticToken, TokenProvider};
