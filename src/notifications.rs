//! Notification delivery client for the default namespace
//!
//! Notifications are kept most recent first. Marking one as read flips it
//! locally, then confirms through the [`NotificationApi`]; a failed
//! confirmation rolls the flag back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use url::Url;

use crate::connection::{ConnectionHandle, Lifecycle};
use crate::error::ActionError;
use crate::observer::{Subscribers, Subscription};
use crate::protocol::events::names;
use crate::protocol::{Id, Notification, NotificationRead, ServerError};
use crate::token::TokenProvider;

/// What changed in the notification list
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationUpdate {
    Received(Notification),
    Read {
        id: Id,
        read_at: Option<DateTime<Utc>>,
    },
    /// A read confirmation failed and the notification is unread again
    Unread(Id),
    /// The list was reseeded from the REST listing
    Replaced,
    ServerError(ServerError),
}

/// Result of starting a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Marked,
    /// Already read, or a confirmation is in flight. Nothing was sent.
    AlreadyRead,
}

/// Ordered notification list with optimistic read tracking
#[derive(Debug, Default)]
pub struct NotificationStore {
    items: Vec<Notification>,
    capacity: Option<usize>,
    in_flight: HashSet<Id>,
}

impl NotificationStore {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            capacity,
            in_flight: HashSet::new(),
        }
    }

    /// Prepend a pushed notification. Duplicates by id are rejected.
    pub fn insert(&mut self, notification: Notification) -> bool {
        if self.items.iter().any(|n| n.id == notification.id) {
            return false;
        }
        self.items.insert(0, notification);
        self.truncate();
        true
    }

    /// Reseed from a listing (most recent first). Reads still in flight stay
    /// marked so the optimistic flag is not lost.
    pub fn replace_all(&mut self, notifications: Vec<Notification>) {
        let mut seen = HashSet::new();
        self.items = notifications
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .map(|mut n| {
                if self.in_flight.contains(&n.id) {
                    n.read = true;
                }
                n
            })
            .collect();
        self.truncate();
    }

    pub fn begin_read(&mut self, id: &Id) -> Result<ReadOutcome, ActionError> {
        let notification = self
            .items
            .iter_mut()
            .find(|n| &n.id == id)
            .ok_or_else(|| ActionError::NotFound(format!("notification {}", id)))?;

        if notification.read || self.in_flight.contains(id) {
            return Ok(ReadOutcome::AlreadyRead);
        }

        notification.read = true;
        self.in_flight.insert(id.clone());
        Ok(ReadOutcome::Marked)
    }

    /// Record a confirmed read. Also applies reads made elsewhere.
    pub fn confirm_read(&mut self, id: &Id, read_at: Option<DateTime<Utc>>) -> bool {
        self.in_flight.remove(id);
        match self.items.iter_mut().find(|n| &n.id == id) {
            Some(notification) => {
                notification.read = true;
                if read_at.is_some() {
                    notification.read_at = read_at;
                }
                true
            }
            None => false,
        }
    }

    /// Undo an optimistic read
    pub fn rollback(&mut self, id: &Id) -> bool {
        if !self.in_flight.remove(id) {
            return false;
        }
        if let Some(notification) = self.items.iter_mut().find(|n| &n.id == id) {
            notification.read = false;
            notification.read_at = None;
        }
        true
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn get(&self, id: &Id) -> Option<&Notification> {
        self.items.iter().find(|n| &n.id == id)
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Enforce the capacity. Reads in flight for dropped items are forgotten.
    fn truncate(&mut self) {
        if let Some(capacity) = self.capacity {
            self.items.truncate(capacity);
        }
        let items = &self.items;
        self.in_flight.retain(|id| items.iter().any(|n| &n.id == id));
    }
}

/// REST side of the notification service
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Persist a read. Returns the server's read timestamp when it sends one.
    async fn mark_read(&self, id: &Id) -> Result<Option<DateTime<Utc>>, ActionError>;

    /// Most recent notifications, newest first
    async fn fetch_recent(&self) -> Result<Vec<Notification>, ActionError>;
}

/// [`NotificationApi`] over HTTP with bearer authentication
pub struct HttpNotificationApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Deserialize)]
struct ReadReceipt {
    #[serde(rename = "readAt", default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Plain(Vec<Notification>),
    Wrapped { notifications: Vec<Notification> },
}

impl HttpNotificationApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ActionError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ActionError::Request(format!("invalid API URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ActionError::Request("API URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> Result<String, ActionError> {
        self.tokens
            .token()
            .map(|token| token.expose().to_string())
            .ok_or_else(|| ActionError::Unauthorized("no token available".to_string()))
    }
}

/// The confirmation body is optional; only the timestamp is of interest
fn read_timestamp(id: &Id, body: &str) -> Option<DateTime<Utc>> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<ReadReceipt>(body) {
        Ok(receipt) => receipt.read_at,
        Err(e) => {
            tracing::warn!(notification = %id, "Ignoring malformed read confirmation: {}", e);
            None
        }
    }
}

fn check_status(status: StatusCode, what: &str) -> Result<(), ActionError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        404 => Err(ActionError::NotFound(what.to_string())),
        401 | 403 => Err(ActionError::Unauthorized(status.to_string())),
        _ => Err(ActionError::Request(format!("{}: HTTP {}", what, status))),
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn mark_read(&self, id: &Id) -> Result<Option<DateTime<Utc>>, ActionError> {
        let url = self.url(&["notifications", id.as_str(), "read"])?;
        let response = self
            .client
            .patch(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(|e| ActionError::Request(e.to_string()))?;

        check_status(response.status(), &format!("notification {}", id))?;

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(notification = %id, "Could not read confirmation body: {}", e);
                return Ok(None);
            }
        };
        Ok(read_timestamp(id, &body))
    }

    async fn fetch_recent(&self) -> Result<Vec<Notification>, ActionError> {
        let url = self.url(&["notifications"])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(|e| ActionError::Request(e.to_string()))?;

        check_status(response.status(), "notifications")?;

        let listing: Listing = response
            .json()
            .await
            .map_err(|e| ActionError::Request(e.to_string()))?;
        Ok(match listing {
            Listing::Plain(notifications) => notifications,
            Listing::Wrapped { notifications } => notifications,
        })
    }
}

/// Notification state bound to the default-namespace connection
pub struct NotificationClient {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionHandle,
    api: Arc<dyn NotificationApi>,
    store: Mutex<NotificationStore>,
    subscribers: Subscribers<NotificationUpdate>,
    registrations: Mutex<Vec<Subscription>>,
}

impl NotificationClient {
    /// Attach to a connection. Attach before starting a prepared connection
    /// to see every pushed notification.
    pub fn attach(
        connection: &ConnectionHandle,
        api: Arc<dyn NotificationApi>,
        capacity: Option<usize>,
    ) -> Self {
        let inner = Arc::new(Inner {
            connection: connection.clone(),
            api,
            store: Mutex::new(NotificationStore::new(capacity)),
            subscribers: Subscribers::new(),
            registrations: Mutex::new(Vec::new()),
        });

        let router = connection.router();
        let registrations = vec![
            router.on(names::NOTIFICATION, with(&inner, Inner::on_notification)),
            router.on(names::NOTIFICATION_READ, with(&inner, Inner::on_read)),
            router.on(names::ERROR, with(&inner, Inner::on_error)),
            router.on_lifecycle({
                let weak = Arc::downgrade(&inner);
                move |signal: &Lifecycle| {
                    if let (Some(inner), Lifecycle::Connected { recovered }) =
                        (weak.upgrade(), signal)
                    {
                        tracing::info!(
                            recovered,
                            unread = inner.store.lock().unread_count(),
                            "Notifications online"
                        );
                    }
                }
            }),
        ];
        *inner.registrations.lock() = registrations;

        Self { inner }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NotificationUpdate) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.subscribers.unsubscribe(subscription)
    }

    /// Mark a notification as read.
    ///
    /// Unknown ids fail with `NotFound` without a request. A failed
    /// confirmation restores the unread flag and returns the error.
    pub async fn mark_as_read(&self, id: impl Into<Id>) -> Result<ReadOutcome, ActionError> {
        let id = id.into();
        let outcome = self.inner.store.lock().begin_read(&id)?;
        if outcome == ReadOutcome::AlreadyRead {
            return Ok(outcome);
        }

        self.inner.subscribers.notify(&NotificationUpdate::Read {
            id: id.clone(),
            read_at: None,
        });

        match self.inner.api.mark_read(&id).await {
            Ok(read_at) => {
                self.inner.store.lock().confirm_read(&id, read_at);
                if read_at.is_some() {
                    self.inner
                        .subscribers
                        .notify(&NotificationUpdate::Read { id, read_at });
                }
                Ok(ReadOutcome::Marked)
            }
            Err(err) => {
                tracing::warn!(notification = %id, "Mark as read failed: {}", err);
                if self.inner.store.lock().rollback(&id) {
                    self.inner
                        .subscribers
                        .notify(&NotificationUpdate::Unread(id));
                }
                Err(err)
            }
        }
    }

    pub fn unread_count(&self) -> usize {
        self.inner.store.lock().unread_count()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.inner.store.lock().snapshot()
    }

    pub fn get(&self, id: &Id) -> Option<Notification> {
        self.inner.store.lock().get(id).cloned()
    }

    pub fn replace_all(&self, notifications: Vec<Notification>) {
        self.inner.store.lock().replace_all(notifications);
        self.inner.subscribers.notify(&NotificationUpdate::Replaced);
    }

    /// Reseed from the REST listing
    pub async fn refresh(&self) -> Result<usize, ActionError> {
        let notifications = self.inner.api.fetch_recent().await?;
        let count = notifications.len();
        self.replace_all(notifications);
        tracing::debug!(count, "Notifications refreshed");
        Ok(count)
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.inner.connection
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        let router = self.inner.connection.router();
        for registration in self.inner.registrations.lock().drain(..) {
            router.off(registration);
        }
    }
}

/// Route a typed event to a method of a live client
fn with<T>(inner: &Arc<Inner>, method: fn(&Inner, T)) -> impl Fn(T) + Send + Sync + 'static
where
    T: 'static,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    move |payload| {
        if let Some(inner) = weak.upgrade() {
            method(&inner, payload);
        }
    }
}

impl Inner {
    fn on_notification(&self, notification: Notification) {
        let inserted = self.store.lock().insert(notification.clone());
        if !inserted {
            tracing::debug!(notification = %notification.id, "Ignoring duplicate notification");
            return;
        }
        tracing::info!(notification = %notification.id, kind = %notification.kind, "Notification received");
        self.subscribers
            .notify(&NotificationUpdate::Received(notification));
    }

    fn on_read(&self, read: NotificationRead) {
        if !self.store.lock().confirm_read(&read.id, read.read_at) {
            tracing::debug!(notification = %read.id, "Read acknowledgement for unknown notification");
            return;
        }
        self.subscribers.notify(&NotificationUpdate::Read {
            id: read.id,
            read_at: read.read_at,
        });
    }

    fn on_error(&self, error: ServerError) {
        tracing::warn!("Notification server error: {}", error.message);
        self.subscribers
            .notify(&NotificationUpdate::ServerError(error));
    }
}
