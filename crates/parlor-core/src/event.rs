//! Domain events.
//!
//! Admission, disconnect and message creation publish these on the
//! [`EventBus`](crate::bus::EventBus); reactions such as presence broadcast
//! and fan-out subscribe by [`EventKind`].

use chrono::{DateTime, Utc};
use parlor_protocol::{MessageRecord, UserId};
use parlor_transport::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::session::{DeviceId, DeviceSession};

/// Discriminant of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "user.login")]
    UserLogin,
    #[serde(rename = "user.logout")]
    UserLogout,
    #[serde(rename = "user.status_changed")]
    UserStatusChanged,
    #[serde(rename = "message.private.sent")]
    PrivateMessageSent,
    #[serde(rename = "message.group.sent")]
    GroupMessageSent,
    #[serde(rename = "message.read")]
    MessageRead,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "device.connected")]
    DeviceConnected,
    #[serde(rename = "device.disconnected")]
    DeviceDisconnected,
    #[serde(rename = "device.status_changed")]
    DeviceStatusChanged,
    #[serde(rename = "connection.opened")]
    ConnectionOpened,
    #[serde(rename = "connection.closed")]
    ConnectionClosed,
    #[serde(rename = "connection.error")]
    ConnectionError,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 13] = [
        EventKind::UserLogin,
        EventKind::UserLogout,
        EventKind::UserStatusChanged,
        EventKind::PrivateMessageSent,
        EventKind::GroupMessageSent,
        EventKind::MessageRead,
        EventKind::MessageDeleted,
        EventKind::DeviceConnected,
        EventKind::DeviceDisconnected,
        EventKind::DeviceStatusChanged,
        EventKind::ConnectionOpened,
        EventKind::ConnectionClosed,
        EventKind::ConnectionError,
    ];

    /// Stable dotted name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::UserLogin => "user.login",
            EventKind::UserLogout => "user.logout",
            EventKind::UserStatusChanged => "user.status_changed",
            EventKind::PrivateMessageSent => "message.private.sent",
            EventKind::GroupMessageSent => "message.group.sent",
            EventKind::MessageRead => "message.read",
            EventKind::MessageDeleted => "message.deleted",
            EventKind::DeviceConnected => "device.connected",
            EventKind::DeviceDisconnected => "device.disconnected",
            EventKind::DeviceStatusChanged => "device.status_changed",
            EventKind::ConnectionOpened => "connection.opened",
            EventKind::ConnectionClosed => "connection.closed",
            EventKind::ConnectionError => "connection.error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something happened to a user.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub user_id: UserId,
    pub connection_id: Option<ConnectionId>,
    pub device_id: Option<DeviceId>,
}

impl UserEvent {
    /// The user went offline (their last handle closed).
    #[must_use]
    pub fn went_offline(session: &DeviceSession) -> Self {
        Self {
            kind: EventKind::UserStatusChanged,
            created_at: Utc::now(),
            payload: json!({ "online": false }),
            user_id: session.user_id,
            connection_id: Some(session.connection_id.clone()),
            device_id: Some(session.device_id.clone()),
        }
    }
}

/// A message was created or changed.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub message: MessageRecord,
    /// Handle the message arrived on. Excluded from fan-out.
    pub origin: Option<ConnectionId>,
    attempts: u32,
}

impl MessageEvent {
    /// Delivery attempts after which the event is treated as poison.
    pub const MAX_ATTEMPTS: u32 = 3;

    /// A new message was stored.
    #[must_use]
    pub fn sent(message: MessageRecord, origin: Option<ConnectionId>) -> Self {
        let kind = if message.is_group() {
            EventKind::GroupMessageSent
        } else {
            EventKind::PrivateMessageSent
        };
        Self {
            kind,
            created_at: Utc::now(),
            payload: Value::Null,
            message,
            origin,
            attempts: 0,
        }
    }

    /// A recipient read the message.
    #[must_use]
    pub fn read(message: MessageRecord, reader_id: UserId) -> Self {
        Self {
            kind: EventKind::MessageRead,
            created_at: Utc::now(),
            payload: json!({ "reader_id": reader_id }),
            message,
            origin: None,
            attempts: 0,
        }
    }

    /// Public id of the message.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message.public_id
    }

    /// Key used to suppress duplicate deliveries.
    ///
    /// Includes the record's update time so a changed message is delivered again.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.message.public_id,
            self.message.updated_at.timestamp_micros()
        )
    }

    /// Attempts recorded so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one delivery attempt.
    ///
    /// Returns `false` once the attempt cap has been exceeded.
    pub fn record_attempt(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts <= Self::MAX_ATTEMPTS
    }

    /// Check whether the attempt cap has been reached.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= Self::MAX_ATTEMPTS
    }
}

/// Something happened to a device.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub connection_id: Option<ConnectionId>,
}

impl DeviceEvent {
    /// The device has no live handle left.
    #[must_use]
    pub fn disconnected(session: &DeviceSession) -> Self {
        Self {
            kind: EventKind::DeviceDisconnected,
            created_at: Utc::now(),
            payload: Value::Null,
            device_id: session.device_id.clone(),
            user_id: session.user_id,
            connection_id: Some(session.connection_id.clone()),
        }
    }
}

/// A connection opened or closed.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub username: Option<String>,
}

impl ConnectionEvent {
    fn from_session(kind: EventKind, session: &DeviceSession, username: Option<String>) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
            payload: json!({ "origin": session.origin }),
            connection_id: session.connection_id.clone(),
            user_id: session.user_id,
            device_id: session.device_id.clone(),
            username,
        }
    }

    /// A connection was admitted.
    #[must_use]
    pub fn opened(session: &DeviceSession, username: Option<String>) -> Self {
        Self::from_session(EventKind::ConnectionOpened, session, username)
    }

    /// An admitted connection closed.
    #[must_use]
    pub fn closed(session: &DeviceSession, username: Option<String>) -> Self {
        Self::from_session(EventKind::ConnectionClosed, session, username)
    }
}

/// Any domain event.
#[derive(Debug, Clone)]
pub enum Event {
    User(UserEvent),
    Message(MessageEvent),
    Device(DeviceEvent),
    Connection(ConnectionEvent),
}

impl Event {
    /// Kind of the event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::User(e) => e.kind,
            Event::Message(e) => e.kind,
            Event::Device(e) => e.kind,
            Event::Connection(e) => e.kind,
        }
    }

    /// When the event was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Event::User(e) => e.created_at,
            Event::Message(e) => e.created_at,
            Event::Device(e) => e.created_at,
            Event::Connection(e) => e.created_at,
        }
    }

    /// Free-form payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        match self {
            Event::User(e) => &e.payload,
            Event::Message(e) => &e.payload,
            Event::Device(e) => &e.payload,
            Event::Connection(e) => &e.payload,
        }
    }

    /// Message id, for message events.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Event::Message(e) => Some(e.message_id()),
            _ => None,
        }
    }

    /// User the event concerns. For messages this is the sender.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        match self {
            Event::User(e) => e.user_id,
            Event::Message(e) => e.message.sender_id,
            Event::Device(e) => e.user_id,
            Event::Connection(e) => e.user_id,
        }
    }
}

impl From<UserEvent> for Event {
    fn from(e: UserEvent) -> Self {
        Event::User(e)
    }
}

impl From<MessageEvent> for Event {
    fn from(e: MessageEvent) -> Self {
        Event::Message(e)
    }
}

impl From<DeviceEvent> for Event {
    fn from(e: DeviceEvent) -> Self {
        Event::Device(e)
    }
}

impl From<ConnectionEvent> for Event {
    fn from(e: ConnectionEvent) -> Self {
        Event::Connection(e)
    }
}
