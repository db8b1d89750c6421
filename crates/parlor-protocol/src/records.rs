//! Message records and the value types carried inside frames.
//!
//! A [`MessageRecord`] is the full persisted shape of a chat message. It is
//! what storage hands back after a write and what fan-out delivers to every
//! recipient handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Numeric user identity.
pub type UserId = i64;

/// Numeric group identity.
pub type GroupId = i64;

/// How the content of a message should be rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    RichText,
    Url,
    Audio,
    Image,
    Video,
    File,
    #[default]
    PlainText,
    UserList,
    Html,
}

/// Whether a message is ordinary chat or a negotiated control exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Chat,
    Control,
}

/// Who a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Group,
}

impl TargetKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Group => "group",
        }
    }
}

/// A single status flag. A message carries a set of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
    Sent,
    Delivered,
    Deleted,
    Recalled,
}

/// Status flags of a message. Ordered so the wire form is stable.
pub type StatusSet = BTreeSet<MessageStatus>;

/// Outcome of a control exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    Pending,
    Accepted,
    Rejected,
}

impl ControlOutcome {
    /// Whether this outcome answers a pending request.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, ControlOutcome::Accepted | ControlOutcome::Rejected)
    }
}

impl fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlOutcome::Pending => "pending",
            ControlOutcome::Accepted => "accepted",
            ControlOutcome::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Globally unique id, prefixed by target kind. Never changes.
    pub public_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub message_type: MessageKind,
    pub target_type: TargetKind,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub status: StatusSet,
    /// Set on control messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ControlOutcome>,
    /// Public id of the request a control response refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl MessageRecord {
    /// Check whether a status flag is set.
    #[must_use]
    pub fn has_status(&self, status: MessageStatus) -> bool {
        self.status.contains(&status)
    }

    /// Check whether this is a group message.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.target_type == TargetKind::Group
    }
}

/// An inbound chat payload as sent by a client.
///
/// Any `sender_id` the client includes is ignored; the sender is always
/// taken from the bound session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ControlOutcome>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ChatPayload {
    /// Plain chat text to a user by name.
    #[must_use]
    pub fn to_user(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient_username: Some(username.into()),
            ..Self::default()
        }
    }

    /// Plain chat text to a group.
    #[must_use]
    pub fn to_group(group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            group_id: Some(group_id),
            ..Self::default()
        }
    }
}

/// Kind of presence broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    WebsocketConnected,
    WebsocketDisconnected,
    UserOffline,
}

/// Body of a presence broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceNotice {
    /// Connection handle the notice is about.
    pub sid: String,
    pub user_id: UserId,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}
