//! Message construction and mutation.

use chrono::{DateTime, Utc};
use parlor_protocol::{
    ContentType, ControlOutcome, GroupId, MessageKind, MessageRecord, MessageStatus, StatusSet,
    TargetKind, UserId,
};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix of private message ids.
pub const PRIVATE_ID_PREFIX: &str = "pm_";

/// Prefix of group message ids.
pub const GROUP_ID_PREFIX: &str = "gm_";

/// Generate a public id for a message of the given target kind.
#[must_use]
pub fn generate_public_id(target: TargetKind) -> String {
    let prefix = match target {
        TargetKind::User => PRIVATE_ID_PREFIX,
        TargetKind::Group => GROUP_ID_PREFIX,
    };
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// A message about to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub public_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub message_type: MessageKind,
    pub target_type: TargetKind,
    pub sender_id: UserId,
    pub recipient_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub outcome: Option<ControlOutcome>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub extra: Map<String, Value>,
}

impl NewMessage {
    fn base(target_type: TargetKind, sender_id: UserId, content: String) -> Self {
        Self {
            public_id: generate_public_id(target_type),
            content,
            content_type: ContentType::default(),
            message_type: MessageKind::default(),
            target_type,
            sender_id,
            recipient_id: None,
            group_id: None,
            outcome: None,
            correlation_id: None,
            created_at: Utc::now(),
            extra: Map::new(),
        }
    }

    /// A message to one user.
    #[must_use]
    pub fn private(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            ..Self::base(TargetKind::User, sender_id, content.into())
        }
    }

    /// A message to a group.
    #[must_use]
    pub fn group(sender_id: UserId, group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id),
            ..Self::base(TargetKind::Group, sender_id, content.into())
        }
    }

    #[must_use]
    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Make this a control request awaiting a response.
    #[must_use]
    pub fn control(mut self) -> Self {
        self.message_type = MessageKind::Control;
        self.outcome = Some(ControlOutcome::Pending);
        self
    }

    #[must_use]
    pub fn extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Turn into the stored form. New messages start unread.
    #[must_use]
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            public_id: self.public_id,
            content: self.content,
            content_type: self.content_type,
            message_type: self.message_type,
            target_type: self.target_type,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            group_id: self.group_id,
            status: StatusSet::from([MessageStatus::Unread]),
            outcome: self.outcome,
            correlation_id: self.correlation_id,
            created_at: self.created_at,
            updated_at: self.created_at,
            read_at: None,
            extra: self.extra,
        }
    }
}

/// Change to an existing message.
///
/// Status flags, read time and control outcome are the only mutable parts
/// of a stored message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub add_status: Vec<MessageStatus>,
    pub remove_status: Vec<MessageStatus>,
    pub read_at: Option<DateTime<Utc>>,
    pub outcome: Option<ControlOutcome>,
}

impl MessageUpdate {
    /// Mark as read at `at`.
    #[must_use]
    pub fn mark_read(at: DateTime<Utc>) -> Self {
        Self {
            add_status: vec![MessageStatus::Read],
            remove_status: vec![MessageStatus::Unread],
            read_at: Some(at),
            outcome: None,
        }
    }

    /// Record the answer to a control request.
    #[must_use]
    pub fn answer(outcome: ControlOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }

    /// Apply to `record`, stamping `updated_at` with `now`.
    pub fn apply(&self, record: &mut MessageRecord, now: DateTime<Utc>) {
        for status in &self.remove_status {
            record.status.remove(status);
        }
        record.status.extend(self.add_status.iter().copied());
        if let Some(at) = self.read_at {
            record.read_at = Some(at);
        }
        if let Some(outcome) = self.outcome {
            record.outcome = Some(outcome);
        }
        record.updated_at = now;
    }
}
