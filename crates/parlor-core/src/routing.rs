//! Message router.
//!
//! Validates an inbound chat payload against the sender's session, persists
//! it (group messages into the current monthly partition) and publishes
//! exactly one message event. Nothing is published for a rejected or
//! unpersisted message.

use chrono::Utc;
use parlor_protocol::{
    codes, ChatPayload, ControlOutcome, GroupId, MessageKind, MessageRecord, TargetKind, UserId,
};
use parlor_transport::ConnectionId;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::directory::{DirectoryError, GroupDirectory, UserDirectory};
use crate::event::MessageEvent;
use crate::message::{MessageUpdate, NewMessage};
use crate::partition::{PartitionCatalog, PartitionName};
use crate::room::{derive_private_name, group_room_name, RoomRegistry};
use crate::session::SessionRegistry;
use crate::store::{MessageStore, StoreError};
use crate::telemetry;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The connection has no bound session.
    #[error("Connection {0} is not admitted")]
    UnknownSender(ConnectionId),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("User {user_id} is not a member of group {group_id}")]
    NotGroupMember { user_id: UserId, group_id: GroupId },

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// The sender may not change this message.
    #[error("User {user_id} may not modify message {public_id}")]
    Forbidden { user_id: UserId, public_id: String },

    #[error("Malformed message: {0}")]
    Malformed(&'static str),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// The message could not be stored.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl RouterError {
    /// Error code sent back to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouterError::UnknownSender(_) => codes::UNAUTHORIZED,
            RouterError::UnknownRecipient(_)
            | RouterError::UnknownGroup(_)
            | RouterError::UnknownMessage(_) => codes::NOT_FOUND,
            RouterError::NotGroupMember { .. } | RouterError::Forbidden { .. } => codes::FORBIDDEN,
            RouterError::Malformed(_) => codes::BAD_REQUEST,
            RouterError::Directory(_) => codes::INTERNAL,
            RouterError::Persistence(_) => codes::STORAGE,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            RouterError::UnknownSender(_) => "unknown_sender",
            RouterError::UnknownRecipient(_) => "unknown_recipient",
            RouterError::UnknownGroup(_) => "unknown_group",
            RouterError::NotGroupMember { .. } => "not_member",
            RouterError::UnknownMessage(_) => "unknown_message",
            RouterError::Forbidden { .. } => "forbidden",
            RouterError::Malformed(_) => "malformed",
            RouterError::Directory(_) => "directory",
            RouterError::Persistence(_) => "persistence",
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum content length in bytes.
    pub max_content_length: usize,
    /// Page size used when a history request names none.
    pub default_history_limit: usize,
    /// Largest page a history request may ask for.
    pub max_history_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_content_length: 64 * 1024,
            default_history_limit: 50,
            max_history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    User(UserId),
    Group(GroupId),
}

/// A page of group history.
#[derive(Debug, Clone)]
pub struct GroupHistory {
    /// Partition the page was read from; `None` if the group has no messages yet.
    pub partition: Option<PartitionName>,
    pub messages: Vec<MessageRecord>,
}

/// Persists and publishes chat messages.
pub struct MessageRouter {
    config: RouterConfig,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    users: Arc<dyn UserDirectory>,
    groups: Arc<dyn GroupDirectory>,
    store: Arc<dyn MessageStore>,
    catalog: Arc<PartitionCatalog>,
    bus: Arc<EventBus>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: RouterConfig,
        sessions: Arc<SessionRegistry>,
        rooms: Arc<RoomRegistry>,
        users: Arc<dyn UserDirectory>,
        groups: Arc<dyn GroupDirectory>,
        store: Arc<dyn MessageStore>,
        catalog: Arc<PartitionCatalog>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            sessions,
            rooms,
            users,
            groups,
            store,
            catalog,
            bus,
        }
    }

    fn sender(&self, origin: &ConnectionId) -> Result<UserId, RouterError> {
        self.sessions
            .user_of(origin)
            .ok_or_else(|| RouterError::UnknownSender(origin.clone()))
    }

    /// Route a chat payload that arrived on `origin`.
    ///
    /// The sender is always the user bound to `origin`. On success the stored
    /// record is returned and one message event has been published.
    ///
    /// # Errors
    ///
    /// Returns a [`RouterError`] for an unknown sender, target or group, a
    /// malformed payload, or a storage failure. No event is published then.
    pub async fn route(
        &self,
        origin: &ConnectionId,
        payload: ChatPayload,
    ) -> Result<MessageRecord, RouterError> {
        let result = self.route_inner(origin, payload).await;
        if let Err(e) = &result {
            warn!(connection = %origin, error = %e, "Message rejected");
            telemetry::record_message_rejected(e.reason());
        }
        result
    }

    async fn route_inner(
        &self,
        origin: &ConnectionId,
        payload: ChatPayload,
    ) -> Result<MessageRecord, RouterError> {
        let sender = self.sender(origin)?;
        let kind = payload.message_type.unwrap_or_default();
        let is_response = kind == MessageKind::Control
            && payload.outcome.is_some_and(ControlOutcome::is_response);

        if payload.content.trim().is_empty() && !is_response {
            return Err(RouterError::Malformed("content is empty"));
        }
        if payload.content.len() > self.config.max_content_length {
            return Err(RouterError::Malformed("content is too long"));
        }

        let target = self.resolve_target(sender, &payload).await?;
        if kind == MessageKind::Control && matches!(target, Target::Group(_)) {
            return Err(RouterError::Malformed("control messages must target a user"));
        }

        if is_response {
            let Target::User(peer) = target else {
                return Err(RouterError::Malformed("control messages must target a user"));
            };
            return self.answer_control(origin, sender, peer, &payload).await;
        }

        let now = Utc::now();
        let (record, room) = match target {
            Target::User(recipient) => {
                let mut message = NewMessage::private(sender, recipient, payload.content)
                    .content_type(payload.content_type.unwrap_or_default())
                    .extra(payload.extra)
                    .created_at(now);
                if kind == MessageKind::Control {
                    message = message.control();
                }
                let record = self.store.create_private_message(message).await?;
                (record, derive_private_name(sender, recipient))
            }
            Target::Group(group_id) => {
                let partition = self.catalog.partition_for_write(group_id, now).await?;
                let message = NewMessage::group(sender, group_id, payload.content)
                    .content_type(payload.content_type.unwrap_or_default())
                    .extra(payload.extra)
                    .created_at(now);
                let record = self.store.create_group_message(&partition, message).await?;
                (record, group_room_name(group_id))
            }
        };

        if let Err(e) = self.rooms.record_message(&room) {
            warn!(room = %room, error = %e, "Could not record room activity");
        }

        debug!(
            connection = %origin,
            message = %record.public_id,
            target = record.target_type.as_str(),
            "Message stored"
        );
        telemetry::record_message_routed(record.target_type.as_str());
        self.publish(MessageEvent::sent(record.clone(), Some(origin.clone())))
            .await;
        Ok(record)
    }

    async fn resolve_target(
        &self,
        sender: UserId,
        payload: &ChatPayload,
    ) -> Result<Target, RouterError> {
        let to_user = payload.recipient_username.is_some() || payload.recipient_id.is_some();
        match (to_user, payload.group_id) {
            (true, Some(_)) => Err(RouterError::Malformed(
                "message has both a user and a group target",
            )),
            (false, None) => Err(RouterError::Malformed("message has no target")),
            (false, Some(group_id)) => {
                if !self.groups.group_exists(group_id).await? {
                    return Err(RouterError::UnknownGroup(group_id));
                }
                if !self.groups.members(group_id).await?.contains(&sender) {
                    return Err(RouterError::NotGroupMember {
                        user_id: sender,
                        group_id,
                    });
                }
                Ok(Target::Group(group_id))
            }
            (true, None) => {
                if let Some(username) = &payload.recipient_username {
                    return self
                        .users
                        .find_by_username(username)
                        .await?
                        .map(Target::User)
                        .ok_or_else(|| RouterError::UnknownRecipient(username.clone()));
                }
                let recipient = payload.recipient_id.unwrap_or_default();
                if self.users.user_exists(recipient).await? {
                    Ok(Target::User(recipient))
                } else {
                    Err(RouterError::UnknownRecipient(recipient.to_string()))
                }
            }
        }
    }

    /// Record the answer to a pending control request and publish the
    /// updated request.
    async fn answer_control(
        &self,
        origin: &ConnectionId,
        responder: UserId,
        requester: UserId,
        payload: &ChatPayload,
    ) -> Result<MessageRecord, RouterError> {
        let request_id = payload
            .correlation_id
            .as_deref()
            .ok_or(RouterError::Malformed("control response without correlation id"))?;
        let outcome = payload
            .outcome
            .ok_or(RouterError::Malformed("control response without outcome"))?;

        let request = self
            .store
            .find_private_message(request_id)
            .await?
            .ok_or_else(|| RouterError::UnknownMessage(request_id.to_string()))?;

        if request.message_type != MessageKind::Control
            || request.sender_id != requester
            || request.recipient_id != Some(responder)
        {
            return Err(RouterError::Forbidden {
                user_id: responder,
                public_id: request_id.to_string(),
            });
        }
        if request.outcome != Some(ControlOutcome::Pending) {
            return Err(RouterError::Malformed("control request was already answered"));
        }

        let updated = self
            .store
            .update_private_message(request_id, MessageUpdate::answer(outcome))
            .await?;
        info!(
            message = %updated.public_id,
            outcome = %outcome,
            responder,
            "Control request answered"
        );
        telemetry::record_message_routed(TargetKind::User.as_str());
        self.publish(MessageEvent::sent(updated.clone(), Some(origin.clone())))
            .await;
        Ok(updated)
    }

    /// Mark a private message read by the user bound to `origin`.
    ///
    /// Reading an already read message changes nothing and publishes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Forbidden`] if the reader is not the recipient.
    pub async fn mark_read(
        &self,
        origin: &ConnectionId,
        public_id: &str,
    ) -> Result<MessageRecord, RouterError> {
        let reader = self.sender(origin)?;
        let record = self
            .store
            .find_private_message(public_id)
            .await?
            .ok_or_else(|| RouterError::UnknownMessage(public_id.to_string()))?;

        if record.recipient_id != Some(reader) {
            return Err(RouterError::Forbidden {
                user_id: reader,
                public_id: public_id.to_string(),
            });
        }
        if record.read_at.is_some() {
            return Ok(record);
        }

        let updated = self
            .store
            .update_private_message(public_id, MessageUpdate::mark_read(Utc::now()))
            .await?;
        self.publish(MessageEvent::read(updated.clone(), reader)).await;
        Ok(updated)
    }

    fn page_size(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_history_limit)
            .clamp(1, self.config.max_history_limit)
    }

    /// Newest messages between the caller and `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unbound caller or a storage failure.
    pub async fn private_history(
        &self,
        origin: &ConnectionId,
        peer: UserId,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, RouterError> {
        let user = self.sender(origin)?;
        Ok(self
            .store
            .recent_private_messages(user, peer, self.page_size(limit))
            .await?)
    }

    /// Newest messages of a group the caller belongs to.
    ///
    /// Reads the current partition and walks back one month at a time until
    /// the page is full or `lookback` older partitions were read.
    ///
    /// # Errors
    ///
    /// Returns an error for an unbound caller, a non-member, or a storage
    /// failure.
    pub async fn group_history(
        &self,
        origin: &ConnectionId,
        group_id: GroupId,
        limit: Option<usize>,
    ) -> Result<GroupHistory, RouterError> {
        const LOOKBACK: usize = 1;

        let user = self.sender(origin)?;
        if !self.groups.members(group_id).await?.contains(&user) {
            return Err(RouterError::NotGroupMember {
                user_id: user,
                group_id,
            });
        }

        let limit = self.page_size(limit);
        let Some(mut cursor) = self.catalog.cursor(group_id).await? else {
            return Ok(GroupHistory {
                partition: None,
                messages: Vec::new(),
            });
        };
        let partition = Some(cursor.partition.clone());

        let mut messages = self.store.recent_group_messages(&cursor, limit).await?;
        for _ in 0..LOOKBACK {
            if messages.len() >= limit {
                break;
            }
            let Some(previous) = cursor.previous() else {
                break;
            };
            cursor = previous;
            let older = self
                .store
                .recent_group_messages(&cursor, limit - messages.len())
                .await?;
            messages.extend(older);
        }

        Ok(GroupHistory {
            partition,
            messages,
        })
    }

    async fn publish(&self, event: MessageEvent) {
        let message = event.message.public_id.clone();
        if let Err(e) = self.bus.publish(event.into()).await {
            error!(message = %message, error = %e, "Message event was not delivered to the bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventHandler, HandlerError};
    use crate::event::{Event, EventKind};
    use crate::memory::{MemoryDirectory, MemoryStore};
    use crate::testing::BrokenStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parlor_protocol::MessageStatus;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<Event>>,
    }

    impl Collector {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(Event::kind).collect()
        }
    }

    #[async_trait]
    impl EventHandler for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        async fn handle(&self, event: &Event) -> Result<Option<Value>, HandlerError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(None)
        }
    }

    struct Fixture {
        router: MessageRouter,
        sessions: Arc<SessionRegistry>,
        rooms: Arc<RoomRegistry>,
        collector: Arc<Collector>,
    }

    fn fixture_with(store: Arc<dyn MessageStore>) -> Fixture {
        let sessions = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_user(1, "alice");
        directory.add_user(2, "bob");
        directory.add_user(3, "carol");
        directory.add_group(10, [1, 2]);

        let bus = Arc::new(EventBus::new());
        let collector = Arc::new(Collector::default());
        for kind in EventKind::ALL {
            bus.subscribe(kind, collector.clone());
        }

        let router = MessageRouter::new(
            RouterConfig::default(),
            sessions.clone(),
            rooms.clone(),
            directory.clone(),
            directory.clone(),
            store.clone(),
            Arc::new(PartitionCatalog::new(store)),
            bus,
        );
        sessions.bind(&"conn_a".into(), 1, "dev_a", "127.0.0.1").unwrap();
        sessions.bind(&"conn_b".into(), 2, "dev_b", "127.0.0.1").unwrap();
        sessions.bind(&"conn_c".into(), 3, "dev_c", "127.0.0.1").unwrap();

        Fixture {
            router,
            sessions,
            rooms,
            collector,
        }
    }

    fn fixture() -> (Fixture, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (fixture_with(store.clone()), store)
    }

    #[tokio::test]
    async fn test_private_message_persisted_and_published_once() {
        let (f, store) = fixture();

        let record = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_user("bob", "hi bob"))
            .await
            .unwrap();

        assert!(record.public_id.starts_with("pm_"));
        assert_eq!(record.sender_id, 1);
        assert_eq!(record.recipient_id, Some(2));
        assert!(record.has_status(MessageStatus::Unread));
        assert_eq!(store.message_count(), 1);
        assert_eq!(f.collector.kinds(), vec![EventKind::PrivateMessageSent]);
        assert_eq!(f.rooms.room_info("private_1_2").unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_rejected_without_side_effects() {
        let (f, store) = fixture();

        let err = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_user("mallory", "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::UnknownRecipient(ref name) if name == "mallory"));
        assert_eq!(err.code(), codes::NOT_FOUND);
        assert_eq!(store.message_count(), 0);
        assert!(f.collector.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_sender_rejected() {
        let (f, _) = fixture();
        f.sessions.unbind(&"conn_a".into());

        let err = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_user("bob", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownSender(_)));
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        let (f, _) = fixture();
        let origin = ConnectionId::from("conn_a");

        let empty = ChatPayload::to_user("bob", "   ");
        assert!(matches!(
            f.router.route(&origin, empty).await,
            Err(RouterError::Malformed(_))
        ));

        let mut both = ChatPayload::to_user("bob", "hi");
        both.group_id = Some(10);
        assert!(matches!(
            f.router.route(&origin, both).await,
            Err(RouterError::Malformed(_))
        ));

        let none = ChatPayload {
            content: "hi".into(),
            ..ChatPayload::default()
        };
        assert!(matches!(
            f.router.route(&origin, none).await,
            Err(RouterError::Malformed(_))
        ));
        assert!(f.collector.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_group_message_written_to_current_partition() {
        let (f, store) = fixture();

        let record = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_group(10, "hello all"))
            .await
            .unwrap();

        assert!(record.public_id.starts_with("gm_"));
        let partition = PartitionName::for_period(10, record.created_at);
        assert!(store.has_partition(&partition));
        assert_eq!(store.recorded_partition(10).await.unwrap(), Some(partition));
        assert_eq!(f.collector.kinds(), vec![EventKind::GroupMessageSent]);
    }

    #[tokio::test]
    async fn test_group_rejections() {
        let (f, store) = fixture();

        let err = f
            .router
            .route(&"conn_c".into(), ChatPayload::to_group(10, "let me in"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotGroupMember { user_id: 3, group_id: 10 }));

        let err = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_group(99, "anyone?"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownGroup(99)));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_and_publishes_nothing() {
        let store = Arc::new(BrokenStore::default());
        let f = fixture_with(store.clone());

        let err = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_user("bob", "hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::Persistence(_)));
        assert_eq!(err.code(), codes::STORAGE);
        assert_eq!(store.write_attempts(), 1);
        assert!(f.collector.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_control_request_and_answer() {
        let (f, _) = fixture();

        let request = ChatPayload {
            content: "share screen?".into(),
            message_type: Some(MessageKind::Control),
            recipient_id: Some(2),
            ..ChatPayload::default()
        };
        let request = f.router.route(&"conn_a".into(), request).await.unwrap();
        assert_eq!(request.outcome, Some(ControlOutcome::Pending));

        let answer = ChatPayload {
            message_type: Some(MessageKind::Control),
            recipient_id: Some(1),
            correlation_id: Some(request.public_id.clone()),
            outcome: Some(ControlOutcome::Accepted),
            ..ChatPayload::default()
        };

        // Only the addressee may answer.
        assert!(matches!(
            f.router.route(&"conn_c".into(), answer.clone()).await,
            Err(RouterError::Forbidden { .. })
        ));

        let answered = f.router.route(&"conn_b".into(), answer.clone()).await.unwrap();
        assert_eq!(answered.public_id, request.public_id);
        assert_eq!(answered.outcome, Some(ControlOutcome::Accepted));
        assert!(answered.updated_at >= request.updated_at);

        assert!(matches!(
            f.router.route(&"conn_b".into(), answer).await,
            Err(RouterError::Malformed(_))
        ));
        assert_eq!(
            f.collector.kinds(),
            vec![EventKind::PrivateMessageSent, EventKind::PrivateMessageSent]
        );
    }

    #[tokio::test]
    async fn test_control_message_to_group_rejected() {
        let (f, _) = fixture();
        let mut payload = ChatPayload::to_group(10, "vote?");
        payload.message_type = Some(MessageKind::Control);

        assert!(matches!(
            f.router.route(&"conn_a".into(), payload).await,
            Err(RouterError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_by_recipient_only() {
        let (f, _) = fixture();
        let record = f
            .router
            .route(&"conn_a".into(), ChatPayload::to_user("bob", "hi"))
            .await
            .unwrap();

        assert!(matches!(
            f.router.mark_read(&"conn_c".into(), &record.public_id).await,
            Err(RouterError::Forbidden { .. })
        ));

        let read = f.router.mark_read(&"conn_b".into(), &record.public_id).await.unwrap();
        assert!(read.has_status(MessageStatus::Read));
        assert!(read.read_at.is_some());

        // A second read is a no-op.
        f.router.mark_read(&"conn_b".into(), &record.public_id).await.unwrap();
        assert_eq!(
            f.collector.kinds(),
            vec![EventKind::PrivateMessageSent, EventKind::MessageRead]
        );
    }

    #[tokio::test]
    async fn test_history() {
        let (f, _) = fixture();
        for text in ["one", "two", "three"] {
            f.router
                .route(&"conn_a".into(), ChatPayload::to_user("bob", text))
                .await
                .unwrap();
        }
        f.router
            .route(&"conn_b".into(), ChatPayload::to_group(10, "group hello"))
            .await
            .unwrap();

        let page = f.router.private_history(&"conn_b".into(), 1, Some(2)).await.unwrap();
        assert_eq!(page.len(), 2);

        let group = f.router.group_history(&"conn_a".into(), 10, None).await.unwrap();
        assert_eq!(group.messages.len(), 1);
        assert!(group.partition.is_some());

        assert!(matches!(
            f.router.group_history(&"conn_c".into(), 10, None).await,
            Err(RouterError::NotGroupMember { .. })
        ));
    }

    #[tokio::test]
    async fn test_group_history_tops_up_from_previous_month() {
        let (f, store) = fixture();
        let march_at = Utc.with_ymd_and_hms(2024, 3, 31, 23, 0, 0).unwrap();
        let april_at = Utc.with_ymd_and_hms(2024, 4, 2, 9, 0, 0).unwrap();
        let march = PartitionName::for_period(10, march_at);
        let april = PartitionName::for_period(10, april_at);

        store.ensure_partition(&march).await.unwrap();
        store.record_partition_name(10, &march).await.unwrap();
        let old = store
            .create_group_message(
                &march,
                NewMessage::group(2, 10, "march").created_at(march_at),
            )
            .await
            .unwrap();
        store.ensure_partition(&april).await.unwrap();
        store.record_partition_name(10, &april).await.unwrap();
        let new = store
            .create_group_message(
                &april,
                NewMessage::group(1, 10, "april").created_at(april_at),
            )
            .await
            .unwrap();

        let page = f.router.group_history(&"conn_a".into(), 10, Some(5)).await.unwrap();
        assert_eq!(page.partition, Some(april));
        assert_eq!(page.messages, vec![new.clone(), old]);

        // A full page from the current month does not look back.
        let page = f.router.group_history(&"conn_a".into(), 10, Some(1)).await.unwrap();
        assert_eq!(page.messages, vec![new]);
    }
}
